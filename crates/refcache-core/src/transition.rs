//! Reference status transitions, as a table checked before every store write

use crate::reference::RefStatus;

/// Statuses reachable from `from` in one step.
///
/// `Fresh -> Stale` marks a reference for refresh without starting a job.
/// `Refreshing -> Stale` releases a job abandoned at shutdown.
pub fn allowed_transitions(from: RefStatus) -> &'static [RefStatus] {
    use RefStatus::{Failed, Fresh, Refreshing, Stale};
    match from {
        Stale => &[Refreshing],
        Fresh => &[Refreshing, Stale],
        Failed => &[Refreshing],
        Refreshing => &[Fresh, Failed, Stale],
    }
}

/// Validates a status transition.
pub fn is_allowed(from: RefStatus, to: RefStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = RefStatus> {
        prop_oneof![
            Just(RefStatus::Fresh),
            Just(RefStatus::Stale),
            Just(RefStatus::Refreshing),
            Just(RefStatus::Failed),
        ]
    }

    #[test]
    fn every_refresh_starts_from_a_resting_state() {
        for from in [RefStatus::Fresh, RefStatus::Stale, RefStatus::Failed] {
            assert!(is_allowed(from, RefStatus::Refreshing), "{from:?}");
        }
        assert!(!is_allowed(RefStatus::Refreshing, RefStatus::Refreshing));
    }

    #[test]
    fn outcomes_only_follow_refreshing() {
        for from in [RefStatus::Fresh, RefStatus::Stale, RefStatus::Failed] {
            assert!(!is_allowed(from, RefStatus::Failed));
            assert!(!is_allowed(from, RefStatus::Fresh));
        }
    }

    proptest! {
        #[test]
        fn no_self_transitions(s in any_status()) {
            prop_assert!(!is_allowed(s, s));
        }

        #[test]
        fn every_status_can_reach_fresh(s in any_status()) {
            // at most two steps: via Refreshing
            let direct = is_allowed(s, RefStatus::Fresh);
            let via = is_allowed(s, RefStatus::Refreshing)
                && is_allowed(RefStatus::Refreshing, RefStatus::Fresh);
            prop_assert!(direct || via);
        }
    }
}
