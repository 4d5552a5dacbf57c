//! Payload checksums
//!
//! Provides [`Checksum`], a 32-byte Blake3 digest recorded with every
//! artifact version and verified whenever a payload is read back from disk.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte Blake3 digest of an artifact payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest a complete payload
    #[inline]
    #[must_use]
    pub fn of(payload: &[u8]) -> Self {
        Self(*blake3::hash(payload).as_bytes())
    }

    /// Check that `payload` hashes to this checksum
    #[inline]
    #[must_use]
    pub fn matches(&self, payload: &[u8]) -> bool {
        // blake3::Hash equality is constant time
        blake3::Hash::from(self.0) == blake3::hash(payload)
    }

    /// First 16 hex chars, for log lines
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChecksumError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }
}

// Metadata files are JSON, so the hex form is the only encoding needed
impl serde::Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors parsing a checksum from its hex form
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("invalid checksum length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        assert_eq!(Checksum::of(b"rain: 12mm"), Checksum::of(b"rain: 12mm"));
        assert_ne!(Checksum::of(b"rain: 12mm"), Checksum::of(b"rain: 13mm"));
    }

    #[test]
    fn matches_detects_corruption() {
        let sum = Checksum::of(b"payload");
        assert!(sum.matches(b"payload"));
        assert!(!sum.matches(b"paylaod"));
    }

    #[test]
    fn display_and_parse() {
        let sum = Checksum::of(b"x");
        let parsed: Checksum = sum.to_string().parse().unwrap();
        assert_eq!(sum, parsed);
        assert!(sum.to_string().starts_with(&sum.short()));
    }

    #[test]
    fn parse_rejects_wrong_length() {
        let err = "abcd".parse::<Checksum>().unwrap_err();
        assert!(matches!(err, ChecksumError::InvalidLength(2)));
    }

    #[test]
    fn serde_uses_hex_string() {
        let sum = Checksum::of(b"x");
        let json = serde_json::to_string(&sum).unwrap();
        assert_eq!(json, format!("\"{sum}\""));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sum);
    }
}
