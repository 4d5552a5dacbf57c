//! HTTP surface
//!
//! - `GET  /health`
//! - `GET  /references`, `POST /references`
//! - `GET  /references/{name}`, `GET /references/{name}/artifact`
//! - `GET  /references/{name}/versions`
//! - `POST /references/{name}/refresh`, `POST /references/{name}/prune`
//! - `GET  /jobs`
//!
//! Errors are JSON bodies of the form `{"error": "<code>", "message": "..."}`.

use refcache_core::{
    SeedEntry, Service, SnapshotError, StoreError, Trigger, TriggerError, TriggerOutcome,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use warp::http::header::{HeaderValue, CONTENT_TYPE};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
        }
    }

    fn reply(self, status: StatusCode) -> Response {
        warp::reply::with_status(warp::reply::json(&self), status).into_response()
    }
}

/// `POST /references` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(flatten)]
    pub entry: SeedEntry,
}

/// `POST /references/{name}/prune` body; defaults to the configured count
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneRequest {
    pub retain: Option<usize>,
}

/// Versions removed by a prune
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneResponse {
    pub removed: Vec<u64>,
}

/// All routes over `service`
pub fn routes(service: Service) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let health = warp::path!("health")
        .and(warp::get())
        .and(with_service(service.clone()))
        .then(health);

    let list = warp::path!("references")
        .and(warp::get())
        .and(with_service(service.clone()))
        .then(list_references);

    let register = warp::path!("references")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_service(service.clone()))
        .then(register_reference);

    let show = warp::path!("references" / String)
        .and(warp::get())
        .and(with_service(service.clone()))
        .then(show_reference);

    let artifact = warp::path!("references" / String / "artifact")
        .and(warp::get())
        .and(with_service(service.clone()))
        .then(read_artifact);

    let versions = warp::path!("references" / String / "versions")
        .and(warp::get())
        .and(with_service(service.clone()))
        .then(list_versions);

    let refresh = warp::path!("references" / String / "refresh")
        .and(warp::post())
        .and(with_service(service.clone()))
        .then(trigger_refresh);

    let prune = warp::path!("references" / String / "prune")
        .and(warp::post())
        .and(optional_json::<PruneRequest>())
        .and(with_service(service.clone()))
        .then(prune_versions);

    let jobs = warp::path!("jobs")
        .and(warp::get())
        .and(with_service(service))
        .then(list_jobs);

    health
        .or(list)
        .unify()
        .or(register)
        .unify()
        .or(show)
        .unify()
        .or(artifact)
        .unify()
        .or(versions)
        .unify()
        .or(refresh)
        .unify()
        .or(prune)
        .unify()
        .or(jobs)
        .unify()
        .with(warp::trace::request())
        .recover(handle_rejection)
}

fn with_service(service: Service) -> impl Filter<Extract = (Service,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

#[derive(Debug)]
struct InvalidBody(String);

impl warp::reject::Reject for InvalidBody {}

// Empty bodies fall back to the default request
fn optional_json<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: for<'de> Deserialize<'de> + Default + Send + 'static,
{
    warp::body::content_length_limit(MAX_BODY_BYTES)
        .and(warp::body::bytes())
        .and_then(|body: warp::hyper::body::Bytes| async move {
            if body.is_empty() {
                return Ok(T::default());
            }
            serde_json::from_slice(&body).map_err(|e| warp::reject::custom(InvalidBody(e.to_string())))
        })
}

async fn health(service: Service) -> Response {
    let report = service.health().await;
    let status = if report.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    warp::reply::with_status(warp::reply::json(&report), status).into_response()
}

async fn list_references(service: Service) -> Response {
    let references: Vec<_> = service.reader().list().iter().map(|r| (**r).clone()).collect();
    warp::reply::json(&references).into_response()
}

async fn register_reference(request: RegisterRequest, service: Service) -> Response {
    match service.store().register(&request.name, &request.entry).await {
        Ok(reference) => warp::reply::with_status(warp::reply::json(&*reference), StatusCode::CREATED).into_response(),
        Err(StoreError::AlreadyExists(name)) => {
            ApiError::new("already_exists", format!("reference {name} already exists")).reply(StatusCode::CONFLICT)
        }
        Err(StoreError::Artifact(refcache_artifact::ArtifactError::InvalidName { name, reason })) => {
            ApiError::new("invalid_name", format!("{name:?}: {reason}")).reply(StatusCode::BAD_REQUEST)
        }
        Err(e) => internal(&e),
    }
}

async fn show_reference(name: String, service: Service) -> Response {
    match service.reader().snapshot(&name).await {
        Ok(snapshot) => warp::reply::json(&snapshot.metadata()).into_response(),
        Err(e) => snapshot_error(&e),
    }
}

async fn read_artifact(name: String, service: Service) -> Response {
    let snapshot = match service.reader().snapshot(&name).await {
        Ok(snapshot) => snapshot,
        Err(e) => return snapshot_error(&e),
    };

    let version = &snapshot.version;
    let mut response = Response::new(snapshot.payload.to_vec().into());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(version.kind.content_type()));
    headers.insert("x-refcache-version", HeaderValue::from(version.version_id.get()));
    headers.insert(
        "x-refcache-status",
        HeaderValue::from_static(status_name(snapshot.reference.status)),
    );
    if let Ok(checksum) = HeaderValue::from_str(&version.checksum.to_string()) {
        headers.insert("x-refcache-checksum", checksum);
    }
    if snapshot.is_overdue {
        headers.insert("x-refcache-overdue", HeaderValue::from_static("true"));
    }
    response
}

async fn list_versions(name: String, service: Service) -> Response {
    if let Err(e) = service.reader().reference(&name) {
        return snapshot_error(&e);
    }
    warp::reply::json(&service.reader().versions(&name)).into_response()
}

async fn trigger_refresh(name: String, service: Service) -> Response {
    match service.scheduler().trigger(&name, Trigger::OnDemand).await {
        Ok(outcome) => accepted(&outcome),
        Err(TriggerError::UnknownReference(name)) => {
            ApiError::new("not_found", format!("unknown reference {name}")).reply(StatusCode::NOT_FOUND)
        }
        Err(TriggerError::ShuttingDown) => {
            ApiError::new("shutting_down", "service is shutting down").reply(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(e) => internal(&e),
    }
}

async fn prune_versions(name: String, request: PruneRequest, service: Service) -> Response {
    if let Err(e) = service.reader().reference(&name) {
        return snapshot_error(&e);
    }
    let retain = request.retain.unwrap_or(service.config().retain_count);
    if retain == 0 {
        return ApiError::new("invalid_request", "retain must be at least 1").reply(StatusCode::BAD_REQUEST);
    }
    match service.cache().prune(&name, retain).await {
        Ok(removed) => warp::reply::json(&PruneResponse {
            removed: removed.iter().map(|v| v.get()).collect(),
        })
        .into_response(),
        Err(e) => internal(&e),
    }
}

async fn list_jobs(service: Service) -> Response {
    warp::reply::json(&service.scheduler().jobs()).into_response()
}

fn accepted(outcome: &TriggerOutcome) -> Response {
    warp::reply::with_status(warp::reply::json(outcome), StatusCode::ACCEPTED).into_response()
}

fn snapshot_error(error: &SnapshotError) -> Response {
    match error {
        SnapshotError::UnknownReference(name) => {
            ApiError::new("not_found", format!("unknown reference {name}")).reply(StatusCode::NOT_FOUND)
        }
        SnapshotError::NotYetAvailable(name) => ApiError::new(
            "not_yet_available",
            format!("{name} has not been refreshed successfully yet"),
        )
        .reply(StatusCode::NOT_FOUND),
        SnapshotError::Storage(e) => internal(e),
    }
}

fn internal(error: &dyn std::fmt::Display) -> Response {
    tracing::error!(error = %error, "request failed");
    ApiError::new("internal", error.to_string()).reply(StatusCode::INTERNAL_SERVER_ERROR)
}

fn status_name(status: refcache_core::RefStatus) -> &'static str {
    match status {
        refcache_core::RefStatus::Fresh => "fresh",
        refcache_core::RefStatus::Stale => "stale",
        refcache_core::RefStatus::Refreshing => "refreshing",
        refcache_core::RefStatus::Failed => "failed",
    }
}

async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    let (status, error) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, ApiError::new("not_found", "no such route"))
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, ApiError::new("invalid_request", e.to_string()))
    } else if let Some(InvalidBody(message)) = rejection.find::<InvalidBody>() {
        (StatusCode::BAD_REQUEST, ApiError::new("invalid_request", message.clone()))
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, ApiError::new("invalid_request", "body too large"))
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, ApiError::new("method_not_allowed", "method not allowed"))
    } else {
        (StatusCode::BAD_REQUEST, ApiError::new("invalid_request", format!("{rejection:?}")))
    };
    Ok(error.reply(status))
}
