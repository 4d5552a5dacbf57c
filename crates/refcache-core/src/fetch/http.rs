use super::{FetchedArtifact, Fetcher};
use crate::error::FetchError;
use crate::reference::Reference;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// GETs `source_descriptor.url`
///
/// Descriptor fields: `url` (required), `headers` and `query` (optional
/// string maps).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialized
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("refcache/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn source_type(&self) -> &str {
        "http"
    }

    async fn fetch(&self, reference: &Reference) -> Result<FetchedArtifact, FetchError> {
        let descriptor = &reference.source_descriptor;
        let url = descriptor
            .get("url")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| FetchError::permanent("http source needs a \"url\""))?;

        let mut request = self.client.get(url);
        if let Some(headers) = descriptor.get("headers").and_then(serde_json::Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        if let Some(query) = descriptor.get("query").and_then(serde_json::Value::as_object) {
            let pairs: Vec<(&str, String)> = query
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str().map_or_else(|| v.to_string(), str::to_string)))
                .collect();
            request = request.query(&pairs);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        let body = response.bytes().await.map_err(classify_transport)?;

        tracing::debug!(reference = %reference.name, status = status.as_u16(), size = body.len(), "http fetch complete");
        Ok(FetchedArtifact {
            kind: reference.kind,
            bytes: body.to_vec(),
        })
    }
}

fn classify_status(status: StatusCode) -> FetchError {
    let msg = format!("upstream returned {status}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        FetchError::Transient(msg)
    } else {
        FetchError::Permanent(msg)
    }
}

fn classify_transport(error: reqwest::Error) -> FetchError {
    if error.is_builder() {
        FetchError::permanent(format!("invalid request: {error}"))
    } else {
        FetchError::transient(error.to_string())
    }
}
