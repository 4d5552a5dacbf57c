//! Thin HTTP client used by the CLI subcommands that talk to a running
//! service

use crate::api::{ApiError, PruneRequest, PruneResponse, RegisterRequest};
use anyhow::{bail, Context};
use refcache_core::{Reference, SeedEntry};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    /// # Errors
    /// Fails if the HTTP client cannot be built
    pub fn new(base: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL for a service bound to `bind`; wildcard addresses map to
    /// loopback
    #[must_use]
    pub fn base_for(bind: SocketAddr) -> String {
        let host = if bind.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            bind.ip().to_string()
        };
        format!("http://{host}:{}", bind.port())
    }

    #[inline]
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// # Errors
    /// Fails on transport errors or non-success responses
    pub async fn list(&self) -> anyhow::Result<Vec<Reference>> {
        let response = self.http.get(self.url("/references")).send().await?;
        decode(response).await
    }

    /// # Errors
    /// Fails on transport errors or non-success responses
    pub async fn refresh(&self, name: &str) -> anyhow::Result<serde_json::Value> {
        let response = self
            .http
            .post(self.url(&format!("/references/{name}/refresh")))
            .send()
            .await?;
        decode(response).await
    }

    /// # Errors
    /// Fails on transport errors or non-success responses
    pub async fn register(&self, name: &str, entry: SeedEntry) -> anyhow::Result<Reference> {
        let request = RegisterRequest {
            name: name.to_string(),
            entry,
        };
        let response = self
            .http
            .post(self.url("/references"))
            .json(&request)
            .send()
            .await?;
        decode(response).await
    }

    /// # Errors
    /// Fails on transport errors or non-success responses
    pub async fn prune(&self, name: &str, retain: Option<usize>) -> anyhow::Result<PruneResponse> {
        let response = self
            .http
            .post(self.url(&format!("/references/{name}/prune")))
            .json(&PruneRequest { retain })
            .send()
            .await?;
        decode(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
    let status = response.status();
    let url = response.url().clone();
    if status.is_success() {
        return response
            .json()
            .await
            .with_context(|| format!("decoding response from {url}"));
    }
    match response.json::<ApiError>().await {
        Ok(error) => bail!("{status}: {} ({})", error.message, error.error),
        Err(_) => bail!("{status} from {url}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_bind_maps_to_loopback() {
        assert_eq!(
            ApiClient::base_for("0.0.0.0:8080".parse().unwrap()),
            "http://127.0.0.1:8080"
        );
        assert_eq!(
            ApiClient::base_for("10.0.0.5:9000".parse().unwrap()),
            "http://10.0.0.5:9000"
        );
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = ApiClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.url("/health"), "http://localhost:8080/health");
    }
}
