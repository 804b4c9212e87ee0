//! HTTP client for a running daemon.

use recodex_daemon::service::{ConfigReport, StatusReport, SubmittedJob, WorkersReport};
use recodex_daemon::{RecordView, StatisticsReport};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Default daemon API address.
pub const DEFAULT_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("daemon returned {status}: {message}")]
    Api { status: u16, message: String },
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn jobs(&self, status: Option<&str>) -> Result<Vec<RecordView>, ClientError> {
        let mut request = self.http.get(self.url("/jobs"));
        if let Some(status) = status {
            request = request.query(&[("status", status)]);
        }
        Self::decode(request.send().await?).await
    }

    pub async fn job(&self, id: u64) -> Result<RecordView, ClientError> {
        let response = self.http.get(self.url(&format!("/jobs/{}", id))).send().await?;
        Self::decode(response).await
    }

    pub async fn submit(
        &self,
        source: PathBuf,
        profile: &str,
        destination: Option<PathBuf>,
    ) -> Result<SubmittedJob, ClientError> {
        let body = json!({
            "source": source,
            "profile": profile,
            "destination": destination,
        });
        let response = self.http.post(self.url("/jobs")).json(&body).send().await?;
        Self::decode(response).await
    }

    pub async fn reprocess(&self, id: u64) -> Result<RecordView, ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/jobs/{}/reprocess", id)))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn stats(&self) -> Result<StatisticsReport, ClientError> {
        Self::decode(self.http.get(self.url("/stats")).send().await?).await
    }

    pub async fn workers(&self) -> Result<WorkersReport, ClientError> {
        Self::decode(self.http.get(self.url("/workers")).send().await?).await
    }

    pub async fn config(&self) -> Result<ConfigReport, ClientError> {
        Self::decode(self.http.get(self.url("/config")).send().await?).await
    }

    pub async fn status(&self) -> Result<StatusReport, ClientError> {
        Self::decode(self.http.get(self.url("/status")).send().await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = ApiClient::new("http://localhost:8000/");
        assert_eq!(client.url("/jobs"), "http://localhost:8000/jobs");
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_http_error() {
        // Port 9 (discard) is not expected to run an HTTP server
        let client = ApiClient::new("http://127.0.0.1:9");
        assert!(matches!(client.stats().await, Err(ClientError::Http(_))));
    }
}
