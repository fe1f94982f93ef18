//! HTTP client for the orchestrator API, scoped to a single run.
//!
//! Every request carries the run's bearer token. The wrapper only ever
//! talks to the API through this client.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::path::Path;
use thiserror::Error;
use yinyo_core::{archive, Event};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to orchestrator failed: {0}")]
    Request(String),

    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("archive error: {0}")]
    Archive(#[from] yinyo_core::ArchiveError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Request(err.to_string())
    }
}

impl ClientError {
    /// Whether the error is the API saying the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }
}

/// Error response body from the API.
#[derive(Debug, serde::Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Client for one run's slice of the orchestrator API.
#[derive(Debug, Clone)]
pub struct RunClient {
    base_url: String,
    run_id: String,
    token: String,
    http: reqwest::Client,
}

impl RunClient {
    pub fn new(base_url: &str, run_id: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            run_id: run_id.to_string(),
            token: token.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/runs/{}{}", self.base_url, self.run_id, path)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.token)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| "unknown error".to_string());
        ClientError::Http { status, message }
    }

    /// Post an event to the run's stream. The response carries the event
    /// with its assigned id.
    pub async fn create_event(&self, event: &Event) -> Result<Event, ClientError> {
        let response = self
            .http
            .post(self.url("/events"))
            .headers(self.headers())
            .json(event)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn get_archive(&self, path: &str) -> Result<bytes::Bytes, ClientError> {
        let response = self
            .http
            .get(self.url(path))
            .headers(self.headers())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.bytes().await?)
    }

    /// Download and extract the scraper source into `dir`.
    pub async fn get_app_to_directory(&self, dir: &Path) -> Result<(), ClientError> {
        let bytes = self.get_archive("/app").await?;
        archive::extract_to_directory(bytes.as_ref(), dir)?;
        Ok(())
    }

    /// Download and extract the build cache into `dir`. A missing cache
    /// is not an error; the build just starts cold.
    pub async fn get_cache_to_directory(&self, dir: &Path) -> Result<(), ClientError> {
        match self.get_archive("/cache").await {
            Ok(bytes) => {
                archive::extract_to_directory(bytes.as_ref(), dir)?;
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Archive `dir` and upload it as the run's build cache.
    pub async fn put_cache_from_directory(&self, dir: &Path) -> Result<(), ClientError> {
        let bytes = archive::create_from_directory(dir)?;
        let response = self
            .http
            .put(self.url("/cache"))
            .headers(self.headers())
            .body(bytes)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    /// Upload the scraper's output file.
    pub async fn put_output_from_file(&self, path: &Path) -> Result<(), ClientError> {
        let contents = tokio::fs::read(path).await?;
        let response = self
            .http
            .put(self.url("/output"))
            .headers(self.headers())
            .body(contents)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use yinyo_core::Stage;

    #[test]
    fn client_trims_trailing_slash() {
        let client = RunClient::new("http://localhost:8080/", "run-abc", "token");
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn urls_are_scoped_to_the_run() {
        let client = RunClient::new("http://localhost:8080", "run-abc", "token");
        assert_eq!(
            client.url("/events"),
            "http://localhost:8080/runs/run-abc/events"
        );
        assert_eq!(client.url(""), "http://localhost:8080/runs/run-abc");
    }

    #[test]
    fn headers_carry_the_bearer_token() {
        let client = RunClient::new("http://localhost:8080", "run-abc", "supersecret");
        let headers = client.headers();
        assert_eq!(
            headers.get(AUTHORIZATION).unwrap(),
            "Bearer supersecret"
        );
    }

    #[test]
    fn only_404_responses_count_as_not_found() {
        let missing = ClientError::Http {
            status: 404,
            message: "not found".to_string(),
        };
        assert!(missing.is_not_found());

        let forbidden = ClientError::Http {
            status: 403,
            message: "Forbidden".to_string(),
        };
        assert!(!forbidden.is_not_found());
        assert!(!ClientError::Request("no route to host".to_string()).is_not_found());
    }

    #[tokio::test]
    async fn create_event_fails_when_api_is_unreachable() {
        let client = RunClient::new("http://127.0.0.1:19999", "run-abc", "token");
        let result = client
            .create_event(&Event::start(Utc::now(), Stage::Build))
            .await;
        assert!(matches!(result, Err(ClientError::Request(_))));
    }
}
