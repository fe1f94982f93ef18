//! Optional external authorization hook.
//!
//! When an endpoint is configured, run creation and run start are both
//! checked against it before proceeding; either can be denied. Without an
//! endpoint every request is allowed, which is the single-tenant default.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("authorization hook error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, AuthzError>;

#[derive(Debug, Serialize)]
struct AuthzRequest<'a> {
    operation: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<&'a str>,
}

/// Client for the authorization collaborator.
#[derive(Debug, Clone)]
pub struct AuthzClient {
    endpoint: Option<String>,
    http: reqwest::Client,
}

impl AuthzClient {
    pub fn new(endpoint: Option<String>, http: reqwest::Client) -> Self {
        Self { endpoint, http }
    }

    /// Hook consulted when a run is created.
    pub async fn check_create(&self, api_key: Option<&str>) -> Result<()> {
        self.check(AuthzRequest {
            operation: "create",
            api_key,
            run_id: None,
        })
        .await
    }

    /// Hook consulted when a run is started.
    pub async fn check_start(&self, run_id: &str) -> Result<()> {
        self.check(AuthzRequest {
            operation: "start",
            api_key: None,
            run_id: Some(run_id),
        })
        .await
    }

    async fn check(&self, request: AuthzRequest<'_>) -> Result<()> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(());
        };
        let response = self
            .http
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AuthzError::Backend(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("request denied"));
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            Err(AuthzError::NotAllowed(message))
        } else {
            Err(AuthzError::Backend(format!("{status}: {message}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_endpoint_allows_everything() {
        let authz = AuthzClient::new(None, reqwest::Client::new());
        authz.check_create(Some("key")).await.unwrap();
        authz.check_start("run-abc").await.unwrap();
    }
}
