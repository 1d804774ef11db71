//! HTTP client for the swarm backend API

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::store::{MessageSink, PersistedMessage};
use crate::types::{Message, MessageMetadata};

use super::{PollResponse, StreamBackend};

/// HTTP client for the swarm backend
#[derive(Debug, Clone)]
pub struct BackendClient {
    config: BackendConfig,
    http_client: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// Create a new backend client from configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config.base_url.trim().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
            base_url,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, session_id: &str, path: &str) -> String {
        format!(
            "{}/sessions/{}/{}",
            self.base_url,
            urlencoding::encode(session_id),
            path
        )
    }

    /// Fetch chunks emitted after `offset`.
    pub async fn poll_stream(&self, session_id: &str, offset: u64) -> Result<PollResponse> {
        let url = self.session_url(session_id, "stream");

        let response = self
            .http_client
            .get(&url)
            .query(&[("offset", offset)])
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let response = check_status(response, session_id).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Http(format!("failed to parse stream response: {}", e)))
    }

    /// Stop the remote run. Stopping an unknown session is not an error.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let url = self.session_url(session_id, "stop");

        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(session_id, "stop requested for unknown session");
            return Ok(());
        }
        check_status(response, session_id).await?;
        Ok(())
    }

    /// Write a finished message back to the backend.
    pub async fn create_message(
        &self,
        session_id: &str,
        message: &Message,
    ) -> Result<PersistedMessage> {
        let url = self.session_url(session_id, "messages");

        let request = CreateMessageRequest {
            role: message.role.as_str(),
            content: &message.content,
            status: message.status.as_str(),
            metadata: &message.metadata,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let response = check_status(response, session_id).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Http(format!("failed to parse message response: {}", e)))
    }

    /// Check if the backend is reachable
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);

        match self.http_client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::debug!(error = %e, "health check failed");
                Ok(false)
            }
        }
    }
}

/// Map non-success responses to typed errors.
async fn check_status(response: reqwest::Response, session_id: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::SessionNotFound(session_id.to_string()));
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(Error::Backend {
        status: status.as_u16(),
        message,
    })
}

/// Request body for POST /sessions/{id}/messages
#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
    status: &'a str,
    metadata: &'a MessageMetadata,
}

#[async_trait]
impl StreamBackend for BackendClient {
    async fn poll(&self, session_id: &str, offset: u64) -> Result<PollResponse> {
        self.poll_stream(session_id, offset).await
    }

    async fn stop(&self, session_id: &str) -> Result<()> {
        self.stop_session(session_id).await
    }
}

#[async_trait]
impl MessageSink for BackendClient {
    async fn persist_message(
        &self,
        session_id: &str,
        message: &Message,
    ) -> Result<PersistedMessage> {
        self.create_message(session_id, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_rejects_invalid_config() {
        let config = BackendConfig {
            base_url: "localhost:8000".to_string(),
            ..Default::default()
        };
        assert!(BackendClient::new(config).is_err());
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let config = BackendConfig {
            base_url: "http://localhost:8000/api/".to_string(),
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let client = BackendClient::new(config).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000/api");
        assert_eq!(
            client.session_url("run 1", "stream"),
            "http://localhost:8000/api/sessions/run%201/stream"
        );
    }

    #[test]
    fn test_client_rejects_bad_api_key() {
        let config = BackendConfig {
            api_key: Some("bad\nkey".to_string()),
            ..Default::default()
        };
        assert!(BackendClient::new(config).is_err());
    }
}
