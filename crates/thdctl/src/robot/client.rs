//! Hetzner Robot API client implementation.
//!
//! Uses HTTP basic auth with the Robot webservice user. Requests are
//! form-encoded, responses are JSON.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    ErrorResponse, Firewall, FirewallResponse, RescueDetails, RescueRequest, RescueResponse,
    ResetRequest, ServerDetails, ServerResponse,
};
use super::{RobotApi, RobotError};

/// Base URL for Hetzner Robot API.
pub const API_BASE_URL: &str = "https://robot-ws.your-server.de";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Hetzner Robot webservice client.
#[derive(Clone)]
pub struct RobotClient {
    /// HTTP client.
    client: Client,
    /// API base URL, without trailing slash.
    base_url: String,
    /// Robot webservice username.
    username: String,
    /// Robot webservice password.
    password: String,
}

impl std::fmt::Debug for RobotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl RobotClient {
    /// Create a new Robot client.
    ///
    /// # Arguments
    /// * `username` - Robot webservice username
    /// * `password` - Robot webservice password
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, RobotError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Point the client at a different endpoint (used by tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, RobotError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request with form data.
    async fn post_form<T, B>(&self, path: &str, body: &B) -> Result<T, RobotError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request (form)");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request whose response body is not needed.
    async fn post_form_empty<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), RobotError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request (empty response)");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::error_from_body(status, &text))
        }
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RobotError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                RobotError::Serialization(e)
            })
        } else {
            Err(Self::error_from_body(status, &text))
        }
    }

    /// Map a non-success response to an error, using Robot's error body when present.
    fn error_from_body(status: StatusCode, text: &str) -> RobotError {
        let (code, message) = match serde_json::from_str::<ErrorResponse>(text) {
            Ok(body) => (body.error.code, body.error.message),
            Err(_) => (String::new(), text.to_string()),
        };

        if status == StatusCode::NOT_FOUND {
            RobotError::NotFound(if message.is_empty() { code } else { message })
        } else {
            RobotError::Api {
                status: status.as_u16(),
                code,
                message,
            }
        }
    }
}

#[async_trait]
impl RobotApi for RobotClient {
    async fn get_server(&self, server_number: u32) -> Result<ServerDetails, RobotError> {
        let response: ServerResponse = self.get(&format!("/server/{server_number}")).await?;
        Ok(response.server)
    }

    async fn list_servers(&self) -> Result<Vec<ServerDetails>, RobotError> {
        let response: Vec<ServerResponse> = self.get("/server").await?;
        Ok(response.into_iter().map(|s| s.server).collect())
    }

    async fn get_rescue(&self, server_number: u32) -> Result<RescueDetails, RobotError> {
        let response: RescueResponse = self.get(&format!("/boot/{server_number}/rescue")).await?;
        Ok(response.rescue)
    }

    async fn enable_rescue(&self, server_number: u32) -> Result<RescueDetails, RobotError> {
        let req = RescueRequest {
            os: "linux".to_string(),
            authorized_key: vec![],
        };
        let response: RescueResponse = self
            .post_form(&format!("/boot/{server_number}/rescue"), &req)
            .await?;

        debug!(server_number, active = response.rescue.active, "Parsed rescue response");
        info!(server_number, "Rescue system enabled");
        Ok(response.rescue)
    }

    async fn reset_server(&self, server_number: u32) -> Result<(), RobotError> {
        let req = ResetRequest {
            reset_type: "hw".to_string(),
        };
        self.post_form_empty(&format!("/reset/{server_number}"), &req)
            .await?;

        info!(server_number, "Hardware reset triggered");
        Ok(())
    }

    async fn get_firewall(&self, server_number: u32) -> Result<Firewall, RobotError> {
        let response: FirewallResponse = self.get(&format!("/firewall/{server_number}")).await?;
        Ok(response.firewall)
    }
}
