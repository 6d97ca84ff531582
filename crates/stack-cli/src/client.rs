//! HTTP client for the CLI login endpoints
//!
//! Three calls, all unauthenticated JSON POSTs:
//! 1. `/api/v1/auth/cli` starts a login and returns the codes
//! 2. `/api/v1/auth/cli/poll` reports `waiting`, `success` or `expired`
//! 3. `/api/v1/auth/cli/cancel` expires the request early
//!
//! Network failures and 5xx responses map to `Error::Transport` so the
//! polling loop retries them; everything else is terminal.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use stack_auth::{Error, LoginPoller, PollStatus, Result};
use tracing::debug;

/// Per-request timeout; polls are cheap so a slow answer means trouble.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response to starting a login.
#[derive(Deserialize)]
pub struct LoginStart {
    pub login_code: String,
    pub polling_code: String,
    /// Unix milliseconds
    pub expires_at: u64,
    pub confirmation_url: String,
}

pub struct AuthClient {
    http: reqwest::Client,
    api_url: String,
}

impl AuthClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("POST {path} failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        Err(status_error(status, &body))
    }

    pub async fn start_login(&self) -> Result<LoginStart> {
        self.post("/api/v1/auth/cli", json!({}))
            .await?
            .json::<LoginStart>()
            .await
            .map_err(|e| Error::Transport(format!("invalid login response: {e}")))
    }

    /// Expire a pending login early.
    pub async fn cancel(&self, polling_code: &str) -> Result<()> {
        self.post(
            "/api/v1/auth/cli/cancel",
            json!({ "polling_code": polling_code }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LoginPoller for AuthClient {
    async fn poll(&self, polling_code: &str) -> Result<PollStatus> {
        let status = self
            .post(
                "/api/v1/auth/cli/poll",
                json!({ "polling_code": polling_code }),
            )
            .await?
            .json::<PollStatus>()
            .await
            .map_err(|e| Error::Transport(format!("invalid poll response: {e}")))?;
        debug!(status = status.label(), "polled login status");
        Ok(status)
    }
}

/// Map a non-success response to the error the polling loop should see.
fn status_error(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Error::LoginCodeUnknown,
        StatusCode::GONE => Error::LoginCodeExpired,
        _ => Error::Transport(format!("server returned {status}: {body}")),
    }
}
