//! HTTP surface of the authority
//!
//! Endpoints:
//! - GET    /health                                 - key set status, uptime
//! - GET    /metrics                                - Prometheus text
//! - GET    /.well-known/jwks.json                  - public verification keys
//! - POST   /api/v1/auth/sessions                   - issue a token pair (server key)
//! - POST   /api/v1/auth/sessions/current/refresh   - refresh exchange
//! - DELETE /api/v1/auth/sessions/current           - logout
//! - GET    /api/v1/users/me                        - verify an access token
//! - POST   /api/v1/auth/cli                        - start CLI login
//! - POST   /api/v1/auth/cli/poll                   - poll CLI login
//! - POST   /api/v1/auth/cli/complete               - confirm CLI login as the caller
//! - POST   /api/v1/auth/cli/cancel                 - cancel CLI login
//! - POST   /api/v1/internal/keys/rotate            - rotate now (server key)
//!
//! Verification endpoints are scoped to the project in `x-stack-project-id`;
//! `x-stack-allow-restricted-user` / `x-stack-allow-anonymous-user` widen the
//! scope to those user populations.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{Value, json};
use stack_auth::{
    CliLoginFlow, Clock, KeyStatus, KeyStore, PollStatus, Principal, SessionStore, TenantScope,
    TokenIssuer, TokenPair, TokenType, TokenVerifier, UserType, VerifiedToken, confirmation_url,
};
use tracing::info;

use crate::error::ApiError;
use crate::metrics;

pub const PROJECT_HEADER: &str = "x-stack-project-id";
pub const ACCESS_TOKEN_HEADER: &str = "x-stack-access-token";
pub const REFRESH_TOKEN_HEADER: &str = "x-stack-refresh-token";
pub const SERVER_KEY_HEADER: &str = "x-stack-secret-server-key";
const ALLOW_RESTRICTED_HEADER: &str = "x-stack-allow-restricted-user";
const ALLOW_ANONYMOUS_HEADER: &str = "x-stack-allow-anonymous-user";

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub api_url: String,
    pub keys: Arc<KeyStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub issuer: Arc<TokenIssuer>,
    pub login: Arc<CliLoginFlow>,
    pub clock: Arc<dyn Clock>,
    pub server_key: Option<Secret<String>>,
    pub confirm_url: String,
    pub started_at: Instant,
    pub prometheus: PrometheusHandle,
}

impl AppState {
    /// Verifier for the tenant scope named in the request headers.
    fn verifier(&self, headers: &HeaderMap) -> Result<TokenVerifier, ApiError> {
        let project_id = header(headers, PROJECT_HEADER).ok_or(ApiError::MissingProjectId)?;
        let mut scope = TenantScope::project(project_id);
        if flag(headers, ALLOW_RESTRICTED_HEADER) {
            scope = scope.allow_restricted();
        }
        if flag(headers, ALLOW_ANONYMOUS_HEADER) {
            scope = scope.allow_anonymous();
        }
        Ok(TokenVerifier::new(
            self.api_url.clone(),
            scope,
            self.keys.clone(),
            self.sessions.clone(),
            self.clock.clone(),
        ))
    }

    fn require_server_key(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let expected = self
            .server_key
            .as_ref()
            .ok_or(ApiError::ServerKeyNotConfigured)?;
        let presented =
            header(headers, SERVER_KEY_HEADER).ok_or(ApiError::MissingHeader(SERVER_KEY_HEADER))?;
        if expected.matches(presented) {
            Ok(())
        } else {
            Err(ApiError::InvalidServerKey)
        }
    }

    /// Verify the access token in `x-stack-access-token` and count the outcome.
    async fn verify_access(&self, headers: &HeaderMap) -> Result<VerifiedToken, ApiError> {
        let verifier = self.verifier(headers)?;
        let token = header(headers, ACCESS_TOKEN_HEADER)
            .ok_or(ApiError::MissingHeader(ACCESS_TOKEN_HEADER))?;

        let result = verifier.verify_token(token).await.and_then(|v| {
            if v.claims.token_type == TokenType::Access {
                Ok(v)
            } else {
                Err(stack_auth::Error::MalformedToken(
                    "expected an access token".into(),
                ))
            }
        });
        match &result {
            Ok(_) => metrics::record_verification("ok"),
            Err(e) => metrics::record_verification(e.kind()),
        }
        Ok(result?)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn flag(headers: &HeaderMap, name: &str) -> bool {
    header(headers, name).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn pair_body(pair: &TokenPair) -> Value {
    metrics::record_token_issued(TokenType::Access.label());
    metrics::record_token_issued(TokenType::Refresh.label());
    json!({
        "access_token": pair.access.as_str(),
        "refresh_token": pair.refresh.as_str(),
        "session_id": pair.session.session_id,
        "access_token_expires_at": pair.access.expires_at(),
        "refresh_token_expires_at": pair.refresh.expires_at(),
    })
}

/// Build the router with all routes, capped at `max_connections` concurrent
/// requests.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/api/v1/auth/sessions", post(create_session))
        .route("/api/v1/auth/sessions/current/refresh", post(refresh_session))
        .route(
            "/api/v1/auth/sessions/current",
            axum::routing::delete(revoke_session),
        )
        .route("/api/v1/users/me", get(current_user))
        .route("/api/v1/auth/cli", post(start_cli_login))
        .route("/api/v1/auth/cli/poll", post(poll_cli_login))
        .route("/api/v1/auth/cli/complete", post(complete_cli_login))
        .route("/api/v1/auth/cli/cancel", post(cancel_cli_login))
        .route("/api/v1/internal/keys/rotate", post(rotate_keys))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// GET /health - 200 while a signing key is active, 503 otherwise.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.keys.snapshot().await;
    let summaries = snapshot.summaries(state.clock.now_millis());
    let active_kid = summaries
        .iter()
        .find(|k| k.status == KeyStatus::Active)
        .map(|k| k.kid.clone());

    let status = if active_kid.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if active_kid.is_some() { "healthy" } else { "degraded" },
        "active_kid": active_kid,
        "key_set_version": snapshot.version(),
        "keys": summaries,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });
    (status, Json(body))
}

/// GET /metrics - Prometheus text exposition format.
async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.keys.public_key_set().await)
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    user_id: String,
    #[serde(default)]
    roles: BTreeSet<String>,
    #[serde(default)]
    user_type: UserType,
}

/// POST /api/v1/auth/sessions - mint a refresh + access pair for a user.
async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    state.require_server_key(&headers)?;
    let project_id = header(&headers, PROJECT_HEADER).ok_or(ApiError::MissingProjectId)?;

    let principal = Principal::new(body.user_id, project_id)
        .with_roles(body.roles)
        .with_user_type(body.user_type);
    let pair = state.issuer.issue_pair(&principal).await?;
    Ok(Json(pair_body(&pair)))
}

/// POST /api/v1/auth/sessions/current/refresh
async fn refresh_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let verifier = state.verifier(&headers)?;
    let token = header(&headers, REFRESH_TOKEN_HEADER)
        .ok_or(ApiError::MissingHeader(REFRESH_TOKEN_HEADER))?;
    let pair = state.issuer.refresh(&verifier, token).await?;
    Ok(Json(pair_body(&pair)))
}

/// DELETE /api/v1/auth/sessions/current - logout.
async fn revoke_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let verifier = state.verifier(&headers)?;
    let token = header(&headers, REFRESH_TOKEN_HEADER)
        .ok_or(ApiError::MissingHeader(REFRESH_TOKEN_HEADER))?;
    state.issuer.revoke(&verifier, token).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/v1/users/me - the principal behind an access token.
async fn current_user(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let verified = state.verify_access(&headers).await?;
    Ok(Json(json!({
        "user_id": verified.principal.user_id,
        "project_id": verified.principal.project_id,
        "roles": verified.principal.roles,
        "user_type": verified.principal.user_type,
        "session_id": verified.claims.sid,
        "expires_at": verified.claims.exp,
    })))
}

/// POST /api/v1/auth/cli - start a CLI login.
async fn start_cli_login(State(state): State<AppState>) -> Json<Value> {
    let ticket = state.login.start_login().await;
    metrics::record_cli_login("started");
    Json(json!({
        "login_code": ticket.login_code,
        "polling_code": ticket.polling_code,
        "expires_at": ticket.expires_at,
        "confirmation_url": confirmation_url(&state.confirm_url, &ticket.login_code),
    }))
}

#[derive(Deserialize)]
struct PollingCodeRequest {
    polling_code: String,
}

/// POST /api/v1/auth/cli/poll
async fn poll_cli_login(
    State(state): State<AppState>,
    Json(body): Json<PollingCodeRequest>,
) -> Result<Json<PollStatus>, ApiError> {
    let status = state.login.poll(&body.polling_code).await?;
    match &status {
        PollStatus::Success { .. } => {
            metrics::record_cli_login("completed");
            metrics::record_token_issued(TokenType::Refresh.label());
        }
        PollStatus::Expired => metrics::record_cli_login("expired"),
        PollStatus::Waiting => {}
    }
    Ok(Json(status))
}

#[derive(Deserialize)]
struct CompleteRequest {
    login_code: String,
}

/// POST /api/v1/auth/cli/complete - confirm a login code as the caller.
async fn complete_cli_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<Value>, ApiError> {
    let verified = state.verify_access(&headers).await?;
    state
        .login
        .confirm(&body.login_code, verified.principal)
        .await?;
    metrics::record_cli_login("confirmed");
    Ok(Json(json!({ "success": true })))
}

/// POST /api/v1/auth/cli/cancel
async fn cancel_cli_login(
    State(state): State<AppState>,
    Json(body): Json<PollingCodeRequest>,
) -> Result<Json<Value>, ApiError> {
    state.login.cancel(&body.polling_code).await?;
    metrics::record_cli_login("cancelled");
    Ok(Json(json!({ "success": true })))
}

/// POST /api/v1/internal/keys/rotate - rotate immediately.
async fn rotate_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.require_server_key(&headers)?;
    let key = match state.keys.rotate().await {
        Ok(key) => key,
        Err(e) => {
            metrics::record_key_rotation("failure");
            return Err(e.into());
        }
    };
    metrics::record_key_rotation("success");
    info!(kid = %key.kid(), "manual key rotation");
    Ok(Json(json!({
        "kid": key.kid(),
        "version": state.keys.version().await,
    })))
}
