//! Server side of the CLI login handshake
//!
//! ```text
//!   start_login ──► Pending ──confirm──► Confirmed ──poll──► (token issued, record deleted)
//!                      │
//!                      └──expiry / cancel──► Expired
//! ```
//!
//! The CLI calls [`CliLoginFlow::start_login`], shows the user a URL with
//! the login code, and polls with the polling code. A signed-in browser
//! session calls [`CliLoginFlow::confirm`] with the login code. The first
//! poll after confirmation mints a refresh token and deletes the request, so
//! each login yields exactly one credential.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::claims::TokenType;
use crate::clock::Clock;
use crate::codes::{generate_login_code, generate_polling_code, hash_polling_code};
use crate::error::{Error, Result};
use crate::issuer::TokenIssuer;
use crate::poll::{self, LoginPoller, PollPolicy, PollStatus};
use crate::principal::Principal;

/// How long a login request stays confirmable.
pub const DEFAULT_LOGIN_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// What the CLI gets back from `start_login`.
#[derive(Clone, Serialize)]
pub struct LoginTicket {
    pub login_code: String,
    pub polling_code: String,
    /// Unix milliseconds
    pub expires_at: u64,
}

impl fmt::Debug for LoginTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginTicket")
            .field("login_code", &self.login_code)
            .field("polling_code", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
enum LoginState {
    Pending,
    Confirmed(Principal),
    Expired,
}

#[derive(Debug)]
struct LoginRequest {
    login_code: String,
    state: LoginState,
    expires_at: u64,
}

impl LoginRequest {
    /// Lazily move a pending request past its deadline to `Expired`.
    fn settle(&mut self, now: u64) {
        if matches!(self.state, LoginState::Pending) && now >= self.expires_at {
            self.state = LoginState::Expired;
        }
    }
}

#[derive(Debug, Default)]
struct LoginRequests {
    /// Keyed by polling code digest
    by_polling_hash: HashMap<String, LoginRequest>,
    /// login code -> polling code digest
    login_index: HashMap<String, String>,
}

impl LoginRequests {
    fn remove(&mut self, polling_hash: &str) {
        if let Some(request) = self.by_polling_hash.remove(polling_hash) {
            self.login_index.remove(&request.login_code);
        }
    }

    /// Drop requests whose expiry passed more than `retention` ago. Expired
    /// records are kept that long so late polls still see `expired`.
    fn sweep(&mut self, now: u64, retention: Duration) -> usize {
        let retention = retention.as_millis() as u64;
        let stale: Vec<String> = self
            .by_polling_hash
            .iter()
            .filter(|(_, r)| now >= r.expires_at.saturating_add(retention))
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &stale {
            self.remove(hash);
        }
        stale.len()
    }
}

/// Outstanding CLI login requests.
pub struct CliLoginFlow {
    requests: Mutex<LoginRequests>,
    issuer: Arc<TokenIssuer>,
    clock: Arc<dyn Clock>,
    expiry: Duration,
}

impl CliLoginFlow {
    pub fn new(issuer: Arc<TokenIssuer>, clock: Arc<dyn Clock>, expiry: Duration) -> Self {
        Self {
            requests: Mutex::new(LoginRequests::default()),
            issuer,
            clock,
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Polling schedule whose deadline matches the request expiry.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::default().with_timeout(self.expiry)
    }

    /// Number of requests currently held, expired ones included.
    pub async fn outstanding(&self) -> usize {
        self.requests.lock().await.by_polling_hash.len()
    }

    /// Open a login request.
    pub async fn start_login(&self) -> LoginTicket {
        let now = self.clock.now_millis();
        let expires_at = now + self.expiry.as_millis() as u64;
        let mut requests = self.requests.lock().await;

        let swept = requests.sweep(now, self.expiry);
        if swept > 0 {
            debug!(swept, "dropped stale login requests");
        }

        let mut login_code = generate_login_code();
        while requests.login_index.contains_key(&login_code) {
            login_code = generate_login_code();
        }
        let polling_code = generate_polling_code();
        let polling_hash = hash_polling_code(&polling_code);

        requests
            .login_index
            .insert(login_code.clone(), polling_hash.clone());
        requests.by_polling_hash.insert(
            polling_hash,
            LoginRequest {
                login_code: login_code.clone(),
                state: LoginState::Pending,
                expires_at,
            },
        );
        info!(login_code = %login_code, expires_at, "cli login started");

        LoginTicket {
            login_code,
            polling_code,
            expires_at,
        }
    }

    /// Confirm a pending login as `principal`. Single use.
    pub async fn confirm(&self, login_code: &str, principal: Principal) -> Result<()> {
        let now = self.clock.now_millis();
        let mut requests = self.requests.lock().await;
        let polling_hash = requests
            .login_index
            .get(login_code)
            .cloned()
            .ok_or(Error::LoginCodeUnknown)?;
        let request = requests
            .by_polling_hash
            .get_mut(&polling_hash)
            .ok_or(Error::LoginCodeUnknown)?;

        request.settle(now);
        match request.state {
            LoginState::Expired => Err(Error::LoginCodeExpired),
            LoginState::Confirmed(_) => Err(Error::AlreadyConfirmed),
            LoginState::Pending => {
                principal.validate()?;
                info!(
                    login_code,
                    project_id = %principal.project_id,
                    "cli login confirmed"
                );
                request.state = LoginState::Confirmed(principal);
                Ok(())
            }
        }
    }

    /// One poll by the CLI. On the first poll after confirmation a refresh
    /// token is issued and the request is deleted; polling again afterwards
    /// yields `LoginCodeUnknown`.
    pub async fn poll(&self, polling_code: &str) -> Result<PollStatus> {
        let now = self.clock.now_millis();
        let polling_hash = hash_polling_code(polling_code);
        let mut requests = self.requests.lock().await;
        let request = requests
            .by_polling_hash
            .get_mut(&polling_hash)
            .ok_or(Error::LoginCodeUnknown)?;

        request.settle(now);
        let principal = match &request.state {
            LoginState::Pending => return Ok(PollStatus::Waiting),
            LoginState::Expired => return Ok(PollStatus::Expired),
            LoginState::Confirmed(principal) => principal.clone(),
        };

        // Issue while holding the lock so concurrent polls can't both collect
        // a token. A failed issuance leaves the request confirmed for retry.
        let ttl = self.issuer.policy().default_ttl(TokenType::Refresh);
        let token = self
            .issuer
            .issue(&principal, TokenType::Refresh, ttl)
            .await?;
        requests.remove(&polling_hash);
        info!(project_id = %principal.project_id, "cli login completed");

        Ok(PollStatus::Success {
            refresh_token: token.into_string(),
        })
    }

    /// Abort a login early. The request becomes `Expired`.
    pub async fn cancel(&self, polling_code: &str) -> Result<()> {
        let polling_hash = hash_polling_code(polling_code);
        let mut requests = self.requests.lock().await;
        let request = requests
            .by_polling_hash
            .get_mut(&polling_hash)
            .ok_or(Error::LoginCodeUnknown)?;
        request.state = LoginState::Expired;
        info!(login_code = %request.login_code, "cli login cancelled");
        Ok(())
    }

    /// Poll in-process until the login completes, expires or is cancelled.
    pub async fn exchange_for_token(
        &self,
        polling_code: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        poll::exchange_for_token(self, polling_code, &self.poll_policy(), cancel).await
    }
}

#[async_trait]
impl LoginPoller for CliLoginFlow {
    async fn poll(&self, polling_code: &str) -> Result<PollStatus> {
        CliLoginFlow::poll(self, polling_code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::issuer::TokenPolicy;
    use crate::keys::KeyStore;
    use crate::principal::TenantScope;
    use crate::session::MemorySessionStore;
    use crate::verifier::TokenVerifier;

    const API: &str = "https://api.example.com";

    struct Fixture {
        clock: Arc<ManualClock>,
        flow: Arc<CliLoginFlow>,
        verifier: TokenVerifier,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let keys = Arc::new(KeyStore::new(Duration::from_secs(3600), clock.clone()));
        keys.rotate().await.unwrap();
        let sessions = Arc::new(MemorySessionStore::new(clock.clone()));
        let issuer = Arc::new(TokenIssuer::new(
            API,
            TokenPolicy::default(),
            keys.clone(),
            sessions.clone(),
            clock.clone(),
        ));
        let verifier = TokenVerifier::new(
            API,
            TenantScope::project("p1"),
            keys,
            sessions,
            clock.clone(),
        );
        let flow = Arc::new(CliLoginFlow::new(
            issuer,
            clock.clone(),
            DEFAULT_LOGIN_EXPIRY,
        ));
        Fixture {
            clock,
            flow,
            verifier,
        }
    }

    fn refresh_token(status: PollStatus) -> String {
        match status {
            PollStatus::Success { refresh_token } => refresh_token,
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn confirmed_login_yields_one_refresh_token() {
        let f = fixture().await;
        let ticket = f.flow.start_login().await;
        assert_eq!(ticket.expires_at, 1_700_000_000_000 + 300_000);

        assert_eq!(f.flow.poll(&ticket.polling_code).await.unwrap(), PollStatus::Waiting);

        f.flow
            .confirm(&ticket.login_code, Principal::new("u1", "p1"))
            .await
            .unwrap();
        let token = refresh_token(f.flow.poll(&ticket.polling_code).await.unwrap());

        let verified = f.verifier.verify_token(&token).await.unwrap();
        assert_eq!(verified.claims.token_type, TokenType::Refresh);
        assert_eq!(verified.principal.user_id, "u1");

        // The record is gone once the token has been handed out.
        assert_eq!(
            f.flow.poll(&ticket.polling_code).await.unwrap_err(),
            Error::LoginCodeUnknown
        );
        assert_eq!(f.flow.outstanding().await, 0);
    }

    #[tokio::test]
    async fn second_confirm_is_rejected() {
        let f = fixture().await;
        let ticket = f.flow.start_login().await;
        f.flow
            .confirm(&ticket.login_code, Principal::new("u1", "p1"))
            .await
            .unwrap();
        assert_eq!(
            f.flow
                .confirm(&ticket.login_code, Principal::new("u2", "p1"))
                .await
                .unwrap_err(),
            Error::AlreadyConfirmed
        );
    }

    #[tokio::test]
    async fn confirm_after_expiry_fails() {
        let f = fixture().await;
        let ticket = f.flow.start_login().await;
        f.clock.advance(DEFAULT_LOGIN_EXPIRY);

        assert_eq!(
            f.flow
                .confirm(&ticket.login_code, Principal::new("u1", "p1"))
                .await
                .unwrap_err(),
            Error::LoginCodeExpired
        );
        assert_eq!(f.flow.poll(&ticket.polling_code).await.unwrap(), PollStatus::Expired);
    }

    #[tokio::test]
    async fn unknown_codes_are_rejected() {
        let f = fixture().await;
        assert_eq!(
            f.flow
                .confirm("NOPE2345", Principal::new("u1", "p1"))
                .await
                .unwrap_err(),
            Error::LoginCodeUnknown
        );
        assert_eq!(f.flow.poll("nope").await.unwrap_err(), Error::LoginCodeUnknown);
        assert_eq!(f.flow.cancel("nope").await.unwrap_err(), Error::LoginCodeUnknown);
    }

    #[tokio::test]
    async fn login_code_cannot_be_used_to_poll() {
        let f = fixture().await;
        let ticket = f.flow.start_login().await;
        f.flow
            .confirm(&ticket.login_code, Principal::new("u1", "p1"))
            .await
            .unwrap();
        assert_eq!(
            f.flow.poll(&ticket.login_code).await.unwrap_err(),
            Error::LoginCodeUnknown
        );
    }

    #[tokio::test]
    async fn invalid_principal_leaves_request_pending() {
        let f = fixture().await;
        let ticket = f.flow.start_login().await;
        assert!(matches!(
            f.flow.confirm(&ticket.login_code, Principal::new("u1", "")).await,
            Err(Error::InvalidPrincipal(_))
        ));
        f.flow
            .confirm(&ticket.login_code, Principal::new("u1", "p1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_expires_request_early() {
        let f = fixture().await;
        let ticket = f.flow.start_login().await;
        f.flow.cancel(&ticket.polling_code).await.unwrap();

        assert_eq!(f.flow.poll(&ticket.polling_code).await.unwrap(), PollStatus::Expired);
        assert_eq!(
            f.flow
                .confirm(&ticket.login_code, Principal::new("u1", "p1"))
                .await
                .unwrap_err(),
            Error::LoginCodeExpired
        );
    }

    #[tokio::test]
    async fn stale_requests_are_swept_on_start() {
        let f = fixture().await;
        let old = f.flow.start_login().await;
        f.clock.advance(DEFAULT_LOGIN_EXPIRY * 2);

        let _fresh = f.flow.start_login().await;
        assert_eq!(f.flow.outstanding().await, 1);
        assert_eq!(
            f.flow.poll(&old.polling_code).await.unwrap_err(),
            Error::LoginCodeUnknown
        );
    }

    #[tokio::test]
    async fn concurrent_polls_hand_out_one_token() {
        let f = fixture().await;
        let ticket = f.flow.start_login().await;
        f.flow
            .confirm(&ticket.login_code, Principal::new("u1", "p1"))
            .await
            .unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let flow = f.flow.clone();
            let code = ticket.polling_code.clone();
            handles.push(tokio::spawn(async move { flow.poll(&code).await }));
        }

        let mut successes = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(PollStatus::Success { .. }) => successes += 1,
                Err(Error::LoginCodeUnknown) => {}
                other => panic!("unexpected poll outcome: {other:?}"),
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_completes_once_confirmed() {
        let f = fixture().await;
        let ticket = f.flow.start_login().await;

        let confirmer = {
            let flow = f.flow.clone();
            let code = ticket.login_code.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2500)).await;
                flow.confirm(&code, Principal::new("u1", "p1")).await
            })
        };

        let token = f
            .flow
            .exchange_for_token(&ticket.polling_code, &CancellationToken::new())
            .await
            .unwrap();
        confirmer.await.unwrap().unwrap();
        assert!(f.verifier.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn ticket_debug_hides_polling_code() {
        let f = fixture().await;
        let ticket = f.flow.start_login().await;
        let debug = format!("{ticket:?}");
        assert!(debug.contains(&ticket.login_code));
        assert!(!debug.contains(&ticket.polling_code));
    }
}
