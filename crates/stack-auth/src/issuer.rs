//! Token issuance, refresh exchange and logout
//!
//! Issuance flow:
//! 1. Validate the principal has a tenant scope and the ttl fits the policy
//! 2. Take the active key from the [`KeyStore`]
//! 3. For refresh tokens, open a session in the [`SessionStore`]
//! 4. Sign `{iss, aud, sub, iat, exp, type, sid}` as an ES256 JWT

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, Header};
use tracing::{debug, info};

use crate::claims::{Claims, Token, TokenType};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::keys::KeyStore;
use crate::principal::{Principal, UserType};
use crate::session::{Session, SessionStore};
use crate::verifier::TokenVerifier;

/// Default access token lifetime.
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(10 * 60);

/// Default refresh token lifetime.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Default upper bound for caller-chosen access token ttls.
pub const MAX_ACCESS_TTL: Duration = Duration::from_secs(60 * 60);

/// Lifetime limits per token type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub max_access_ttl: Duration,
    pub max_refresh_ttl: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
            max_access_ttl: MAX_ACCESS_TTL,
            max_refresh_ttl: DEFAULT_REFRESH_TTL,
        }
    }
}

impl TokenPolicy {
    pub fn default_ttl(&self, token_type: TokenType) -> Duration {
        match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        }
    }

    pub fn max_ttl(&self, token_type: TokenType) -> Duration {
        match token_type {
            TokenType::Access => self.max_access_ttl,
            TokenType::Refresh => self.max_refresh_ttl,
        }
    }

    /// Ttls are whole seconds, at least one, at most the type's maximum.
    pub fn check(&self, token_type: TokenType, ttl: Duration) -> Result<u64> {
        let secs = ttl.as_secs();
        if secs == 0 {
            return Err(Error::InvalidTtl(format!(
                "{} token ttl must be at least one second",
                token_type.label()
            )));
        }
        let max = self.max_ttl(token_type);
        if ttl > max {
            return Err(Error::InvalidTtl(format!(
                "{} token ttl {}s exceeds maximum {}s",
                token_type.label(),
                secs,
                max.as_secs()
            )));
        }
        Ok(secs)
    }
}

/// A refresh token, an access token for the same session, and the session.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: Token,
    pub refresh: Token,
    pub session: Session,
}

/// Mints signed tokens.
///
/// Holds no mutable state of its own; all shared state lives in the key
/// and session stores.
#[derive(Clone)]
pub struct TokenIssuer {
    api_url: String,
    policy: TokenPolicy,
    keys: Arc<KeyStore>,
    sessions: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(
        api_url: impl Into<String>,
        policy: TokenPolicy,
        keys: Arc<KeyStore>,
        sessions: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            policy,
            keys,
            sessions,
            clock,
        }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Issue a token of `token_type` valid for `ttl`.
    ///
    /// Refresh tokens open a new session.
    pub async fn issue(
        &self,
        principal: &Principal,
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<Token> {
        principal.validate()?;
        let ttl_secs = self.policy.check(token_type, ttl)?;
        let key = self.keys.current_signing_key().await?;

        let sid = match token_type {
            TokenType::Access => None,
            TokenType::Refresh => Some(self.sessions.create(principal).await?.session_id),
        };
        self.sign(&key, principal, token_type, ttl_secs, sid)
    }

    /// Issue a refresh token (new session) plus an access token bound to it,
    /// both with the policy's default ttls.
    pub async fn issue_pair(&self, principal: &Principal) -> Result<TokenPair> {
        principal.validate()?;
        let access_ttl = self.policy.check(TokenType::Access, self.policy.access_ttl)?;
        let refresh_ttl = self
            .policy
            .check(TokenType::Refresh, self.policy.refresh_ttl)?;
        let key = self.keys.current_signing_key().await?;

        let session = self.sessions.create(principal).await?;
        let sid = Some(session.session_id.clone());
        let refresh = self.sign(&key, principal, TokenType::Refresh, refresh_ttl, sid.clone())?;
        let access = self.sign(&key, principal, TokenType::Access, access_ttl, sid)?;

        Ok(TokenPair {
            access,
            refresh,
            session,
        })
    }

    /// Exchange a refresh token for a new access token and a rotated refresh
    /// token on the same session.
    ///
    /// The session rotation happens under the session's lock, so a revoke
    /// that lands between verification and rotation still wins.
    pub async fn refresh(&self, verifier: &TokenVerifier, refresh_token: &str) -> Result<TokenPair> {
        let verified = verifier.verify_token(refresh_token).await?;
        if verified.claims.token_type != TokenType::Refresh {
            return Err(Error::MalformedToken("expected a refresh token".into()));
        }
        let sid = verified
            .claims
            .sid
            .clone()
            .ok_or_else(|| Error::MalformedToken("refresh token without sid".into()))?;

        let access_ttl = self.policy.check(TokenType::Access, self.policy.access_ttl)?;
        let refresh_ttl = self
            .policy
            .check(TokenType::Refresh, self.policy.refresh_ttl)?;
        let key = self.keys.current_signing_key().await?;

        let session = self.sessions.rotate(&sid).await?;
        let principal = &verified.principal;
        let refresh = self.sign(&key, principal, TokenType::Refresh, refresh_ttl, Some(sid.clone()))?;
        let access = self.sign(&key, principal, TokenType::Access, access_ttl, Some(sid))?;
        debug!(session_id = %session.session_id, "refresh exchange completed");

        Ok(TokenPair {
            access,
            refresh,
            session,
        })
    }

    /// Revoke the session behind a refresh token (logout).
    ///
    /// Revoking an already revoked session succeeds.
    pub async fn revoke(&self, verifier: &TokenVerifier, refresh_token: &str) -> Result<()> {
        let verified = match verifier.verify_token(refresh_token).await {
            Ok(verified) => verified,
            Err(Error::SessionRevoked(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if verified.claims.token_type != TokenType::Refresh {
            return Err(Error::MalformedToken("expected a refresh token".into()));
        }
        match verified.claims.sid {
            Some(sid) => self.sessions.revoke(&sid).await,
            None => Err(Error::MalformedToken("refresh token without sid".into())),
        }
    }

    fn sign(
        &self,
        key: &crate::keys::SigningKey,
        principal: &Principal,
        token_type: TokenType,
        ttl_secs: u64,
        sid: Option<String>,
    ) -> Result<Token> {
        let iat = self.clock.now_secs();
        let claims = Claims {
            iss: principal.issuer(&self.api_url),
            aud: principal.audience(),
            sub: principal.user_id.clone(),
            iat,
            exp: iat + ttl_secs,
            token_type,
            sid,
            roles: principal.roles.clone(),
            is_anonymous: principal.user_type == UserType::Anonymous,
            is_restricted: principal.user_type != UserType::Normal,
        };

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key.kid().to_owned());

        let compact = jsonwebtoken::encode(&header, &claims, &key.encoding_key())
            .map_err(|e| Error::KeyGeneration(format!("signing failed: {e}")))?;

        info!(
            kid = %key.kid(),
            token_type = token_type.label(),
            project_id = %principal.project_id,
            expires_at = claims.exp,
            "token issued"
        );
        Ok(Token::new(compact, key.kid().to_owned(), claims))
    }
}
