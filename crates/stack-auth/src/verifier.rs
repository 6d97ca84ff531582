//! Token verification
//!
//! Checks run cheapest-first and stop at the first failure:
//! 1. Structure: three segments, ES256 header with a `kid`, closed claim set
//! 2. Key lookup: the `kid` must be active or retiring within its grace period
//! 3. Signature
//! 4. Expiry against the injected clock
//! 5. Audience and issuer against the verifier's tenant scope
//! 6. Refresh tokens only: the session must not be revoked

use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use tracing::debug;

use crate::claims::{Claims, TokenType, parse_unverified};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::keys::KeyStore;
use crate::principal::{Principal, TenantScope, UserType, issuer_for, parse_audience};
use crate::session::SessionStore;

/// Result of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub principal: Principal,
    pub claims: Claims,
    pub kid: String,
}

/// Verifies tokens for one tenant scope.
///
/// Cheap to clone; clones share the key and session stores.
#[derive(Clone)]
pub struct TokenVerifier {
    api_url: String,
    scope: TenantScope,
    keys: Arc<KeyStore>,
    sessions: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl TokenVerifier {
    pub fn new(
        api_url: impl Into<String>,
        scope: TenantScope,
        keys: Arc<KeyStore>,
        sessions: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            scope,
            keys,
            sessions,
            clock,
        }
    }

    /// A verifier sharing this one's stores but scoped to another tenant.
    pub fn for_scope(&self, scope: TenantScope) -> Self {
        Self {
            scope,
            ..self.clone()
        }
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    /// Verify a token and return the principal it was issued to.
    pub async fn verify(&self, token: &str) -> Result<Principal> {
        self.verify_token(token).await.map(|v| v.principal)
    }

    /// Verify a token and return its principal together with the raw claims.
    pub async fn verify_token(&self, token: &str) -> Result<VerifiedToken> {
        let (kid, claims) = parse_unverified(token)?;
        let key = self.keys.verification_key(&kid).await?;
        check_signature(token, key.decoding_key())?;

        let now = self.clock.now_secs();
        if now >= claims.exp {
            debug!(kid, exp = claims.exp, now, "token expired");
            return Err(Error::Expired(claims.exp));
        }

        let user_type = self.check_scope(&claims)?;

        if claims.token_type == TokenType::Refresh {
            // parse_unverified guarantees refresh tokens carry a sid
            let sid = claims.sid.as_deref().unwrap_or_default();
            if self.sessions.is_revoked(sid).await {
                return Err(Error::SessionRevoked(sid.to_owned()));
            }
        }

        let principal = Principal {
            user_id: claims.sub.clone(),
            project_id: self.scope.project_id.clone(),
            roles: claims.roles.clone(),
            user_type,
        };
        Ok(VerifiedToken {
            principal,
            claims,
            kid,
        })
    }

    fn check_scope(&self, claims: &Claims) -> Result<UserType> {
        let (project_id, user_type) = parse_audience(&claims.aud);
        if project_id != self.scope.project_id {
            return Err(Error::AudienceMismatch(format!(
                "token audience {} is not project {}",
                claims.aud, self.scope.project_id
            )));
        }
        if !self.scope.accepts(user_type) {
            return Err(Error::AudienceMismatch(format!(
                "{user_type:?} users are not accepted by this project scope"
            )));
        }

        let flags_consistent = match user_type {
            UserType::Normal => !claims.is_anonymous && !claims.is_restricted,
            UserType::Restricted => !claims.is_anonymous && claims.is_restricted,
            UserType::Anonymous => claims.is_anonymous && claims.is_restricted,
        };
        if !flags_consistent {
            return Err(Error::AudienceMismatch(format!(
                "user flags do not match audience {}",
                claims.aud
            )));
        }

        let expected_iss = issuer_for(&self.api_url, &project_id, user_type);
        if claims.iss != expected_iss {
            return Err(Error::AudienceMismatch(format!(
                "issuer {} does not match {expected_iss}",
                claims.iss
            )));
        }
        Ok(user_type)
    }
}

/// Signature check only; every claim check is done by the verifier itself
/// against its own clock.
fn check_signature(token: &str, key: &jsonwebtoken::DecodingKey) -> Result<()> {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match jsonwebtoken::decode::<Claims>(token, key, &validation) {
        Ok(_) => Ok(()),
        Err(e) => match e.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidEcdsaKey | ErrorKind::Crypto(_) => {
                Err(Error::BadSignature)
            }
            _ => Err(Error::MalformedToken(e.to_string())),
        },
    }
}
