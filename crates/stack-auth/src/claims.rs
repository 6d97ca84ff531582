//! Token claims and the compact token value
//!
//! Tokens are compact ES256 JWTs: `base64url(header).base64url(claims).base64url(sig)`.
//! The claims struct is closed: unknown fields are rejected at parse time, and
//! structural invariants (`exp > iat`, refresh tokens carry a session id) are
//! checked before any key lookup happens.

use std::collections::BTreeSet;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, decode_header};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Access tokens are short-lived bearer credentials; refresh tokens are
/// long-lived and bound to a server-side session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn label(self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Claims carried by every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    /// Issued at, unix seconds
    pub iat: u64,
    /// Expires at, unix seconds
    pub exp: u64,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// Session id; required on refresh tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub roles: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_restricted: bool,
}

impl Claims {
    /// Structural checks that don't need a key or a clock.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("iss", &self.iss), ("aud", &self.aud), ("sub", &self.sub)] {
            if value.is_empty() {
                return Err(Error::MalformedToken(format!("claim {name} is empty")));
            }
        }
        if self.exp <= self.iat {
            return Err(Error::MalformedToken(format!(
                "exp ({}) must be after iat ({})",
                self.exp, self.iat
            )));
        }
        match (&self.token_type, &self.sid) {
            (TokenType::Refresh, None) => Err(Error::MalformedToken(
                "refresh token without sid".into(),
            )),
            (_, Some(sid)) if sid.is_empty() => {
                Err(Error::MalformedToken("claim sid is empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// An issued token. Immutable once minted.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    compact: String,
    kid: String,
    claims: Claims,
}

impl Token {
    pub(crate) fn new(compact: String, kid: String, claims: Claims) -> Self {
        Self {
            compact,
            kid,
            claims,
        }
    }

    /// The compact wire form.
    pub fn as_str(&self) -> &str {
        &self.compact
    }

    pub fn into_string(self) -> String {
        self.compact
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn token_type(&self) -> TokenType {
        self.claims.token_type
    }

    pub fn session_id(&self) -> Option<&str> {
        self.claims.sid.as_deref()
    }

    pub fn expires_at(&self) -> u64 {
        self.claims.exp
    }
}

// The compact form is a bearer credential; keep it out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("kid", &self.kid)
            .field("claims", &self.claims)
            .field("compact", &"[REDACTED]")
            .finish()
    }
}

/// Parse a compact token without checking its signature.
///
/// Returns the key id from the header and the validated claims. Anything
/// that isn't a well-formed ES256 token with a `kid` is `MalformedToken`.
pub(crate) fn parse_unverified(token: &str) -> Result<(String, Claims)> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::MalformedToken(
            "token must have 3 non-empty parts separated by dots".into(),
        ));
    }

    let header = decode_header(token)
        .map_err(|e| Error::MalformedToken(format!("invalid header: {e}")))?;
    if header.alg != Algorithm::ES256 {
        return Err(Error::MalformedToken(format!(
            "unsupported algorithm {:?}",
            header.alg
        )));
    }
    let kid = header
        .kid
        .filter(|kid| !kid.is_empty())
        .ok_or_else(|| Error::MalformedToken("header has no kid".into()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| Error::MalformedToken(format!("invalid claims encoding: {e}")))?;
    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|e| Error::MalformedToken(format!("invalid claims: {e}")))?;
    claims.validate()?;

    Ok((kid, claims))
}
