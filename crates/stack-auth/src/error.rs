//! Error taxonomy for credential issuance, verification and CLI login

use std::time::Duration;

/// Errors from the credential & session authority.
///
/// Verification failures (`MalformedToken` through `SessionRevoked`) are
/// terminal for the request that produced them and surface as
/// "unauthenticated". Only `Transport` and `KeyUnavailable` are worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    #[error("token signature does not verify")]
    BadSignature,

    #[error("token expired at {0}")]
    Expired(u64),

    #[error("audience mismatch: {0}")]
    AudienceMismatch(String),

    #[error("session revoked: {0}")]
    SessionRevoked(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no active signing key")]
    KeyUnavailable,

    #[error("invalid principal: {0}")]
    InvalidPrincipal(String),

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("login code expired, run login again")]
    LoginCodeExpired,

    #[error("login code unknown")]
    LoginCodeUnknown,

    #[error("login code already confirmed")]
    AlreadyConfirmed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("login polling cancelled")]
    Cancelled,

    #[error("login polling timed out after {0:?}")]
    PollTimeout(Duration),
}

impl Error {
    /// Whether a polling client should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::KeyUnavailable)
    }

    /// Whether this error means the presented credential was rejected.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Error::MalformedToken(_)
                | Error::UnknownKey(_)
                | Error::BadSignature
                | Error::Expired(_)
                | Error::AudienceMismatch(_)
                | Error::SessionRevoked(_)
        )
    }

    /// Stable snake_case label used in metrics and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedToken(_) => "malformed_token",
            Error::UnknownKey(_) => "unknown_key",
            Error::BadSignature => "bad_signature",
            Error::Expired(_) => "expired",
            Error::AudienceMismatch(_) => "audience_mismatch",
            Error::SessionRevoked(_) => "session_revoked",
            Error::SessionNotFound(_) => "session_not_found",
            Error::KeyUnavailable => "key_unavailable",
            Error::InvalidPrincipal(_) => "invalid_principal",
            Error::InvalidTtl(_) => "invalid_ttl",
            Error::KeyGeneration(_) => "key_generation",
            Error::LoginCodeExpired => "login_code_expired",
            Error::LoginCodeUnknown => "login_code_unknown",
            Error::AlreadyConfirmed => "already_confirmed",
            Error::Transport(_) => "transport",
            Error::Cancelled => "cancelled",
            Error::PollTimeout(_) => "poll_timeout",
        }
    }
}

/// Result alias for authority operations.
pub type Result<T> = std::result::Result<T, Error>;
