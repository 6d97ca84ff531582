//! Credential & session authority
//!
//! Issues and verifies the ES256 JWTs that identify users to Stack Auth
//! projects, manages the signing keys behind them, tracks the server-side
//! sessions refresh tokens are bound to, and runs the CLI login handshake.
//! The crate does no I/O of its own beyond what its stores do; the HTTP
//! surface lives in the `auth-server` service and the CLI in `stack-cli`.
//!
//! Credential flow:
//! 1. `KeyStore::rotate()` (or `import_pem()`) installs an active signing key
//! 2. `TokenIssuer::issue_pair()` opens a session and signs refresh + access tokens
//! 3. `TokenVerifier::verify()` checks structure, key, signature, expiry and tenant
//! 4. `TokenIssuer::refresh()` trades a refresh token for a fresh pair
//! 5. `TokenIssuer::revoke()` ends the session (logout)
//!
//! CLI login:
//! 1. `CliLoginFlow::start_login()` hands out a login code and a polling code
//! 2. The user confirms the login code in a browser (`CliLoginFlow::confirm()`)
//! 3. The CLI polls (`exchange_for_token()`) and receives a refresh token

pub mod claims;
pub mod clock;
pub mod codes;
pub mod error;
pub mod issuer;
pub mod keys;
pub mod login;
pub mod poll;
pub mod principal;
pub mod session;
pub mod verifier;

pub use claims::{Claims, Token, TokenType};
pub use clock::{Clock, ManualClock, SystemClock, system_clock};
pub use codes::confirmation_url;
pub use error::{Error, Result};
pub use issuer::{TokenIssuer, TokenPair, TokenPolicy};
pub use keys::{Jwk, Jwks, KeySnapshot, KeyStatus, KeyStore, KeySummary, SigningKey};
pub use login::{CliLoginFlow, DEFAULT_LOGIN_EXPIRY, LoginTicket};
pub use poll::{LoginPoller, PollPolicy, PollStatus, exchange_for_token};
pub use principal::{Principal, TenantScope, UserType};
pub use session::{MemorySessionStore, Session, SessionStore};
pub use verifier::{TokenVerifier, VerifiedToken};
