//! Login and polling codes for the CLI login handshake
//!
//! Each login request has two codes:
//! - the login code, short and human-readable, goes into the browser URL
//!   the user confirms
//! - the polling code, 256 random bits, stays with the CLI and is the only
//!   thing that can collect the resulting refresh token
//!
//! The server keeps only a SHA-256 digest of the polling code.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

/// Crockford-style alphabet without 0/O, 1/I or ambiguous letters.
const LOGIN_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const LOGIN_CODE_LEN: usize = 8;

/// Generate a login code, e.g. `K7QH3MZP`.
///
/// The alphabet has 32 symbols so `byte % 32` is unbiased.
pub fn generate_login_code() -> String {
    let mut bytes = [0u8; LOGIN_CODE_LEN];
    rand::rng().fill(&mut bytes);
    bytes
        .iter()
        .map(|b| LOGIN_CODE_ALPHABET[(*b as usize) % LOGIN_CODE_ALPHABET.len()] as char)
        .collect()
}

/// Generate a polling code: 32 random bytes, URL-safe base64 (43 chars).
pub fn generate_polling_code() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `BASE64URL(SHA256(polling_code))`
pub fn hash_polling_code(polling_code: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(polling_code.as_bytes()))
}

/// The browser URL where a user confirms a login code.
pub fn confirmation_url(base: &str, login_code: &str) -> String {
    format!("{}?login_code={}", base.trim_end_matches('/'), login_code)
}
