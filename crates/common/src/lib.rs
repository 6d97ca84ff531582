//! Common types shared by the Stack Auth crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, resolve_secret};
