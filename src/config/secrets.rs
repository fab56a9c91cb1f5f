//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers can expose connection URLs
//! without importing secrecy themselves.

pub use secrecy::{ExposeSecret, SecretString};
