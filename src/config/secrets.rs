//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers holding a [`Config`](super::Config)
//! can reach the database URL without depending on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};
