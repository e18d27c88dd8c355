//! Error types for okra.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Construction-time settings are missing or malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The item cannot be used for the requested operation.
    #[error("invalid item: {0}")]
    InvalidItem(String),

    /// `retrieve` found nothing to claim.
    #[error("no item available")]
    ItemNotFound,

    /// The operation is disabled for this scheduler.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
