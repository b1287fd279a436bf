use thiserror::Error;

/// Errors produced by the transport layer.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// A payload could not be serialized to its wire JSON form.
    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RealtimeError>;
