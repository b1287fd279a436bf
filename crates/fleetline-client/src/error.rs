use thiserror::Error;

use fleetline_shared::{MessageId, UserId};

/// Errors produced by the coordination layer.
///
/// Presence and online-status failures are caught and logged by their
/// call sites rather than propagated to login or navigation; chat and
/// message failures propagate to the initiating action so the user gets
/// feedback.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Durable store failure.
    #[error("Store error: {0}")]
    Store(#[from] fleetline_store::StoreError),

    /// Transport failure.
    #[error("Transport error: {0}")]
    Realtime(#[from] fleetline_realtime::RealtimeError),

    /// Row payload (de)serialization failure.
    #[error("Row serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The online-flag write appeared to succeed but read-backs never
    /// reflected it. Distinct from a hard write failure; the status
    /// stays unknown/stale until the next heartbeat or explicit retry.
    #[error("Online status write for {user_id} could not be verified")]
    VerificationFailed { user_id: UserId },

    /// Chat row creation failed for a reason other than losing the
    /// creation race (races are resolved by adoption, not errors).
    #[error("Chat creation failed: {0}")]
    ChatCreationFailed(String),

    /// Attempted to delete a message sent by someone else.
    #[error("Only the sender may delete a message")]
    NotMessageSender,

    /// The message id is not in this session's list.
    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    /// Operation requires a resolved chat / signed-in session.
    #[error("Session is not ready")]
    NotReady,

    /// Chat resolution did not complete within the bootstrap bound; the
    /// owning screen should navigate away rather than hang.
    #[error("Session bootstrap timed out")]
    BootstrapTimeout,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
