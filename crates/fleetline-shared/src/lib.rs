//! Shared identifier types, the participant-role model, the presence
//! wire payload, and tunable constants used across the Fleetline
//! workspace.

pub mod constants;
pub mod types;

pub use types::{ChatPair, ChatId, MessageId, PresencePayload, Role, UserId};
