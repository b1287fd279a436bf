//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can double
//! as the row payload of a transport change notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleetline_shared::{ChatId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A durable (driver, admin) conversation record.
///
/// Uniquely identified by the (driver_id, admin_id) pair; never deleted
/// in normal operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    pub driver_id: UserId,
    pub admin_id: UserId,
    /// Preview of the most recent message, denormalized for list views.
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// A fresh chat row for a participant pair.
    pub fn new(driver_id: UserId, admin_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: ChatId::new(),
            driver_id,
            admin_id,
            last_message: None,
            last_message_time: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. Deletion is a soft flag, never row removal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Assigned at the store boundary on insert.
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: String,
    pub image_url: Option<String>,
    /// Assigned at the store boundary; the display sort key.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Flipped by the recipient.
    pub read: bool,
    /// Flipped by the recipient.
    pub delivered: bool,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Online status
// ---------------------------------------------------------------------------

/// One row per user; created lazily on first presence initialization,
/// overwritten in place, never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnlineStatusRecord {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub platform: String,
    pub updated_at: DateTime<Utc>,
}
