//! Identifier newtypes and the participant-role model.
//!
//! A session resolves its [`Role`] exactly once (from the auth
//! provider's role claim) and derives the [`ChatPair`] lookup key from
//! it; nothing downstream re-branches on "am I the admin".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable user identifier supplied by the auth provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable chat (conversation) identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChatId(pub Uuid);

impl ChatId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Name of the presence topic scoped to this chat.
    pub fn to_presence_topic(&self) -> String {
        format!("presence:chat:{}", self.0)
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier, assigned at the store boundary on insert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Which side of a conversation a user occupies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Driver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Driver => "driver",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "driver" => Ok(Role::Driver),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized role claim.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct RoleParseError(pub String);

/// The ordered (driver, admin) pair that uniquely identifies a chat.
///
/// Resolved once from the session's own role; a conversation is always
/// between exactly one driver and one admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatPair {
    pub driver_id: UserId,
    pub admin_id: UserId,
}

impl ChatPair {
    /// Derive the pair from our own identity/role and the other
    /// participant's id.
    pub fn resolve(self_id: UserId, self_role: Role, other_id: UserId) -> Self {
        match self_role {
            Role::Admin => Self {
                driver_id: other_id,
                admin_id: self_id,
            },
            Role::Driver => Self {
                driver_id: self_id,
                admin_id: other_id,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Presence payload
// ---------------------------------------------------------------------------

/// The small JSON payload each client publishes on a presence topic.
///
/// One payload exists per (topic, user) pair; payloads on different
/// topics are independent and never reconciled with each other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresencePayload {
    pub user_id: UserId,
    /// Refreshed on every re-track; the staleness window is measured
    /// against this.
    pub online_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub online: bool,
    #[serde(rename = "isTyping", skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
}

impl PresencePayload {
    /// Payload for the global presence topic.
    pub fn global(user_id: UserId, role: Role) -> Self {
        Self {
            user_id,
            online_at: Utc::now(),
            role: Some(role),
            online: true,
            is_typing: None,
        }
    }

    /// Payload for a chat-scoped presence topic.
    pub fn chat(user_id: UserId, role: Role, is_typing: bool) -> Self {
        Self {
            user_id,
            online_at: Utc::now(),
            role: Some(role),
            online: true,
            is_typing: Some(is_typing),
        }
    }
}
