//! Ephemeral presence ownership.
//!
//! One instance per signed-in session, constructed and owned by the
//! app-lifecycle controller and handed to consumers explicitly; it is
//! the sole owner of open transport topic handles, so no other
//! component can leak a duplicate subscription to the same topic.
//!
//! Presence is topic-scoped and ephemeral by construction: it
//! self-heals on reconnect and self-clears on disconnect, which is why
//! it stays separate from the durable online-status table (that one
//! needs explicit, verified transitions for abnormal session ends).

use std::collections::HashMap;

use tracing::{debug, info, warn};

use fleetline_realtime::{Broker, Connection, PresenceTopic};
use fleetline_shared::constants::GLOBAL_PRESENCE_TOPIC;
use fleetline_shared::{ChatId, PresencePayload, Role, UserId};

use crate::error::Result;

struct ChatTopic {
    topic: PresenceTopic,
    is_typing: bool,
}

/// Owns the global presence topic and zero-or-more per-chat topics.
pub struct PresenceManager {
    conn: Connection,
    identity: Option<(UserId, Role)>,
    global: Option<PresenceTopic>,
    chats: HashMap<ChatId, ChatTopic>,
}

impl PresenceManager {
    /// Create an uninitialized manager with its own transport
    /// connection.
    pub fn new(broker: &Broker) -> Self {
        Self {
            conn: broker.connect(),
            identity: None,
            global: None,
            chats: HashMap::new(),
        }
    }

    /// Join the global presence topic as `user_id`.
    ///
    /// Idempotent for the same user; switching users tears down all
    /// prior state first.
    pub fn initialize(&mut self, user_id: UserId, role: Role) -> Result<()> {
        if let Some((current, _)) = self.identity {
            if current == user_id {
                debug!(user = %user_id, "presence already initialized");
                return Ok(());
            }
            info!(prev = %current, next = %user_id, "presence user changed, re-initializing");
            self.cleanup();
        }

        let topic = self.conn.presence_topic(GLOBAL_PRESENCE_TOPIC);
        topic.track(
            &user_id.to_string(),
            &PresencePayload::global(user_id, role),
        )?;

        self.identity = Some((user_id, role));
        self.global = Some(topic);
        info!(user = %user_id, role = %role, "presence initialized");
        Ok(())
    }

    /// Whether a user is tracked on the global topic.
    pub fn is_initialized(&self) -> bool {
        self.identity.is_some()
    }

    /// The user this manager tracks presence for, if initialized.
    pub fn current_user(&self) -> Option<UserId> {
        self.identity.map(|(user, _)| user)
    }

    /// Join the presence topic for a chat. Idempotent per chat id.
    ///
    /// The entry is tracked under the user id as key, so the transport
    /// collapses multiple devices of the same user into one entry.
    pub fn join_chat_presence(&mut self, chat_id: ChatId) -> Result<()> {
        let Some((user_id, role)) = self.identity else {
            warn!(chat = %chat_id, "join_chat_presence before initialize, ignoring");
            return Ok(());
        };

        if self.chats.contains_key(&chat_id) {
            debug!(chat = %chat_id, "already joined chat presence");
            return Ok(());
        }

        let topic = self.conn.presence_topic(&chat_id.to_presence_topic());
        topic.track(
            &user_id.to_string(),
            &PresencePayload::chat(user_id, role, false),
        )?;

        self.chats.insert(
            chat_id,
            ChatTopic {
                topic,
                is_typing: false,
            },
        );
        debug!(chat = %chat_id, user = %user_id, "joined chat presence");
        Ok(())
    }

    /// Leave a chat's presence topic and forget the handle. Safe to
    /// call for a chat that was never joined.
    pub fn leave_chat_presence(&mut self, chat_id: ChatId) {
        let Some(chat) = self.chats.remove(&chat_id) else {
            return;
        };
        if let Some((user_id, _)) = self.identity {
            chat.topic.untrack(&user_id.to_string());
        }
        debug!(chat = %chat_id, "left chat presence");
    }

    /// Re-publish the chat-topic payload with an updated typing flag
    /// and a fresh `online_at`. Logged no-op when not joined.
    pub fn update_typing_status(&mut self, chat_id: ChatId, is_typing: bool) -> Result<()> {
        let Some((user_id, role)) = self.identity else {
            warn!(chat = %chat_id, "typing update before initialize, ignoring");
            return Ok(());
        };
        let Some(chat) = self.chats.get_mut(&chat_id) else {
            warn!(chat = %chat_id, "typing update for chat presence not joined, ignoring");
            return Ok(());
        };

        chat.is_typing = is_typing;
        chat.topic.track(
            &user_id.to_string(),
            &PresencePayload::chat(user_id, role, is_typing),
        )?;
        debug!(chat = %chat_id, is_typing, "typing status published");
        Ok(())
    }

    /// Snapshot of the global presence map, keyed by user. Empty when
    /// uninitialized.
    pub fn global_presence_state(&self) -> HashMap<UserId, PresencePayload> {
        self.global.as_ref().map(parse_topic_state).unwrap_or_default()
    }

    /// Snapshot of one chat's presence map, keyed by user. Empty when
    /// that chat's topic is not open.
    pub fn chat_presence_state(&self, chat_id: ChatId) -> HashMap<UserId, PresencePayload> {
        self.chats
            .get(&chat_id)
            .map(|c| parse_topic_state(&c.topic))
            .unwrap_or_default()
    }

    /// Untrack everything, close all topic handles, and mark the
    /// manager uninitialized.
    pub fn cleanup(&mut self) {
        let Some((user_id, _)) = self.identity.take() else {
            return;
        };
        let key = user_id.to_string();

        if let Some(global) = self.global.take() {
            global.untrack(&key);
        }
        for (_, chat) in self.chats.drain() {
            chat.topic.untrack(&key);
        }
        info!(user = %user_id, "presence cleaned up");
    }
}

impl Drop for PresenceManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Decode a topic's raw JSON entries into typed payloads, skipping any
/// that fail to parse.
fn parse_topic_state(topic: &PresenceTopic) -> HashMap<UserId, PresencePayload> {
    topic
        .presence_state()
        .into_iter()
        .filter_map(|(key, value)| {
            match serde_json::from_value::<PresencePayload>(value) {
                Ok(payload) => Some((payload.user_id, payload)),
                Err(e) => {
                    debug!(key, error = %e, "skipping malformed presence entry");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Broker, PresenceManager) {
        let broker = Broker::new();
        let pm = PresenceManager::new(&broker);
        (broker, pm)
    }

    #[test]
    fn initialize_is_idempotent_per_user() {
        let (broker, mut pm) = manager();
        let user = UserId::new();

        pm.initialize(user, Role::Driver).unwrap();
        pm.initialize(user, Role::Driver).unwrap();

        let observer = broker.connect();
        let state = observer
            .presence_topic(GLOBAL_PRESENCE_TOPIC)
            .presence_state();
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn switching_users_replaces_tracked_entry() {
        let (broker, mut pm) = manager();
        let first = UserId::new();
        let second = UserId::new();

        pm.initialize(first, Role::Driver).unwrap();
        pm.initialize(second, Role::Admin).unwrap();

        let observer = broker.connect();
        let state = observer
            .presence_topic(GLOBAL_PRESENCE_TOPIC)
            .presence_state();
        assert_eq!(state.len(), 1);
        assert!(state.contains_key(&second.to_string()));
    }

    #[test]
    fn chat_join_leave_and_typing() {
        let (_broker, mut pm) = manager();
        let user = UserId::new();
        let chat = ChatId::new();

        pm.initialize(user, Role::Admin).unwrap();
        pm.join_chat_presence(chat).unwrap();
        // Idempotent join.
        pm.join_chat_presence(chat).unwrap();

        let state = pm.chat_presence_state(chat);
        assert_eq!(state.len(), 1);
        assert_eq!(state[&user].is_typing, Some(false));

        pm.update_typing_status(chat, true).unwrap();
        assert_eq!(pm.chat_presence_state(chat)[&user].is_typing, Some(true));

        pm.leave_chat_presence(chat);
        assert!(pm.chat_presence_state(chat).is_empty());
        // Leaving twice is safe.
        pm.leave_chat_presence(chat);
    }

    #[test]
    fn typing_update_refreshes_online_at() {
        let (_broker, mut pm) = manager();
        let user = UserId::new();
        let chat = ChatId::new();

        pm.initialize(user, Role::Driver).unwrap();
        pm.join_chat_presence(chat).unwrap();
        let before = pm.chat_presence_state(chat)[&user].online_at;

        std::thread::sleep(std::time::Duration::from_millis(2));
        pm.update_typing_status(chat, true).unwrap();
        let after = pm.chat_presence_state(chat)[&user].online_at;

        assert!(after > before);
    }

    #[test]
    fn typing_without_join_is_a_logged_no_op() {
        let (_broker, mut pm) = manager();
        pm.initialize(UserId::new(), Role::Driver).unwrap();
        // Never joined; must not error.
        pm.update_typing_status(ChatId::new(), true).unwrap();
    }

    #[test]
    fn cleanup_untracks_everything() {
        let (broker, mut pm) = manager();
        let user = UserId::new();
        let chat = ChatId::new();

        pm.initialize(user, Role::Driver).unwrap();
        pm.join_chat_presence(chat).unwrap();
        pm.cleanup();

        assert!(!pm.is_initialized());
        assert!(pm.global_presence_state().is_empty());

        let observer = broker.connect();
        assert!(observer
            .presence_topic(GLOBAL_PRESENCE_TOPIC)
            .presence_state()
            .is_empty());
        assert!(observer
            .presence_topic(&chat.to_presence_topic())
            .presence_state()
            .is_empty());
    }

    #[test]
    fn state_reads_before_initialize_are_empty() {
        let (_broker, pm) = manager();
        assert!(pm.global_presence_state().is_empty());
        assert!(pm.chat_presence_state(ChatId::new()).is_empty());
    }
}
