//! Per-screen presence projection.
//!
//! A read-only view over the Presence Manager's ephemeral state,
//! refreshed on a polling cadence rather than on every join/leave
//! event. Polling is a deliberate choice: it decouples the consuming
//! screen's re-render rate from the burst frequency of presence events.
//! Both cadences and the staleness window are tunables
//! ([`PresenceViewConfig`]).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::debug;

use fleetline_shared::constants::{
    CHAT_PRESENCE_POLL_MS, GLOBAL_PRESENCE_POLL_MS, PRESENCE_STALENESS_SECS,
};
use fleetline_shared::{ChatId, PresencePayload, UserId};

use crate::error::Result;
use crate::presence_manager::PresenceManager;

/// Tunable cadences for a presence view.
#[derive(Debug, Clone, Copy)]
pub struct PresenceViewConfig {
    pub global_poll: Duration,
    pub chat_poll: Duration,
    /// Maximum age of an entry still considered online.
    pub staleness_secs: i64,
}

impl Default for PresenceViewConfig {
    fn default() -> Self {
        Self {
            global_poll: Duration::from_millis(GLOBAL_PRESENCE_POLL_MS),
            chat_poll: Duration::from_millis(CHAT_PRESENCE_POLL_MS),
            staleness_secs: PRESENCE_STALENESS_SECS,
        }
    }
}

#[derive(Default)]
struct Snapshot {
    global: HashMap<UserId, PresencePayload>,
    chat: HashMap<UserId, PresencePayload>,
    /// Bumped only when a poll actually changed the snapshot, so
    /// consumers re-render on change, not on every poll tick.
    generation: u64,
}

/// Polling projection over presence state, scoped to one screen.
///
/// Dropping the view cancels its polling tasks.
pub struct PresenceView {
    manager: Arc<Mutex<PresenceManager>>,
    chat_id: Option<ChatId>,
    snapshot: Arc<RwLock<Snapshot>>,
    staleness_secs: i64,
    tasks: Vec<JoinHandle<()>>,
}

impl PresenceView {
    pub fn new(
        manager: Arc<Mutex<PresenceManager>>,
        chat_id: Option<ChatId>,
        config: PresenceViewConfig,
    ) -> Self {
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));
        let mut tasks = Vec::new();

        {
            let manager = manager.clone();
            let snapshot = snapshot.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.global_poll);
                loop {
                    ticker.tick().await;
                    poll_global(&manager, &snapshot);
                }
            }));
        }

        if let Some(chat_id) = chat_id {
            let manager = manager.clone();
            let snapshot = snapshot.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.chat_poll);
                loop {
                    ticker.tick().await;
                    poll_chat(&manager, &snapshot, chat_id);
                }
            }));
        }

        Self {
            manager,
            chat_id,
            snapshot,
            staleness_secs: config.staleness_secs,
            tasks,
        }
    }

    /// Poll both topics immediately instead of waiting for the next
    /// tick.
    pub fn refresh(&self) {
        poll_global(&self.manager, &self.snapshot);
        if let Some(chat_id) = self.chat_id {
            poll_chat(&self.manager, &self.snapshot, chat_id);
        }
    }

    /// Tri-state online answer.
    ///
    /// `None` means no presence data has been seen for this user on the
    /// global topic; callers must fall back to the durable store's last
    /// known value, never treat it as offline. `Some(true)` requires an
    /// entry with `online_at` inside the staleness window; an older
    /// entry answers `Some(false)` even while still present in the map.
    pub fn is_online(&self, user_id: UserId) -> Option<bool> {
        let snapshot = self.read_snapshot();
        let payload = snapshot.global.get(&user_id)?;
        let age = Utc::now().signed_duration_since(payload.online_at);
        Some(payload.online && age.num_seconds() <= self.staleness_secs)
    }

    /// Whether a user is typing in this view's chat. Always `false`
    /// without a configured chat.
    pub fn is_typing(&self, user_id: UserId) -> bool {
        if self.chat_id.is_none() {
            return false;
        }
        self.read_snapshot()
            .chat
            .get(&user_id)
            .and_then(|p| p.is_typing)
            .unwrap_or(false)
    }

    /// Monotonic counter that advances only when a poll observed an
    /// actual change. Consumers comparing generations across ticks skip
    /// redundant re-renders.
    pub fn generation(&self) -> u64 {
        self.read_snapshot().generation
    }

    // ------------------------------------------------------------------
    // Pass-throughs, so screens don't need a manager reference.
    // ------------------------------------------------------------------

    pub fn join_chat_presence(&self) -> Result<()> {
        let Some(chat_id) = self.chat_id else {
            return Ok(());
        };
        self.lock_manager().join_chat_presence(chat_id)
    }

    pub fn leave_chat_presence(&self) {
        if let Some(chat_id) = self.chat_id {
            self.lock_manager().leave_chat_presence(chat_id);
        }
    }

    pub fn update_typing_status(&self, is_typing: bool) -> Result<()> {
        let Some(chat_id) = self.chat_id else {
            debug!("typing update on a view without a chat, ignoring");
            return Ok(());
        };
        self.lock_manager().update_typing_status(chat_id, is_typing)
    }

    fn lock_manager(&self) -> std::sync::MutexGuard<'_, PresenceManager> {
        self.manager
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_snapshot(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PresenceView {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn poll_global(manager: &Arc<Mutex<PresenceManager>>, snapshot: &Arc<RwLock<Snapshot>>) {
    let state = manager
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .global_presence_state();

    let mut guard = snapshot
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if guard.global != state {
        guard.global = state;
        guard.generation += 1;
    }
}

fn poll_chat(
    manager: &Arc<Mutex<PresenceManager>>,
    snapshot: &Arc<RwLock<Snapshot>>,
    chat_id: ChatId,
) {
    let state = manager
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .chat_presence_state(chat_id);

    let mut guard = snapshot
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if guard.chat != state {
        guard.chat = state;
        guard.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use fleetline_realtime::Broker;
    use fleetline_shared::constants::GLOBAL_PRESENCE_TOPIC;
    use fleetline_shared::Role;

    fn setup() -> (Broker, Arc<Mutex<PresenceManager>>) {
        let broker = Broker::new();
        let manager = Arc::new(Mutex::new(PresenceManager::new(&broker)));
        (broker, manager)
    }

    #[tokio::test]
    async fn unknown_user_is_none_not_false() {
        let (_broker, manager) = setup();
        manager
            .lock()
            .unwrap()
            .initialize(UserId::new(), Role::Admin)
            .unwrap();

        let view = PresenceView::new(manager, None, PresenceViewConfig::default());
        view.refresh();

        assert_eq!(view.is_online(UserId::new()), None);
    }

    #[tokio::test]
    async fn fresh_entry_is_online() {
        let (_broker, manager) = setup();
        let user = UserId::new();
        manager
            .lock()
            .unwrap()
            .initialize(user, Role::Driver)
            .unwrap();

        let view = PresenceView::new(manager, None, PresenceViewConfig::default());
        view.refresh();

        assert_eq!(view.is_online(user), Some(true));
    }

    #[tokio::test]
    async fn stale_entry_is_offline_despite_being_present() {
        let (broker, manager) = setup();
        manager
            .lock()
            .unwrap()
            .initialize(UserId::new(), Role::Admin)
            .unwrap();

        // A second device publishes an entry whose online_at is past the
        // staleness window, as happens when leave events were missed.
        let stale_user = UserId::new();
        let mut payload = PresencePayload::global(stale_user, Role::Driver);
        payload.online_at = Utc::now() - ChronoDuration::seconds(PRESENCE_STALENESS_SECS + 5);

        let other_device = broker.connect();
        let topic = other_device.presence_topic(GLOBAL_PRESENCE_TOPIC);
        topic.track(&stale_user.to_string(), &payload).unwrap();

        let view = PresenceView::new(manager, None, PresenceViewConfig::default());
        view.refresh();

        assert_eq!(view.is_online(stale_user), Some(false));
    }

    #[tokio::test]
    async fn typing_projection_requires_a_chat() {
        let (_broker, manager) = setup();
        let me = UserId::new();
        let peer = UserId::new();
        let chat = ChatId::new();

        manager.lock().unwrap().initialize(me, Role::Admin).unwrap();

        let chatless = PresenceView::new(manager.clone(), None, PresenceViewConfig::default());
        assert!(!chatless.is_typing(peer));

        let view = PresenceView::new(manager.clone(), Some(chat), PresenceViewConfig::default());
        view.join_chat_presence().unwrap();
        view.update_typing_status(true).unwrap();
        view.refresh();

        // Our own typing flag is visible through the projection.
        assert!(view.is_typing(me));
        assert!(!view.is_typing(peer));
    }

    #[tokio::test]
    async fn generation_advances_only_on_change() {
        let (_broker, manager) = setup();
        let user = UserId::new();
        manager
            .lock()
            .unwrap()
            .initialize(user, Role::Driver)
            .unwrap();

        let view = PresenceView::new(manager.clone(), None, PresenceViewConfig::default());
        view.refresh();
        let after_first = view.generation();

        // Nothing changed between polls.
        view.refresh();
        view.refresh();
        assert_eq!(view.generation(), after_first);

        manager.lock().unwrap().cleanup();
        view.refresh();
        assert_eq!(view.generation(), after_first + 1);
    }
}
