//! The in-process broker and per-device connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::changes::{ChangeFilter, ChangeSubscription, RowChange};
use crate::presence::{PresenceEvent, PresenceTopic};

/// Broadcast buffer depth per topic. Slow subscribers past this lag are
/// skipped, not blocked on.
const TOPIC_BUFFER: usize = 256;

/// A presence entry held by the broker on behalf of one connection.
#[derive(Debug, Clone)]
pub(crate) struct TrackedEntry {
    /// Connection that owns the entry; cleared when it drops.
    pub(crate) conn_id: u64,
    pub(crate) payload: serde_json::Value,
}

/// Per-topic presence state: the key-deduplicated entry map plus the
/// event fan-out channel.
pub(crate) struct PresenceTopicState {
    pub(crate) entries: HashMap<String, TrackedEntry>,
    pub(crate) events: broadcast::Sender<PresenceEvent>,
}

impl PresenceTopicState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            events: broadcast::channel(TOPIC_BUFFER).0,
        }
    }
}

pub(crate) struct BrokerInner {
    next_conn_id: u64,
    pub(crate) presence_topics: HashMap<String, PresenceTopicState>,
    pub(crate) change_topics: HashMap<String, broadcast::Sender<RowChange>>,
}

/// The shared in-process channel service.
///
/// Cloning yields another handle to the same broker; all connections
/// created from any clone see the same topics.
#[derive(Clone)]
pub struct Broker {
    pub(crate) inner: Arc<Mutex<BrokerInner>>,
}

impl Broker {
    /// Create a new, empty broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                next_conn_id: 0,
                presence_topics: HashMap::new(),
                change_topics: HashMap::new(),
            })),
        }
    }

    /// Open a new connection (one per client device).
    pub fn connect(&self) -> Connection {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.next_conn_id += 1;
        let id = inner.next_conn_id;
        drop(inner);

        debug!(conn = id, "transport connection opened");
        Connection {
            id,
            broker: self.clone(),
        }
    }

    pub(crate) fn presence_topic_state<'a>(
        inner: &'a mut BrokerInner,
        topic: &str,
    ) -> &'a mut PresenceTopicState {
        inner
            .presence_topics
            .entry(topic.to_string())
            .or_insert_with(PresenceTopicState::new)
    }

    pub(crate) fn change_sender<'a>(
        inner: &'a mut BrokerInner,
        table: &str,
    ) -> &'a mut broadcast::Sender<RowChange> {
        inner
            .change_topics
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's connection to the broker.
///
/// All presence entries tracked through topics of this connection are
/// removed (with leave events) when the connection drops, mirroring a
/// transport that clears ephemeral state on disconnect.
pub struct Connection {
    pub(crate) id: u64,
    pub(crate) broker: Broker,
}

impl Connection {
    /// Open a handle to a named presence topic.
    pub fn presence_topic(&self, name: &str) -> PresenceTopic {
        PresenceTopic::new(self.broker.clone(), name.to_string(), self.id)
    }

    /// Publish a row-change notification for a table. In a hosted
    /// deployment the backend emits these on commit; here the writing
    /// client publishes after its local commit, so the writer receives
    /// its own echo.
    pub fn publish_change(&self, change: RowChange) {
        let table = change.table.clone();
        let mut inner = self.broker.inner.lock().expect("broker lock poisoned");
        let sender = Broker::change_sender(&mut inner, &table);
        // Err means no subscribers; drop the orphaned topic so the map
        // does not grow with every table ever published to.
        if sender.send(change).is_err() && sender.receiver_count() == 0 {
            inner.change_topics.remove(&table);
        }
    }

    /// Subscribe to row changes for a table, optionally filtered by
    /// column equality.
    pub fn subscribe_changes(&self, table: &str, filter: Option<ChangeFilter>) -> ChangeSubscription {
        let mut inner = self.broker.inner.lock().expect("broker lock poisoned");
        let rx = Broker::change_sender(&mut inner, table).subscribe();
        drop(inner);

        debug!(conn = self.id, table, filter = ?filter, "row-change subscription opened");
        ChangeSubscription::new(rx, filter)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut inner = match self.broker.inner.lock() {
            Ok(g) => g,
            Err(_) => return,
        };

        let mut removed = 0usize;
        for state in inner.presence_topics.values_mut() {
            let keys: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.conn_id == self.id)
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                state.entries.remove(&key);
                let _ = state.events.send(PresenceEvent::Leave { key });
                removed += 1;
            }
        }

        // Prune topics this drop emptied and nobody listens to.
        inner
            .presence_topics
            .retain(|_, state| !state.entries.is_empty() || state.events.receiver_count() > 0);

        if removed > 0 {
            info!(conn = self.id, entries = removed, "connection dropped, presence cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeOp;

    #[tokio::test]
    async fn change_fan_out_reaches_all_subscribers() {
        let broker = Broker::new();
        let a = broker.connect();
        let b = broker.connect();

        let mut sub_a = a.subscribe_changes("messages", None);
        let mut sub_b = b.subscribe_changes("messages", None);

        a.publish_change(RowChange {
            table: "messages".to_string(),
            op: ChangeOp::Insert,
            row: serde_json::json!({"id": "m1"}),
        });

        let got_a = sub_a.recv().await.unwrap();
        let got_b = sub_b.recv().await.unwrap();
        assert_eq!(got_a.row["id"], "m1");
        assert_eq!(got_b.row["id"], "m1");
    }

    #[test]
    fn publish_without_subscribers_leaves_no_change_topic() {
        let broker = Broker::new();
        let conn = broker.connect();

        conn.publish_change(RowChange {
            table: "messages".to_string(),
            op: ChangeOp::Insert,
            row: serde_json::json!({"id": "m1"}),
        });

        assert!(broker.inner.lock().unwrap().change_topics.is_empty());
    }

    #[tokio::test]
    async fn dropping_connection_clears_its_presence() {
        let broker = Broker::new();
        let survivor = broker.connect();
        let doomed = broker.connect();

        let topic = doomed.presence_topic("presence:global");
        topic
            .track("user-1", &serde_json::json!({"online": true}))
            .unwrap();

        let watch = survivor.presence_topic("presence:global");
        assert_eq!(watch.presence_state().len(), 1);

        let mut events = watch.events();
        drop(topic);
        drop(doomed);

        assert!(watch.presence_state().is_empty());
        match events.recv().await.unwrap() {
            PresenceEvent::Leave { key } => assert_eq!(key, "user-1"),
            other => panic!("expected leave, got {other:?}"),
        }
    }
}
