//! Per-topic ephemeral presence tracking.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::broker::{Broker, TrackedEntry};
use crate::error::Result;

/// Join/leave/update notifications for a presence topic.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// A key appeared on the topic.
    Join {
        key: String,
        payload: serde_json::Value,
    },
    /// An existing key re-published its payload.
    Update {
        key: String,
        payload: serde_json::Value,
    },
    /// A key left the topic (explicit untrack or connection drop).
    Leave { key: String },
}

/// Handle to a named presence topic, bound to one connection.
///
/// Tracking the same key twice replaces the payload (last write wins),
/// which is how several devices of one user collapse into one entry.
pub struct PresenceTopic {
    broker: Broker,
    topic: String,
    conn_id: u64,
}

impl PresenceTopic {
    pub(crate) fn new(broker: Broker, topic: String, conn_id: u64) -> Self {
        Self {
            broker,
            topic,
            conn_id,
        }
    }

    /// Topic name this handle is bound to.
    pub fn name(&self) -> &str {
        &self.topic
    }

    /// Publish (or re-publish) this connection's payload under `key`.
    pub fn track<P: Serialize>(&self, key: &str, payload: &P) -> Result<()> {
        let value = serde_json::to_value(payload)?;

        let mut inner = self.broker.inner.lock().expect("broker lock poisoned");
        let state = Broker::presence_topic_state(&mut inner, &self.topic);

        let replaced = state
            .entries
            .insert(
                key.to_string(),
                TrackedEntry {
                    conn_id: self.conn_id,
                    payload: value.clone(),
                },
            )
            .is_some();

        let event = if replaced {
            PresenceEvent::Update {
                key: key.to_string(),
                payload: value,
            }
        } else {
            PresenceEvent::Join {
                key: key.to_string(),
                payload: value,
            }
        };
        let _ = state.events.send(event);

        debug!(topic = %self.topic, key, replaced, "presence tracked");
        Ok(())
    }

    /// Remove the entry for `key`, if any. A topic left empty with no
    /// event subscribers is pruned from the broker.
    pub fn untrack(&self, key: &str) {
        let mut inner = self.broker.inner.lock().expect("broker lock poisoned");
        let Some(state) = inner.presence_topics.get_mut(&self.topic) else {
            return;
        };

        let removed = state.entries.remove(key).is_some();
        if removed {
            let _ = state.events.send(PresenceEvent::Leave {
                key: key.to_string(),
            });
        }

        if state.entries.is_empty() && state.events.receiver_count() == 0 {
            inner.presence_topics.remove(&self.topic);
        }
        if removed {
            debug!(topic = %self.topic, key, "presence untracked");
        }
    }

    /// Synchronous snapshot of the topic's last-known presence map.
    /// Reading never materializes the topic.
    pub fn presence_state(&self) -> HashMap<String, serde_json::Value> {
        let inner = self.broker.inner.lock().expect("broker lock poisoned");
        inner
            .presence_topics
            .get(&self.topic)
            .map(|state| {
                state
                    .entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscribe to this topic's join/leave/update events.
    pub fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        let mut inner = self.broker.inner.lock().expect("broker lock poisoned");
        Broker::presence_topic_state(&mut inner, &self.topic)
            .events
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_then_snapshot() {
        let broker = Broker::new();
        let conn = broker.connect();
        let topic = conn.presence_topic("presence:global");

        topic
            .track("u1", &serde_json::json!({"online": true}))
            .unwrap();
        topic
            .track("u2", &serde_json::json!({"online": true}))
            .unwrap();

        let state = topic.presence_state();
        assert_eq!(state.len(), 2);
        assert_eq!(state["u1"]["online"], serde_json::json!(true));
    }

    #[test]
    fn same_key_deduplicates_devices() {
        let broker = Broker::new();
        let phone = broker.connect();
        let tablet = broker.connect();

        let t1 = phone.presence_topic("presence:chat:abc");
        let t2 = tablet.presence_topic("presence:chat:abc");

        t1.track("u1", &serde_json::json!({"device": "phone"})).unwrap();
        t2.track("u1", &serde_json::json!({"device": "tablet"})).unwrap();

        let state = t1.presence_state();
        assert_eq!(state.len(), 1);
        // Last write wins.
        assert_eq!(state["u1"]["device"], serde_json::json!("tablet"));
    }

    #[tokio::test]
    async fn join_update_leave_event_sequence() {
        let broker = Broker::new();
        let conn = broker.connect();
        let topic = conn.presence_topic("presence:global");
        let mut events = topic.events();

        topic.track("u1", &serde_json::json!({"n": 1})).unwrap();
        topic.track("u1", &serde_json::json!({"n": 2})).unwrap();
        topic.untrack("u1");

        assert!(matches!(events.recv().await.unwrap(), PresenceEvent::Join { .. }));
        match events.recv().await.unwrap() {
            PresenceEvent::Update { payload, .. } => {
                assert_eq!(payload["n"], serde_json::json!(2));
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(matches!(events.recv().await.unwrap(), PresenceEvent::Leave { .. }));
    }

    #[test]
    fn emptied_topic_is_pruned_from_the_broker() {
        let broker = Broker::new();
        let conn = broker.connect();
        let topic = conn.presence_topic("presence:chat:abandoned");

        topic.track("u1", &serde_json::json!({"online": true})).unwrap();
        assert_eq!(
            broker.inner.lock().unwrap().presence_topics.len(),
            1
        );

        topic.untrack("u1");
        assert!(broker.inner.lock().unwrap().presence_topics.is_empty());
    }

    #[test]
    fn topic_with_live_listener_is_not_pruned() {
        let broker = Broker::new();
        let conn = broker.connect();
        let topic = conn.presence_topic("presence:chat:watched");

        let events = topic.events();
        topic.track("u1", &serde_json::json!({"online": true})).unwrap();
        topic.untrack("u1");

        // Empty but still subscribed to.
        assert_eq!(broker.inner.lock().unwrap().presence_topics.len(), 1);

        drop(events);
        topic.untrack("ghost");
        assert!(broker.inner.lock().unwrap().presence_topics.is_empty());
    }

    #[test]
    fn untrack_unknown_key_is_a_no_op() {
        let broker = Broker::new();
        let conn = broker.connect();
        let topic = conn.presence_topic("presence:global");
        topic.untrack("ghost");
        assert!(topic.presence_state().is_empty());
    }
}
