//! Table-scoped row-change notifications.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// The kind of row mutation a change notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A single row-change notification: the table it happened on, the kind
/// of mutation, and the full row as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub op: ChangeOp,
    pub row: serde_json::Value,
}

/// Column-equality filter applied to incoming changes (e.g.
/// `chat_id = <uuid>`).
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    pub column: String,
    pub value: String,
}

impl ChangeFilter {
    pub fn eq(column: &str, value: impl ToString) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    /// Whether a row passes the filter. Missing columns never match.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

/// A filtered subscription to one table's change stream.
pub struct ChangeSubscription {
    rx: broadcast::Receiver<RowChange>,
    filter: Option<ChangeFilter>,
}

impl ChangeSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<RowChange>, filter: Option<ChangeFilter>) -> Self {
        Self { rx, filter }
    }

    /// Receive the next change passing the filter.
    ///
    /// Returns `None` once the topic is gone (broker dropped). A lagged
    /// receiver skips the overwritten backlog and keeps going.
    pub async fn recv(&mut self) -> Option<RowChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => {
                    let pass = self
                        .filter
                        .as_ref()
                        .map(|f| f.matches(&change.row))
                        .unwrap_or(true);
                    if pass {
                        return Some(change);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscription lagged, skipping backlog");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;

    #[test]
    fn filter_matches_string_and_non_string_columns() {
        let f = ChangeFilter::eq("chat_id", "abc");
        assert!(f.matches(&serde_json::json!({"chat_id": "abc"})));
        assert!(!f.matches(&serde_json::json!({"chat_id": "def"})));
        assert!(!f.matches(&serde_json::json!({"other": "abc"})));

        let n = ChangeFilter::eq("seq", 7);
        assert!(n.matches(&serde_json::json!({"seq": 7})));
        assert!(!n.matches(&serde_json::json!({"seq": 8})));
    }

    #[tokio::test]
    async fn filtered_subscription_skips_other_rows() {
        let broker = Broker::new();
        let conn = broker.connect();

        let mut sub = conn.subscribe_changes("messages", Some(ChangeFilter::eq("chat_id", "c1")));

        for chat in ["c2", "c1", "c3"] {
            conn.publish_change(RowChange {
                table: "messages".to_string(),
                op: ChangeOp::Insert,
                row: serde_json::json!({"chat_id": chat}),
            });
        }

        let got = sub.recv().await.unwrap();
        assert_eq!(got.row["chat_id"], "c1");
    }
}
