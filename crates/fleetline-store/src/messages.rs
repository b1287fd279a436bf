//! CRUD operations for [`Message`] records.
//!
//! The store assigns message identity: `insert_message` generates the
//! id and timestamps and returns the full row, which is what optimistic
//! local entries reconcile against. Deletes are soft (an UPDATE setting
//! `deleted`), never row removal.

use chrono::Utc;
use rusqlite::params;

use fleetline_shared::{ChatId, MessageId, UserId};

use crate::chats::{parse_timestamp, parse_uuid};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, text, image_url, created_at, updated_at,
                               read, delivered, deleted, deleted_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new message and return the stored row.
    ///
    /// Identity (`id`) and timestamps are assigned here, at the store
    /// boundary, not by the caller.
    pub fn insert_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        text: &str,
        image_url: Option<&str>,
    ) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: MessageId::new(),
            chat_id,
            sender_id,
            text: text.to_string(),
            image_url: image_url.map(str::to_string),
            created_at: now,
            updated_at: now,
            read: false,
            delivered: false,
            deleted: false,
            deleted_at: None,
        };

        self.conn().execute(
            "INSERT INTO messages (id, chat_id, sender_id, text, image_url,
                                   created_at, updated_at, read, delivered, deleted, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id.to_string(),
                message.chat_id.to_string(),
                message.sender_id.to_string(),
                message.text,
                message.image_url,
                message.created_at.to_rfc3339(),
                message.updated_at.to_rfc3339(),
                message.read,
                message.delivered,
                message.deleted,
                message.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        Ok(message)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch the most recent `limit` messages for a chat, newest first.
    pub fn get_messages_for_chat(&self, chat_id: ChatId, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![chat_id.to_string(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Fetch a single message by id.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => other.into(),
            })
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Batched read receipt, scoped to the messages the reader actually
    /// fetched: flip `read` on each listed id that is unread and was
    /// not sent by `reader_id`. Returns the updated rows so callers can
    /// fan the change out.
    pub fn mark_messages_read(&self, reader_id: UserId, ids: &[MessageId]) -> Result<Vec<Message>> {
        let now = Utc::now().to_rfc3339();
        let mut updated = Vec::new();
        for id in ids {
            let affected = self.conn().execute(
                "UPDATE messages
                 SET read = 1, updated_at = ?3
                 WHERE id = ?1 AND sender_id != ?2 AND read = 0",
                params![id.to_string(), reader_id.to_string(), now],
            )?;
            if affected > 0 {
                updated.push(self.get_message(*id)?);
            }
        }
        Ok(updated)
    }

    /// Recipient-side flip for a message that just arrived over the
    /// realtime subscription. Returns the updated row, or `None` when
    /// no such row exists locally.
    pub fn mark_message_delivered_read(&self, id: MessageId) -> Result<Option<Message>> {
        let affected = self.conn().execute(
            "UPDATE messages SET delivered = 1, read = 1, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )?;
        if affected == 0 {
            return Ok(None);
        }
        self.get_message(id).map(Some)
    }

    /// Soft-delete a message, constrained to its sender. Returns the
    /// updated row.
    ///
    /// A non-sender caller hits the `sender_id` predicate, updates
    /// nothing, and gets [`StoreError::NotFound`].
    pub fn soft_delete_message(&self, id: MessageId, sender_id: UserId) -> Result<Message> {
        let now = Utc::now();
        let affected = self.conn().execute(
            "UPDATE messages
             SET deleted = 1, deleted_at = ?3, updated_at = ?3
             WHERE id = ?1 AND sender_id = ?2",
            params![id.to_string(), sender_id.to_string(), now.to_rfc3339()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_message(id)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let chat_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let text: String = row.get(3)?;
    let image_url: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let read: bool = row.get(7)?;
    let delivered: bool = row.get(8)?;
    let deleted: bool = row.get(9)?;
    let deleted_at: Option<String> = row.get(10)?;

    Ok(Message {
        id: MessageId(parse_uuid(&id, 0)?),
        chat_id: ChatId(parse_uuid(&chat_id, 1)?),
        sender_id: UserId(parse_uuid(&sender_id, 2)?),
        text,
        image_url,
        created_at: parse_timestamp(&created_at, 5)?,
        updated_at: parse_timestamp(&updated_at, 6)?,
        read,
        delivered,
        deleted,
        deleted_at: deleted_at.map(|t| parse_timestamp(&t, 10)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chat;

    fn chat_in_db(db: &Database) -> Chat {
        let chat = Chat::new(UserId::new(), UserId::new());
        db.create_chat(&chat).unwrap();
        chat
    }

    #[test]
    fn insert_assigns_identity_and_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_in_db(&db);

        let sent = db
            .insert_message(chat.id, chat.driver_id, "hello", None)
            .unwrap();
        let fetched = db.get_message(sent.id).unwrap();

        assert_eq!(fetched, sent);
        assert!(!fetched.read);
        assert!(!fetched.delivered);
        assert!(!fetched.deleted);
    }

    #[test]
    fn page_is_newest_first_and_bounded() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_in_db(&db);

        let mut ids = Vec::new();
        for i in 0..5 {
            let m = db
                .insert_message(chat.id, chat.driver_id, &format!("m{i}"), None)
                .unwrap();
            ids.push(m.id);
            // Distinct created_at per row.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let page = db.get_messages_for_chat(chat.id, 3).unwrap();
        assert_eq!(page.len(), 3);
        assert!(page.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert_eq!(page[0].id, ids[4]);
    }

    #[test]
    fn mark_messages_read_skips_own_messages() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_in_db(&db);

        let from_driver = db
            .insert_message(chat.id, chat.driver_id, "from driver", None)
            .unwrap();
        let from_admin = db
            .insert_message(chat.id, chat.admin_id, "from admin", None)
            .unwrap();

        // Admin reads both: only the driver's message flips.
        let updated = db
            .mark_messages_read(chat.admin_id, &[from_driver.id, from_admin.id])
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, from_driver.id);
        assert!(updated[0].read);
        assert!(!db.get_message(from_admin.id).unwrap().read);

        // Second pass is a no-op.
        assert!(db
            .mark_messages_read(chat.admin_id, &[from_driver.id, from_admin.id])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn mark_messages_read_touches_only_listed_ids() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_in_db(&db);

        let mut ids = Vec::new();
        for i in 0..3 {
            let m = db
                .insert_message(chat.id, chat.driver_id, &format!("m{i}"), None)
                .unwrap();
            ids.push(m.id);
        }

        let updated = db.mark_messages_read(chat.admin_id, &ids[..1]).unwrap();
        assert_eq!(updated.len(), 1);

        let read_count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM messages WHERE read = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(read_count, 1);
    }

    #[test]
    fn delivered_flip_returns_row_or_none() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_in_db(&db);

        let m = db
            .insert_message(chat.id, chat.driver_id, "hi", None)
            .unwrap();

        let flipped = db.mark_message_delivered_read(m.id).unwrap().unwrap();
        assert!(flipped.delivered);
        assert!(flipped.read);

        assert!(db
            .mark_message_delivered_read(MessageId::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn soft_delete_is_sender_only() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_in_db(&db);

        let m = db
            .insert_message(chat.id, chat.driver_id, "oops", None)
            .unwrap();

        // The recipient cannot delete it.
        match db.soft_delete_message(m.id, chat.admin_id) {
            Err(StoreError::NotFound) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }

        let deleted = db.soft_delete_message(m.id, chat.driver_id).unwrap();
        assert!(deleted.deleted);
        assert!(deleted.deleted_at.is_some());

        // Row still exists.
        assert!(db.get_message(m.id).is_ok());
    }
}
