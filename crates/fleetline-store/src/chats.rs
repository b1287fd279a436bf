//! CRUD operations for [`Chat`] records.
//!
//! Chat creation is idempotent under concurrent attempts: the UNIQUE
//! (driver_id, admin_id) constraint rejects the loser, which surfaces
//! as [`StoreError::UniqueViolation`](crate::StoreError::UniqueViolation)
//! so the caller can re-fetch and adopt the winner's row.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::params;

use fleetline_shared::{ChatId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Chat;

const CHAT_COLUMNS: &str =
    "id, driver_id, admin_id, last_message, last_message_time, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new chat row.
    pub fn create_chat(&self, chat: &Chat) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chats (id, driver_id, admin_id, last_message, last_message_time,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chat.id.to_string(),
                chat.driver_id.to_string(),
                chat.admin_id.to_string(),
                chat.last_message,
                chat.last_message_time.map(|t| t.to_rfc3339()),
                chat.created_at.to_rfc3339(),
                chat.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single chat by id.
    pub fn get_chat(&self, id: ChatId) -> Result<Chat> {
        self.conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id.to_string()],
                row_to_chat,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => other.into(),
            })
    }

    /// Look up the chat for a (driver, admin) pair, if one exists.
    pub fn find_chat_by_pair(&self, driver_id: UserId, admin_id: UserId) -> Result<Option<Chat>> {
        let found = self.conn().query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE driver_id = ?1 AND admin_id = ?2"),
            params![driver_id.to_string(), admin_id.to_string()],
            row_to_chat,
        );

        match found {
            Ok(chat) => Ok(Some(chat)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    /// List every chat the user participates in, most recently updated
    /// first. The returned list is unique by chat id; that invariant is
    /// enforced here, at the data-access boundary, not at render sites.
    pub fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats
             WHERE driver_id = ?1 OR admin_id = ?1
             ORDER BY updated_at DESC"
        ))?;

        let rows = stmt.query_map(params![user_id.to_string()], row_to_chat)?;

        let mut seen = HashSet::new();
        let mut chats = Vec::new();
        for row in rows {
            let chat = row?;
            if seen.insert(chat.id) {
                chats.push(chat);
            }
        }
        Ok(chats)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Refresh the denormalized preview columns after a send.
    ///
    /// Fails with `MissingColumn("last_message_time")` on schemas that
    /// lack the optional timestamp column; callers should degrade to
    /// [`Database::update_chat_preview_text`].
    pub fn update_chat_preview(
        &self,
        id: ChatId,
        last_message: &str,
        last_message_time: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE chats
             SET last_message = ?2, last_message_time = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                id.to_string(),
                last_message,
                last_message_time.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Preview update without the optional timestamp column.
    pub fn update_chat_preview_text(&self, id: ChatId, last_message: &str) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE chats SET last_message = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), last_message, Utc::now().to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Chat`].
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let id: String = row.get(0)?;
    let driver_id: String = row.get(1)?;
    let admin_id: String = row.get(2)?;
    let last_message: Option<String> = row.get(3)?;
    let last_message_time: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(Chat {
        id: ChatId(parse_uuid(&id, 0)?),
        driver_id: UserId(parse_uuid(&driver_id, 1)?),
        admin_id: UserId(parse_uuid(&admin_id, 2)?),
        last_message,
        last_message_time: last_message_time
            .map(|t| parse_timestamp(&t, 4))
            .transpose()?,
        created_at: parse_timestamp(&created_at, 5)?,
        updated_at: parse_timestamp(&updated_at, 6)?,
    })
}

pub(crate) fn parse_uuid(s: &str, col: usize) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_timestamp(s: &str, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}
