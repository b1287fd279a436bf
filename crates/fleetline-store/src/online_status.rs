//! CRUD operations for [`OnlineStatusRecord`] rows.
//!
//! The table is soft state: rows are created lazily on first presence
//! initialization (upsert, never assume existence), overwritten in
//! place, and never destroyed.

use chrono::Utc;
use rusqlite::params;

use fleetline_shared::UserId;

use crate::chats::{parse_timestamp, parse_uuid};
use crate::database::Database;
use crate::error::Result;
use crate::models::OnlineStatusRecord;

const STATUS_COLUMNS: &str = "user_id, is_online, last_seen, platform, updated_at";

impl Database {
    /// Upsert the online flag for a user, refreshing `last_seen`.
    pub fn upsert_online_status(
        &self,
        user_id: UserId,
        is_online: bool,
        platform: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO online_status (user_id, is_online, last_seen, platform, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 is_online  = excluded.is_online,
                 last_seen  = excluded.last_seen,
                 platform   = excluded.platform,
                 updated_at = excluded.updated_at",
            params![user_id.to_string(), is_online, now, platform],
        )?;
        Ok(())
    }

    /// Heartbeat: refresh `last_seen` only. Returns `false` when no row
    /// exists yet for the user.
    pub fn touch_last_seen(&self, user_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE online_status SET last_seen = ?2, updated_at = ?2 WHERE user_id = ?1",
            params![user_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Read-only snapshot of a user's durable online status.
    pub fn get_online_status(&self, user_id: UserId) -> Result<Option<OnlineStatusRecord>> {
        let found = self.conn().query_row(
            &format!("SELECT {STATUS_COLUMNS} FROM online_status WHERE user_id = ?1"),
            params![user_id.to_string()],
            row_to_status,
        );

        match found {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    /// All users currently flagged online.
    pub fn get_online_users(&self) -> Result<Vec<OnlineStatusRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {STATUS_COLUMNS} FROM online_status
             WHERE is_online = 1
             ORDER BY last_seen DESC"
        ))?;

        let rows = stmt.query_map([], row_to_status)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to an [`OnlineStatusRecord`].
fn row_to_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<OnlineStatusRecord> {
    let user_id: String = row.get(0)?;
    let is_online: bool = row.get(1)?;
    let last_seen: String = row.get(2)?;
    let platform: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    Ok(OnlineStatusRecord {
        user_id: UserId(parse_uuid(&user_id, 0)?),
        is_online,
        last_seen: parse_timestamp(&last_seen, 2)?,
        platform,
        updated_at: parse_timestamp(&updated_at, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_then_updates_in_place() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();

        assert!(db.get_online_status(user).unwrap().is_none());

        db.upsert_online_status(user, true, "ios").unwrap();
        let first = db.get_online_status(user).unwrap().unwrap();
        assert!(first.is_online);
        assert_eq!(first.platform, "ios");

        db.upsert_online_status(user, false, "android").unwrap();
        let second = db.get_online_status(user).unwrap().unwrap();
        assert!(!second.is_online);
        assert_eq!(second.platform, "android");

        // Still exactly one row.
        assert!(db.get_online_users().unwrap().is_empty());
    }

    #[test]
    fn heartbeat_refreshes_last_seen_only() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();

        // No row yet: the heartbeat reports it but does not fail.
        assert!(!db.touch_last_seen(user).unwrap());

        db.upsert_online_status(user, true, "ios").unwrap();
        let before = db.get_online_status(user).unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(db.touch_last_seen(user).unwrap());

        let after = db.get_online_status(user).unwrap().unwrap();
        assert!(after.last_seen > before.last_seen);
        assert!(after.is_online);
    }

    #[test]
    fn online_users_lists_only_online() {
        let db = Database::open_in_memory().unwrap();
        let on = UserId::new();
        let off = UserId::new();

        db.upsert_online_status(on, true, "ios").unwrap();
        db.upsert_online_status(off, false, "android").unwrap();

        let online = db.get_online_users().unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].user_id, on);
    }
}
