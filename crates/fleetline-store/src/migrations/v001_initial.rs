//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `chats`, `messages`, and
//! `online_status`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    driver_id         TEXT NOT NULL,              -- UUID of the driver participant
    admin_id          TEXT NOT NULL,              -- UUID of the admin participant
    last_message      TEXT,                       -- denormalized preview
    last_message_time TEXT,                       -- ISO-8601 / RFC-3339
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,

    UNIQUE (driver_id, admin_id)                  -- one chat per pair
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY NOT NULL,         -- UUID v4, store-assigned
    chat_id    TEXT NOT NULL,                     -- FK -> chats(id)
    sender_id  TEXT NOT NULL,
    text       TEXT NOT NULL,
    image_url  TEXT,
    created_at TEXT NOT NULL,                     -- display sort key
    updated_at TEXT NOT NULL,
    read       INTEGER NOT NULL DEFAULT 0,        -- boolean 0/1
    delivered  INTEGER NOT NULL DEFAULT 0,
    deleted    INTEGER NOT NULL DEFAULT 0,        -- soft delete flag
    deleted_at TEXT,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_created
    ON messages(chat_id, created_at DESC);

-- ----------------------------------------------------------------
-- Online status
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS online_status (
    user_id    TEXT PRIMARY KEY NOT NULL,         -- at most one row per user
    is_online  INTEGER NOT NULL DEFAULT 0,
    last_seen  TEXT NOT NULL,
    platform   TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
