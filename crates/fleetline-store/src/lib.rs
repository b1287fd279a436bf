//! Durable relational store for chats, messages, and online status.
//!
//! Backed by SQLite via `rusqlite`. The [`Database`] wrapper runs
//! versioned migrations on open and exposes typed CRUD; unique-key
//! violations and missing optional columns are classified into
//! dedicated [`StoreError`] variants so callers can adopt the winning
//! row or degrade the statement instead of failing the user action.

pub mod chats;
pub mod database;
pub mod error;
pub mod messages;
mod migrations;
pub mod models;
pub mod online_status;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::{Chat, Message, OnlineStatusRecord};
