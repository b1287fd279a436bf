//! Presence and real-time messaging coordination.
//!
//! This crate is the client-side core that keeps a chat's message list
//! eventually consistent across two participants and tracks who is
//! online and who is typing:
//!
//! - [`OnlineStatusTracker`]: durable online flag with write-then-verify
//!   transitions and a heartbeat.
//! - [`PresenceManager`]: ephemeral topic-scoped presence (global + one
//!   topic per open chat), owned by the [`AppSession`] and handed to
//!   consumers explicitly.
//! - [`PresenceView`]: per-screen polling projection with a staleness
//!   window and tri-state online answers.
//! - [`ChatSession`]: per-conversation controller merging optimistic
//!   local sends with server-confirmed rows arriving over the realtime
//!   subscription.

pub mod chat_session;
pub mod error;
pub mod online_status;
pub mod presence_manager;
pub mod presence_view;
pub mod push;
pub mod retry;
pub mod session;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::{fmt, EnvFilter};

pub use chat_session::{ChatSession, DeliveryState, MessageEntry, SessionState};
pub use error::{ClientError, Result};
pub use online_status::OnlineStatusTracker;
pub use presence_manager::PresenceManager;
pub use presence_view::{PresenceView, PresenceViewConfig};
pub use push::{NoopPushSink, PushSink};
pub use session::{AppSession, AuthProvider, AuthSession};

/// The database handle shared between the tracker, sessions, and
/// background tasks.
pub type SharedDb = Arc<Mutex<fleetline_store::Database>>;

/// Lock a shared database handle, recovering from poison (a panicked
/// holder leaves the data itself consistent; every statement is atomic).
pub(crate) fn lock_db(db: &SharedDb) -> MutexGuard<'_, fleetline_store::Database> {
    db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Initialize tracing with an env-filter default suitable for the app.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("fleetline_client=debug,fleetline_store=info,fleetline_realtime=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
