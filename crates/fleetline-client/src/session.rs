//! App-lifecycle controller.
//!
//! [`AppSession`] owns the signed-in identity and the two presence
//! halves (durable tracker, ephemeral manager), wires them to app
//! lifecycle transitions, and acts as the factory for per-conversation
//! [`ChatSession`]s and per-screen [`PresenceView`]s.
//!
//! Startup is bounded: if the auth provider does not answer within the
//! fetch timeout, the app proceeds signed-out instead of hanging on a
//! splash screen. Presence and online-status failures during sign-in
//! are logged, never propagated; a user whose presence publish failed
//! must still land in the app.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use fleetline_realtime::Broker;
use fleetline_shared::constants::AUTH_FETCH_TIMEOUT_SECS;
use fleetline_shared::{ChatId, Role, UserId};

use crate::chat_session::ChatSession;
use crate::error::{ClientError, Result};
use crate::online_status::OnlineStatusTracker;
use crate::presence_manager::PresenceManager;
use crate::presence_view::{PresenceView, PresenceViewConfig};
use crate::push::PushSink;
use crate::SharedDb;

/// A resolved authentication session, as handed over by the auth
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: UserId,
    pub role: Role,
}

/// Boundary to the authentication backend.
///
/// `fetch_session` answers the persisted session, if any. It may be
/// slow or hang; [`AppSession::start`] bounds it with a timeout.
pub trait AuthProvider {
    fn fetch_session(&self) -> impl std::future::Future<Output = anyhow::Result<Option<AuthSession>>> + Send;
}

/// Top-level coordinator for one app process.
pub struct AppSession {
    db: SharedDb,
    broker: Broker,
    presence: Arc<Mutex<PresenceManager>>,
    push: Arc<dyn PushSink>,
    platform: String,
    tracker: Option<OnlineStatusTracker>,
    auth: Option<AuthSession>,
}

impl AppSession {
    pub fn new(db: SharedDb, broker: Broker, push: Arc<dyn PushSink>, platform: &str) -> Self {
        let presence = Arc::new(Mutex::new(PresenceManager::new(&broker)));
        Self {
            db,
            broker,
            presence,
            push,
            platform: platform.to_string(),
            tracker: None,
            auth: None,
        }
    }

    /// Restore the persisted session, bounded by the auth fetch
    /// timeout. A timeout or provider error degrades to signed-out.
    pub async fn start<P: AuthProvider>(&mut self, provider: &P) -> Option<AuthSession> {
        let fetched = tokio::time::timeout(
            Duration::from_secs(AUTH_FETCH_TIMEOUT_SECS),
            provider.fetch_session(),
        )
        .await;

        match fetched {
            Ok(Ok(Some(auth))) => {
                self.sign_in(auth).await;
                Some(auth)
            }
            Ok(Ok(None)) => {
                info!("no persisted session, starting signed out");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "session fetch failed, starting signed out");
                None
            }
            Err(_) => {
                warn!(
                    timeout_secs = AUTH_FETCH_TIMEOUT_SECS,
                    "session fetch timed out, starting signed out"
                );
                None
            }
        }
    }

    /// Bring a signed-in identity online: presence, durable flag,
    /// heartbeat. Each step is best-effort and logged on failure.
    pub async fn sign_in(&mut self, auth: AuthSession) {
        self.auth = Some(auth);

        if let Err(e) = self.lock_presence().initialize(auth.user_id, auth.role) {
            warn!(user = %auth.user_id, error = %e, "presence initialization failed");
        }

        let mut tracker = OnlineStatusTracker::new(self.db.clone(), auth.user_id, &self.platform);
        if let Err(e) = tracker.set_online().await {
            warn!(user = %auth.user_id, error = %e, "could not set online status");
        }
        tracker.start_heartbeat();
        self.tracker = Some(tracker);

        info!(user = %auth.user_id, role = %auth.role, "signed in");
    }

    /// App moved to background: durable flag off, heartbeat paused.
    /// Ephemeral presence is left to the transport's own lifecycle.
    pub fn on_background(&mut self) {
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };
        tracker.stop_heartbeat();
        if let Err(e) = tracker.set_offline() {
            warn!(error = %e, "background offline transition failed");
        }
    }

    /// App returned to foreground: durable flag back on (verified),
    /// heartbeat resumed.
    pub async fn on_foreground(&mut self) {
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };
        if let Err(e) = tracker.set_online().await {
            warn!(error = %e, "foreground online transition failed");
        }
        tracker.start_heartbeat();
    }

    /// Sign out: clear presence, flip the durable flag off, stop the
    /// heartbeat, drop the identity.
    pub fn sign_out(&mut self) {
        self.lock_presence().cleanup();

        if let Some(mut tracker) = self.tracker.take() {
            tracker.stop_heartbeat();
            if let Err(e) = tracker.set_offline() {
                warn!(error = %e, "sign-out offline transition failed");
            }
        }

        if let Some(auth) = self.auth.take() {
            info!(user = %auth.user_id, "signed out");
        }
    }

    /// Open (or create) the conversation with `other_user`.
    pub async fn open_chat(&self, other_user: UserId) -> Result<ChatSession> {
        let auth = self.auth.ok_or(ClientError::NotReady)?;

        let mut chat = ChatSession::new(
            self.db.clone(),
            &self.broker,
            self.presence.clone(),
            self.push.clone(),
            auth.user_id,
            auth.role,
        );
        chat.initialize(other_user).await?;
        Ok(chat)
    }

    /// Build a presence projection for a screen, optionally scoped to a
    /// chat.
    pub fn presence_view(&self, chat_id: Option<ChatId>) -> PresenceView {
        PresenceView::new(self.presence.clone(), chat_id, PresenceViewConfig::default())
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.auth.map(|a| a.user_id)
    }

    pub fn is_signed_in(&self) -> bool {
        self.auth.is_some()
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    fn lock_presence(&self) -> std::sync::MutexGuard<'_, PresenceManager> {
        self.presence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for AppSession {
    fn drop(&mut self) {
        self.sign_out();
    }
}
