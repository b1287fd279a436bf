//! Durable online-status tracking.
//!
//! The durable `online_status` table complements ephemeral presence: it
//! needs explicit, verified transitions so the flag ends up correct even
//! when a session dies abnormally (app killed without a clean unmount).
//! `set_online` therefore reads its own write back; `set_offline` is
//! best-effort because it runs on logout/background paths that must not
//! stall.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetline_shared::constants::{
    HEARTBEAT_INTERVAL_SECS, ONLINE_BACKOFF_BASE_MS, ONLINE_VERIFY_ATTEMPTS,
    ONLINE_VERIFY_SETTLE_MS, ONLINE_VERIFY_SPACING_MS, ONLINE_WRITE_ATTEMPTS,
};
use fleetline_shared::UserId;
use fleetline_store::OnlineStatusRecord;

use crate::error::{ClientError, Result};
use crate::retry::{with_backoff, write_then_verify, Backoff, VerifyError};
use crate::{lock_db, SharedDb};

/// Owns the durable online flag for one signed-in user.
pub struct OnlineStatusTracker {
    db: SharedDb,
    user_id: UserId,
    platform: String,
    heartbeat: Option<JoinHandle<()>>,
}

impl OnlineStatusTracker {
    pub fn new(db: SharedDb, user_id: UserId, platform: &str) -> Self {
        Self {
            db,
            user_id,
            platform: platform.to_string(),
            heartbeat: None,
        }
    }

    /// Flip the flag to online and verify the write by read-back.
    ///
    /// The whole write+verify is retried with exponential backoff for
    /// transient failures; a write that keeps succeeding without the
    /// read-back ever reflecting it fails with
    /// [`ClientError::VerificationFailed`].
    pub async fn set_online(&self) -> Result<()> {
        let policy = Backoff::new(
            ONLINE_WRITE_ATTEMPTS,
            Duration::from_millis(ONLINE_BACKOFF_BASE_MS),
        );
        let user_id = self.user_id;

        with_backoff(policy, "set_online", || {
            let db = self.db.clone();
            let platform = self.platform.clone();
            async move {
                let write_db = db.clone();
                let outcome = write_then_verify(
                    || {
                        let db = write_db.clone();
                        let platform = platform.clone();
                        async move { lock_db(&db).upsert_online_status(user_id, true, &platform) }
                    },
                    || {
                        let db = db.clone();
                        async move {
                            Ok(lock_db(&db)
                                .get_online_status(user_id)?
                                .map(|r| r.is_online)
                                .unwrap_or(false))
                        }
                    },
                    ONLINE_VERIFY_ATTEMPTS,
                    Duration::from_millis(ONLINE_VERIFY_SETTLE_MS),
                    Duration::from_millis(ONLINE_VERIFY_SPACING_MS),
                )
                .await;

                match outcome {
                    Ok(()) => Ok(()),
                    Err(VerifyError::Op(e)) => Err(ClientError::Store(e)),
                    Err(VerifyError::Unverified) => {
                        Err(ClientError::VerificationFailed { user_id })
                    }
                }
            }
        })
        .await?;

        info!(user = %self.user_id, "online status set and verified");
        Ok(())
    }

    /// Flip the flag to offline. Best-effort: no verification, single
    /// attempt.
    pub fn set_offline(&self) -> Result<()> {
        lock_db(&self.db).upsert_online_status(self.user_id, false, &self.platform)?;
        info!(user = %self.user_id, "online status set to offline");
        Ok(())
    }

    /// Start the periodic `last_seen` refresh. Idempotent; failures are
    /// logged and do not stop the interval.
    pub fn start_heartbeat(&mut self) {
        if self.heartbeat.is_some() {
            return;
        }

        let db = self.db.clone();
        let user_id = self.user_id;
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            // The first tick fires immediately; skip it, set_online just
            // refreshed last_seen.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match lock_db(&db).touch_last_seen(user_id) {
                    Ok(true) => debug!(user = %user_id, "heartbeat refreshed last_seen"),
                    Ok(false) => warn!(user = %user_id, "heartbeat found no status row"),
                    Err(e) => warn!(user = %user_id, error = %e, "heartbeat failed"),
                }
            }
        }));

        debug!(user = %self.user_id, interval_secs = HEARTBEAT_INTERVAL_SECS, "heartbeat started");
    }

    /// Stop the heartbeat task, if running.
    pub fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
            debug!(user = %self.user_id, "heartbeat stopped");
        }
    }

    /// Read-only snapshot of a user's durable status.
    pub fn online_status(&self, user_id: UserId) -> Result<Option<OnlineStatusRecord>> {
        Ok(lock_db(&self.db).get_online_status(user_id)?)
    }

    /// All users currently flagged online.
    pub fn online_users(&self) -> Result<Vec<OnlineStatusRecord>> {
        Ok(lock_db(&self.db).get_online_users()?)
    }
}

impl Drop for OnlineStatusTracker {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetline_store::Database;
    use std::sync::{Arc, Mutex};

    fn shared_db() -> SharedDb {
        Arc::new(Mutex::new(Database::open_in_memory().unwrap()))
    }

    #[tokio::test(start_paused = true)]
    async fn background_foreground_cycle() {
        let db = shared_db();
        let user = UserId::new();
        let tracker = OnlineStatusTracker::new(db.clone(), user, "ios");

        tracker.set_online().await.unwrap();
        assert!(lock_db(&db).get_online_status(user).unwrap().unwrap().is_online);

        tracker.set_offline().unwrap();
        assert!(!lock_db(&db).get_online_status(user).unwrap().unwrap().is_online);

        // Returning to foreground verifies within the retry budget.
        tracker.set_online().await.unwrap();
        assert!(lock_db(&db).get_online_status(user).unwrap().unwrap().is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_refreshes_last_seen() {
        let db = shared_db();
        let user = UserId::new();
        let mut tracker = OnlineStatusTracker::new(db.clone(), user, "android");

        tracker.set_online().await.unwrap();
        let before = lock_db(&db).get_online_status(user).unwrap().unwrap();

        tracker.start_heartbeat();
        // Two intervals elapse under paused time.
        tokio::time::sleep(Duration::from_secs(HEARTBEAT_INTERVAL_SECS * 2 + 1)).await;
        tracker.stop_heartbeat();

        let after = lock_db(&db).get_online_status(user).unwrap().unwrap();
        assert!(after.last_seen >= before.last_seen);
        assert!(after.is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reads_pass_through() {
        let db = shared_db();
        let me = UserId::new();
        let other = UserId::new();
        let tracker = OnlineStatusTracker::new(db.clone(), me, "ios");

        tracker.set_online().await.unwrap();
        lock_db(&db).upsert_online_status(other, true, "web").unwrap();

        assert!(tracker.online_status(other).unwrap().unwrap().is_online);
        assert_eq!(tracker.online_users().unwrap().len(), 2);
        assert!(tracker.online_status(UserId::new()).unwrap().is_none());
    }
}
