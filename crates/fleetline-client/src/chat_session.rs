//! Per-open-conversation controller.
//!
//! A [`ChatSession`] resolves (or creates) the durable chat row for an
//! (admin, driver) pair, loads a window of messages, subscribes to
//! row-change events scoped to that chat, merges optimistic local sends
//! with server-confirmed rows, and publishes typing status with a
//! trailing debounce.
//!
//! The in-memory message list is owned exclusively by the session for
//! its chat. All mutations happen through the inner lock; idempotency
//! (dedupe by id, replace by id) stands in for mutual exclusion where
//! the same logical event can arrive twice, e.g. an optimistic send
//! followed by its echoed INSERT.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetline_realtime::{Broker, ChangeFilter, ChangeOp, ChangeSubscription, Connection, RowChange};
use fleetline_shared::constants::{
    DEFAULT_MESSAGE_PAGE_SIZE, SESSION_BOOTSTRAP_TIMEOUT_SECS, TYPING_DEBOUNCE_MS,
};
use fleetline_shared::{ChatId, ChatPair, MessageId, Role, UserId};
use fleetline_store::{Chat, Message, StoreError};

use crate::error::{ClientError, Result};
use crate::presence_manager::PresenceManager;
use crate::push::PushSink;
use crate::{lock_db, SharedDb};

const MESSAGES_TABLE: &str = "messages";

/// Lifecycle of a session.
///
/// `Error` is reachable from `Resolving` (retryable via
/// [`ChatSession::retry`]); once `Ready`, individual operations fail
/// without leaving `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Resolving,
    Ready,
    Error,
}

/// Two-phase commit state of a list entry: speculative local entries
/// are `Pending` until the store confirms them; a failed send flips to
/// `Failed` rather than disappearing, so the user can retry or discard
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

/// One entry of the session's ordered message list.
#[derive(Debug, Clone)]
pub struct MessageEntry {
    pub message: Message,
    pub delivery: DeliveryState,
}

struct SessionInner {
    state: SessionState,
    self_id: UserId,
    role: Role,
    chat: Option<Chat>,
    messages: Vec<MessageEntry>,
    /// Idempotent-initialization guard: set on the first attempt for an
    /// other-user id, reset only on parameter change or explicit retry.
    attempted_for: Option<UserId>,
    recipient_push_token: Option<String>,
}

/// Controller for one open conversation.
pub struct ChatSession {
    inner: Arc<Mutex<SessionInner>>,
    db: SharedDb,
    broker: Broker,
    conn: Connection,
    presence: Arc<Mutex<PresenceManager>>,
    push: Arc<dyn PushSink>,
    typing: TypingDebouncer,
    listener: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession").finish_non_exhaustive()
    }
}

impl ChatSession {
    pub fn new(
        db: SharedDb,
        broker: &Broker,
        presence: Arc<Mutex<PresenceManager>>,
        push: Arc<dyn PushSink>,
        self_id: UserId,
        role: Role,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                self_id,
                role,
                chat: None,
                messages: Vec::new(),
                attempted_for: None,
                recipient_push_token: None,
            })),
            db,
            broker: broker.clone(),
            conn: broker.connect(),
            presence: presence.clone(),
            push,
            typing: TypingDebouncer::new(presence, Duration::from_millis(TYPING_DEBOUNCE_MS)),
            listener: None,
        }
    }

    /// Resolve or create the chat with `other_user` and open the
    /// realtime subscription, bounded by the bootstrap timeout.
    ///
    /// Re-invocations for the same other user are no-ops (screens
    /// re-render); a genuine parameter change tears down and resolves
    /// anew. After an `Error`, use [`ChatSession::retry`].
    pub async fn initialize(&mut self, other_user: UserId) -> Result<ChatId> {
        let previous_chat = {
            let mut inner = self.lock_inner();
            if inner.attempted_for == Some(other_user) {
                return match (inner.state, &inner.chat) {
                    (SessionState::Ready, Some(chat)) => {
                        debug!(chat = %chat.id, "session already initialized, ignoring");
                        Ok(chat.id)
                    }
                    _ => Err(ClientError::NotReady),
                };
            }

            if inner.attempted_for.is_some() {
                info!(next = %other_user, "chat partner changed, re-resolving session");
            }
            inner.attempted_for = Some(other_user);
            inner.messages.clear();
            inner.state = SessionState::Resolving;
            inner.chat.take().map(|chat| chat.id)
        };
        self.teardown_subscription();
        if let Some(chat_id) = previous_chat {
            self.lock_presence().leave_chat_presence(chat_id);
        }

        let bootstrap = tokio::time::timeout(
            Duration::from_secs(SESSION_BOOTSTRAP_TIMEOUT_SECS),
            self.bootstrap(other_user),
        )
        .await;

        match bootstrap {
            Ok(Ok(chat_id)) => Ok(chat_id),
            Ok(Err(e)) => {
                self.lock_inner().state = SessionState::Error;
                Err(e)
            }
            Err(_) => {
                self.lock_inner().state = SessionState::Error;
                warn!("session bootstrap timed out");
                Err(ClientError::BootstrapTimeout)
            }
        }
    }

    /// Explicit retry after an `Error`: clears the initialization guard
    /// and resolves again.
    pub async fn retry(&mut self, other_user: UserId) -> Result<ChatId> {
        {
            let mut inner = self.lock_inner();
            inner.attempted_for = None;
            inner.state = SessionState::Uninitialized;
        }
        self.initialize(other_user).await
    }

    async fn bootstrap(&mut self, other_user: UserId) -> Result<ChatId> {
        tokio::task::yield_now().await;

        let (self_id, role) = {
            let inner = self.lock_inner();
            (inner.self_id, inner.role)
        };
        let pair = ChatPair::resolve(self_id, role, other_user);
        let chat = create_or_get_chat(&self.db, pair)?;
        let chat_id = chat.id;

        // Subscribe before going Ready so no INSERT slips between the
        // initial load and the live stream.
        let subscription = self.conn.subscribe_changes(
            MESSAGES_TABLE,
            Some(ChangeFilter::eq("chat_id", chat_id)),
        );
        self.spawn_listener(subscription);

        // Chat presence is best-effort; its failure never blocks the
        // conversation.
        if let Err(e) = self.lock_presence().join_chat_presence(chat_id) {
            warn!(chat = %chat_id, error = %e, "could not join chat presence");
        }

        let mut inner = self.lock_inner();
        inner.chat = Some(chat);
        inner.state = SessionState::Ready;
        info!(chat = %chat_id, other = %other_user, "chat session ready");
        Ok(chat_id)
    }

    /// [`ChatSession::load_messages`] with the default page size.
    pub fn load_recent_messages(&self) -> Result<Vec<MessageEntry>> {
        self.load_messages(DEFAULT_MESSAGE_PAGE_SIZE)
    }

    /// Fetch the newest `page_size` messages and adopt them as the
    /// in-memory list. Side effect: batched, best-effort read receipt
    /// for the fetched messages someone else sent; messages outside the
    /// fetched window stay unread. The flipped rows are published as
    /// UPDATE changes so the sender's session sees them.
    pub fn load_messages(&self, page_size: u32) -> Result<Vec<MessageEntry>> {
        let (chat_id, self_id) = self.require_ready()?;

        let rows = lock_db(&self.db).get_messages_for_chat(chat_id, page_size)?;
        let fetched: Vec<MessageId> = rows.iter().map(|m| m.id).collect();

        {
            let mut inner = self.lock_inner();
            inner.messages = rows
                .into_iter()
                .map(|message| MessageEntry {
                    message,
                    delivery: DeliveryState::Confirmed,
                })
                .collect();
            sort_newest_first(&mut inner.messages);
        }

        match lock_db(&self.db).mark_messages_read(self_id, &fetched) {
            Ok(updated) => {
                {
                    let mut inner = self.lock_inner();
                    for row in &updated {
                        if let Some(entry) =
                            inner.messages.iter_mut().find(|m| m.message.id == row.id)
                        {
                            entry.message = row.clone();
                        }
                    }
                }
                for row in updated {
                    self.conn.publish_change(RowChange {
                        table: MESSAGES_TABLE.to_string(),
                        op: ChangeOp::Update,
                        row: serde_json::to_value(&row)?,
                    });
                }
            }
            Err(e) => warn!(chat = %chat_id, error = %e, "batched read receipt failed"),
        }

        Ok(self.messages())
    }

    /// Send a message: speculative pending entry, store insert, confirm
    /// by server id, publish the row change, refresh the chat preview,
    /// fire the push notification.
    ///
    /// On failure the pending entry flips to `Failed` and stays in the
    /// list for [`ChatSession::retry_message`] /
    /// [`ChatSession::discard_failed`].
    pub fn send_message(&self, text: &str, image_url: Option<&str>) -> Result<MessageEntry> {
        let (chat_id, self_id) = self.require_ready()?;

        // Phase one: speculative local entry.
        let now = Utc::now();
        let local_id = MessageId::new();
        let speculative = Message {
            id: local_id,
            chat_id,
            sender_id: self_id,
            text: text.to_string(),
            image_url: image_url.map(str::to_string),
            created_at: now,
            updated_at: now,
            read: false,
            delivered: false,
            deleted: false,
            deleted_at: None,
        };
        {
            let mut inner = self.lock_inner();
            inner.messages.push(MessageEntry {
                message: speculative,
                delivery: DeliveryState::Pending,
            });
            sort_newest_first(&mut inner.messages);
        }

        // Phase two: the store assigns identity and confirms.
        let inserted = lock_db(&self.db).insert_message(chat_id, self_id, text, image_url);
        let confirmed = match inserted {
            Ok(row) => row,
            Err(e) => {
                let mut inner = self.lock_inner();
                if let Some(entry) = inner.messages.iter_mut().find(|m| m.message.id == local_id) {
                    entry.delivery = DeliveryState::Failed;
                }
                warn!(chat = %chat_id, error = %e, "send failed, entry marked for retry");
                return Err(e.into());
            }
        };

        let entry = MessageEntry {
            message: confirmed.clone(),
            delivery: DeliveryState::Confirmed,
        };
        {
            let mut inner = self.lock_inner();
            if let Some(slot) = inner.messages.iter_mut().find(|m| m.message.id == local_id) {
                *slot = entry.clone();
            }
            sort_newest_first(&mut inner.messages);
        }

        self.conn.publish_change(RowChange {
            table: MESSAGES_TABLE.to_string(),
            op: ChangeOp::Insert,
            row: serde_json::to_value(&confirmed)?,
        });

        self.update_chat_preview(chat_id, &confirmed);
        self.notify_recipient(&confirmed);

        Ok(entry)
    }

    /// Re-attempt a failed send, preserving its text and attachment.
    pub fn retry_message(&self, id: MessageId) -> Result<MessageEntry> {
        let (text, image_url) = {
            let mut inner = self.lock_inner();
            let index = inner
                .messages
                .iter()
                .position(|m| m.message.id == id && m.delivery == DeliveryState::Failed)
                .ok_or(ClientError::UnknownMessage(id))?;
            let entry = inner.messages.remove(index);
            (entry.message.text, entry.message.image_url)
        };
        self.send_message(&text, image_url.as_deref())
    }

    /// Drop a failed entry the user chose not to retry. Returns whether
    /// anything was removed.
    pub fn discard_failed(&self, id: MessageId) -> bool {
        let mut inner = self.lock_inner();
        let before = inner.messages.len();
        inner
            .messages
            .retain(|m| !(m.message.id == id && m.delivery == DeliveryState::Failed));
        inner.messages.len() != before
    }

    /// Soft-delete one of our own messages. The entry stays in the list
    /// as a placeholder; the store enforces the sender constraint a
    /// second time.
    pub fn delete_message(&self, id: MessageId) -> Result<()> {
        let (_, self_id) = self.require_ready()?;

        {
            let inner = self.lock_inner();
            let entry = inner
                .messages
                .iter()
                .find(|m| m.message.id == id)
                .ok_or(ClientError::UnknownMessage(id))?;
            if entry.message.sender_id != self_id {
                return Err(ClientError::NotMessageSender);
            }
        }

        let updated = lock_db(&self.db).soft_delete_message(id, self_id)?;

        {
            let mut inner = self.lock_inner();
            if let Some(entry) = inner.messages.iter_mut().find(|m| m.message.id == id) {
                entry.message = updated.clone();
            }
        }

        self.conn.publish_change(RowChange {
            table: MESSAGES_TABLE.to_string(),
            op: ChangeOp::Update,
            row: serde_json::to_value(&updated)?,
        });

        debug!(message = %id, "message soft-deleted");
        Ok(())
    }

    /// Publish typing status for this chat, debounced (trailing) so a
    /// burst of keystrokes produces a single presence publish.
    pub fn set_typing(&self, is_typing: bool) {
        let chat_id = {
            let inner = self.lock_inner();
            match &inner.chat {
                Some(chat) => chat.id,
                None => {
                    debug!("typing before session ready, ignoring");
                    return;
                }
            }
        };
        self.typing.submit(chat_id, is_typing);
    }

    /// Snapshot of the ordered message list, newest first.
    pub fn messages(&self) -> Vec<MessageEntry> {
        self.lock_inner().messages.clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.lock_inner().chat.as_ref().map(|c| c.id)
    }

    /// Push token of the other participant, when known; used for the
    /// best-effort new-message notification.
    pub fn set_recipient_push_token(&self, token: Option<String>) {
        self.lock_inner().recipient_push_token = token;
    }

    /// Leave chat presence and stop background tasks. Also runs on
    /// drop.
    pub fn close(&mut self) {
        self.teardown_subscription();
        self.typing.cancel();
        let chat_id = self.chat_id();
        if let Some(chat_id) = chat_id {
            self.lock_presence().leave_chat_presence(chat_id);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn spawn_listener(&mut self, mut subscription: ChangeSubscription) {
        let inner = self.inner.clone();
        let db = self.db.clone();
        // Separate connection: receipts published from the task outlive
        // any borrow of the session.
        let publisher = self.broker.connect();

        self.listener = Some(tokio::spawn(async move {
            while let Some(change) = subscription.recv().await {
                let message: Message = match serde_json::from_value(change.row) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(error = %e, "ignoring malformed row change");
                        continue;
                    }
                };

                let newly_arrived = {
                    let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
                    apply_change(&mut guard, change.op, message.clone())
                };

                // Recipient-side delivery/read flip for fresh arrivals,
                // published back so the sender's copy reflects it.
                // Background action, failure is silent apart from the log.
                if newly_arrived {
                    match lock_db(&db).mark_message_delivered_read(message.id) {
                        Ok(Some(updated)) => match serde_json::to_value(&updated) {
                            Ok(row) => publisher.publish_change(RowChange {
                                table: MESSAGES_TABLE.to_string(),
                                op: ChangeOp::Update,
                                row,
                            }),
                            Err(e) => {
                                debug!(message = %message.id, error = %e, "receipt encode failed")
                            }
                        },
                        Ok(None) => {}
                        Err(e) => {
                            debug!(message = %message.id, error = %e, "delivery flip failed")
                        }
                    }
                }
            }
            debug!("chat change subscription closed");
        }));
    }

    fn teardown_subscription(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }

    fn update_chat_preview(&self, chat_id: ChatId, message: &Message) {
        let preview = if message.text.is_empty() && message.image_url.is_some() {
            "[image]"
        } else {
            message.text.as_str()
        };

        let result = lock_db(&self.db).update_chat_preview(chat_id, preview, message.created_at);
        match result {
            Ok(()) => {}
            Err(StoreError::MissingColumn(column)) => {
                // Degrade: same logical update without the optional field.
                warn!(chat = %chat_id, %column, "schema lacks optional column, retrying without it");
                if let Err(e) = lock_db(&self.db).update_chat_preview_text(chat_id, preview) {
                    warn!(chat = %chat_id, error = %e, "degraded preview update failed");
                }
            }
            Err(e) => warn!(chat = %chat_id, error = %e, "chat preview update failed"),
        }
    }

    fn notify_recipient(&self, message: &Message) {
        let token = self.lock_inner().recipient_push_token.clone();
        if let Some(token) = token {
            self.push.send(&token, "New message", &message.text);
        }
    }

    fn require_ready(&self) -> Result<(ChatId, UserId)> {
        let inner = self.lock_inner();
        match (&inner.state, &inner.chat) {
            (SessionState::Ready, Some(chat)) => Ok((chat.id, inner.self_id)),
            _ => Err(ClientError::NotReady),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_presence(&self) -> MutexGuard<'_, PresenceManager> {
        self.presence.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Merge one change into the session list. Returns `true` for an
/// INSERT from the other participant that was actually appended.
fn apply_change(inner: &mut SessionInner, op: ChangeOp, message: Message) -> bool {
    match op {
        ChangeOp::Insert => {
            // Our own echo: already applied optimistically on send.
            if message.sender_id == inner.self_id {
                return false;
            }
            // Duplicate delivery guard.
            if inner.messages.iter().any(|m| m.message.id == message.id) {
                debug!(message = %message.id, "duplicate insert ignored");
                return false;
            }
            inner.messages.push(MessageEntry {
                message,
                delivery: DeliveryState::Confirmed,
            });
            sort_newest_first(&mut inner.messages);
            true
        }
        ChangeOp::Update => {
            if let Some(entry) = inner
                .messages
                .iter_mut()
                .find(|m| m.message.id == message.id)
            {
                entry.message = message;
                entry.delivery = DeliveryState::Confirmed;
            }
            // An update can shift created_at only in pathological cases,
            // but the re-sort is cheap and keeps the invariant trivially
            // true.
            sort_newest_first(&mut inner.messages);
            false
        }
        ChangeOp::Delete => {
            // Deletes are soft in practice; handle the event anyway.
            inner.messages.retain(|m| m.message.id != message.id);
            false
        }
    }
}

/// Descending by `created_at`; ties keep insertion order (unspecified
/// and acceptable).
fn sort_newest_first(messages: &mut [MessageEntry]) {
    messages.sort_by(|a, b| b.message.created_at.cmp(&a.message.created_at));
}

/// SELECT, then INSERT, then (on losing the creation race) re-SELECT
/// and adopt the winner's row.
fn create_or_get_chat(db: &SharedDb, pair: ChatPair) -> Result<Chat> {
    let existing = lock_db(db).find_chat_by_pair(pair.driver_id, pair.admin_id)?;
    if let Some(chat) = existing {
        debug!(chat = %chat.id, "adopted existing chat");
        return Ok(chat);
    }
    insert_or_adopt(db, pair)
}

/// Attempt the insert; a unique violation means a concurrent creator
/// won, so re-fetch and adopt its row instead of failing.
fn insert_or_adopt(db: &SharedDb, pair: ChatPair) -> Result<Chat> {
    let candidate = Chat::new(pair.driver_id, pair.admin_id);
    let created = lock_db(db).create_chat(&candidate);
    match created {
        Ok(()) => {
            info!(chat = %candidate.id, "created chat");
            Ok(candidate)
        }
        Err(StoreError::UniqueViolation) => {
            info!("lost chat creation race, adopting winner");
            lock_db(db)
                .find_chat_by_pair(pair.driver_id, pair.admin_id)?
                .ok_or_else(|| {
                    ClientError::ChatCreationFailed("winner row not found after race".to_string())
                })
        }
        Err(e) => Err(ClientError::ChatCreationFailed(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Typing debounce
// ---------------------------------------------------------------------------

/// Trailing-edge debouncer for typing publishes: each submission
/// restarts the window; only the latest value is published, once the
/// window elapses without another submission.
struct TypingDebouncer {
    presence: Arc<Mutex<PresenceManager>>,
    window: Duration,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TypingDebouncer {
    fn new(presence: Arc<Mutex<PresenceManager>>, window: Duration) -> Self {
        Self {
            presence,
            window,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    fn submit(&self, chat_id: ChatId, is_typing: bool) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = pending.take() {
            previous.abort();
        }

        let presence = self.presence.clone();
        let window = self.window;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut manager = presence.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = manager.update_typing_status(chat_id, is_typing) {
                debug!(chat = %chat_id, error = %e, "debounced typing publish failed");
            }
        }));
    }

    fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }
}
