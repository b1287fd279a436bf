//! Tunable timing and retry constants.
//!
//! The presence timings (staleness window, poll cadences) are reference
//! values, not semantic requirements; deployments should align them with
//! the transport's actual heartbeat behavior.

/// Name of the single global presence topic (all online users).
pub const GLOBAL_PRESENCE_TOPIC: &str = "presence:global";

/// Interval between heartbeat refreshes of `last_seen` while a session
/// is active.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Maximum age of a presence entry still considered "online". Guards
/// against a topic that silently stopped receiving leave events.
pub const PRESENCE_STALENESS_SECS: i64 = 30;

/// Poll cadence for the global presence projection.
pub const GLOBAL_PRESENCE_POLL_MS: u64 = 3_000;

/// Poll cadence for a chat-scoped presence projection.
pub const CHAT_PRESENCE_POLL_MS: u64 = 2_000;

/// Trailing debounce window for typing-status publishes.
pub const TYPING_DEBOUNCE_MS: u64 = 1_000;

/// Attempts for the whole set-online operation (write + verify).
pub const ONLINE_WRITE_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between set-online attempts.
pub const ONLINE_BACKOFF_BASE_MS: u64 = 1_000;

/// Read-back attempts when verifying the online flag.
pub const ONLINE_VERIFY_ATTEMPTS: u32 = 3;

/// Spacing between verification read-backs.
pub const ONLINE_VERIFY_SPACING_MS: u64 = 1_000;

/// Settle delay before the first verification read-back. The backing
/// store may apply triggers asynchronously.
pub const ONLINE_VERIFY_SETTLE_MS: u64 = 500;

/// Bound on chat-session bootstrap (chat resolution + subscription).
pub const SESSION_BOOTSTRAP_TIMEOUT_SECS: u64 = 5;

/// Bound on the auth session fetch at app start. Exceeding it degrades
/// to "no session" rather than blocking forever.
pub const AUTH_FETCH_TIMEOUT_SECS: u64 = 10;

/// Default message page size for the initial chat window.
pub const DEFAULT_MESSAGE_PAGE_SIZE: u32 = 50;
