//! Push-notification sink collaborator.
//!
//! Delivery mechanics are out of scope for this layer: the sink accepts
//! (token, title, body) and fails silently. Nothing in the session path
//! may block or error because a push could not be delivered.

use tracing::debug;

/// Fire-and-forget notification sink.
///
/// Implementations must swallow their own failures; callers never
/// observe them.
pub trait PushSink: Send + Sync {
    fn send(&self, token: &str, title: &str, body: &str);
}

/// Sink that drops every notification. Useful as the default wiring and
/// in tests.
pub struct NoopPushSink;

impl PushSink for NoopPushSink {
    fn send(&self, token: &str, title: &str, _body: &str) {
        debug!(token, title, "push notification dropped (noop sink)");
    }
}
