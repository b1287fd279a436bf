//! Bounded retry helpers.
//!
//! Two building blocks used by the online-status path: plain retry with
//! exponential backoff for transient failures, and write-then-poll-
//! confirm for stores that apply writes (or their triggers)
//! asynchronously. Nothing here retries unboundedly.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// A bounded exponential backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubles per attempt after that.
    pub base_delay: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
        }
    }

    /// Delay preceding attempt number `attempt` (1-based; attempt 1 has
    /// no delay).
    fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(2))
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted,
/// sleeping with exponential backoff between attempts. Returns the last
/// error once exhausted.
pub async fn with_backoff<T, E, F, Fut>(policy: Backoff, op_name: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.attempts => {
                warn!(op = op_name, attempt, error = %e, "giving up after final attempt");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_before(attempt + 1);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Outcome of [`write_then_verify`].
#[derive(Debug)]
pub enum VerifyError<E> {
    /// The write (or a verification read) failed outright.
    Op(E),
    /// The write went through but read-backs never confirmed it.
    Unverified,
}

/// Perform a write, then poll a read-back predicate until it confirms
/// the write or `attempts` read-backs are exhausted.
///
/// `settle` is slept before the first read-back (the backing store may
/// apply triggers asynchronously); `spacing` separates subsequent
/// read-backs. Read-back errors are treated as "not yet confirmed" and
/// logged, not propagated, so a transiently failing read does not mask
/// a write that actually landed.
pub async fn write_then_verify<E, W, WFut, V, VFut>(
    mut write: W,
    mut verify: V,
    attempts: u32,
    settle: Duration,
    spacing: Duration,
) -> Result<(), VerifyError<E>>
where
    W: FnMut() -> WFut,
    WFut: Future<Output = Result<(), E>>,
    V: FnMut() -> VFut,
    VFut: Future<Output = Result<bool, E>>,
    E: Display,
{
    write().await.map_err(VerifyError::Op)?;
    sleep(settle).await;

    for attempt in 1..=attempts {
        match verify().await {
            Ok(true) => {
                debug!(attempt, "write verified by read-back");
                return Ok(());
            }
            Ok(false) => debug!(attempt, "read-back does not reflect the write yet"),
            Err(e) => warn!(attempt, error = %e, "verification read-back failed"),
        }
        if attempt < attempts {
            sleep(spacing).await;
        }
    }

    Err(VerifyError::Unverified)
}
