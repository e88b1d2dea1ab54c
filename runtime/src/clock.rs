//! Time source used by refresh debouncing, retry backoff and latency bookkeeping.
//!
//! The engine never reads wall-clock time directly. Everything goes through a
//! [`Clock`] so debounce and coalescing logic can be driven by a
//! [`ManualClock`] in tests without real timers.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Milliseconds on the engine's logical timeline.
pub type Millis = u64;

/// A monotonic millisecond clock that can also suspend the caller.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current position on the timeline.
    fn now(&self) -> Millis;
    /// Suspend for `ms` milliseconds of this clock's time.
    async fn sleep(&self, ms: Millis);
}

/// Clock backed by the tokio timer (and therefore by paused time in tests).
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }

    async fn sleep(&self, ms: Millis) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Logical clock advanced explicitly by the owner.
///
/// `sleep` advances the clock by the requested amount and returns at once, so
/// code that waits for a deadline reaches it deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock forward by `ms`.
    pub fn advance(&self, ms: Millis) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute position. Moving backwards is ignored.
    pub fn set(&self, at: Millis) {
        self.now.fetch_max(at, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep(&self, ms: Millis) {
        self.advance(ms);
    }
}
