//! Injectable time source
//!
//! Every window rollover, breaker timeout and latency measurement reads time
//! through [`Clock`], so tests can drive time with [`ManualClock`] instead of
//! sleeping.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Monotonic time source with an injectable sleep
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current monotonic instant
    fn now(&self) -> Instant;

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);

    /// Time elapsed since `earlier`, saturating at zero
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Real time backed by `Instant::now` and `tokio::time::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Shared handle to the system clock
    #[must_use]
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually advanced clock for deterministic tests
///
/// `sleep` advances the clock by the requested duration and returns
/// immediately, so concurrent sleepers advance time cumulatively.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward
    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    /// Total time advanced since creation
    #[must_use]
    pub fn offset(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.elapsed_since(start), Duration::from_secs(30));
        assert_eq!(clock.offset(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_advances_time() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.elapsed_since(start), Duration::from_millis(250));
    }

    #[test]
    fn test_elapsed_since_saturates() {
        let clock = ManualClock::new();
        let later = clock.now() + Duration::from_secs(5);
        assert_eq!(clock.elapsed_since(later), Duration::ZERO);
    }
}
