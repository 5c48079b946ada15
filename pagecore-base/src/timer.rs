//! Injectable time source
//!
//! Components never read the clock directly; they hold an
//! `Arc<dyn Timer>` so that tests can freeze and advance time.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Boxed future returned by [`Timer::sleep_us`].
///
/// Sleeping is the only async method on the trait; a boxed future keeps
/// the trait object-safe without async-trait in every downstream
/// signature.
pub type SleepFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Monotonic and wall-clock microsecond time source.
pub trait Timer: Send + Sync {
    /// Wall-clock microseconds since the Unix epoch.
    fn now_us(&self) -> i64;

    /// Monotonic microseconds since an arbitrary process-local origin.
    fn monotonic_us(&self) -> i64;

    /// Sleep for roughly `us` microseconds. May return early.
    fn sleep_us(&self, us: i64) -> SleepFuture;
}

/// System clock backed timer.
pub struct SystemTimer {
    origin: Instant,
}

impl SystemTimer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for SystemTimer {
    fn now_us(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }

    fn monotonic_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    fn sleep_us(&self, us: i64) -> SleepFuture {
        let dur = Duration::from_micros(us.max(0) as u64);
        Box::pin(tokio::time::sleep(dur))
    }
}

/// Settable timer for tests. `sleep_us` advances the mock clock and
/// returns immediately.
pub struct MockTimer {
    wall_us: AtomicI64,
    mono_us: AtomicI64,
}

impl MockTimer {
    pub fn new(start_us: i64) -> Self {
        Self {
            wall_us: AtomicI64::new(start_us),
            mono_us: AtomicI64::new(0),
        }
    }

    /// Advance both clocks by `us` microseconds.
    pub fn advance_us(&self, us: i64) {
        self.wall_us.fetch_add(us, Ordering::SeqCst);
        self.mono_us.fetch_add(us, Ordering::SeqCst);
    }

    /// Advance both clocks by `ms` milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.advance_us(ms * 1000);
    }

    /// Set the wall clock to an absolute microsecond timestamp.
    pub fn set_time_us(&self, us: i64) {
        self.wall_us.store(us, Ordering::SeqCst);
    }
}

impl Timer for MockTimer {
    fn now_us(&self) -> i64 {
        self.wall_us.load(Ordering::SeqCst)
    }

    fn monotonic_us(&self) -> i64 {
        self.mono_us.load(Ordering::SeqCst)
    }

    fn sleep_us(&self, us: i64) -> SleepFuture {
        self.advance_us(us.max(0));
        Box::pin(std::future::ready(()))
    }
}

/// Convenience alias used throughout the workspace.
pub type SharedTimer = Arc<dyn Timer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_timer_advance() {
        let timer = MockTimer::new(1_000_000);
        assert_eq!(timer.now_us(), 1_000_000);
        timer.advance_ms(250);
        assert_eq!(timer.now_us(), 1_250_000);
        assert_eq!(timer.monotonic_us(), 250_000);
    }

    #[test]
    fn test_system_timer_monotonic_moves_forward() {
        let timer = SystemTimer::new();
        let a = timer.monotonic_us();
        let b = timer.monotonic_us();
        assert!(b >= a);
        assert!(timer.now_us() > 1_500_000_000_000_000); // after ~2017
    }

    #[tokio::test]
    async fn test_mock_sleep_advances_clock() {
        let timer = MockTimer::new(0);
        timer.sleep_us(5000).await;
        assert_eq!(timer.now_us(), 5000);
    }
}
