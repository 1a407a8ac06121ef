//! Clock and timer capabilities shared by the failsafe primitives
//!
//! - [`Clock`] yields nanosecond timestamps. The rate limiter reads it on
//!   every `take`, so tests swap in a [`ManualClock`] to step time exactly.
//! - [`schedule`] runs a callback once after a delay on a tokio runtime and
//!   hands back a [`TimerHandle`] that can cancel it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Source of nanosecond-resolution timestamps
pub trait Clock: Send + Sync + 'static {
    /// Current time in nanoseconds since the Unix epoch
    fn now(&self) -> u64;
}

/// Wall clock backed by [`SystemTime`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

/// Manually driven clock
///
/// Clones share the same reading, so a test can keep one handle and give
/// another to the component under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `start_nanos`
    #[must_use]
    pub fn new(start_nanos: u64) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(start_nanos)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }

    /// Jump to an absolute reading
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Handle to a scheduled callback
#[derive(Debug)]
pub struct TimerHandle {
    handle: AbortHandle,
}

impl TimerHandle {
    /// Cancel the callback if it has not started yet
    pub fn cancel(&self) {
        self.handle.abort();
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run `task` once on `runtime` after `delay` has elapsed
///
/// The delay is measured with `tokio::time`, so paused-clock tests control it.
pub fn schedule<F>(runtime: &Handle, delay: Duration, task: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let join = runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        task();
    });
    TimerHandle {
        handle: join.abort_handle(),
    }
}

/// Tokio runtime handle for the calling context, if any
#[must_use]
pub fn current_runtime() -> Option<Handle> {
    Handle::try_current().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_manual_clock_advances_shared_reading() {
        let clock = ManualClock::new(1_000);
        let view = clock.clone();

        clock.advance(Duration::from_nanos(500));
        assert_eq!(view.now(), 1_500);

        view.set(42);
        assert_eq!(clock.now(), 42);
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now() > 0);
    }

    #[test]
    fn test_no_runtime_outside_tokio() {
        assert!(current_runtime().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let runtime = current_runtime().unwrap();

        let timer = schedule(&runtime, Duration::from_millis(100), move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(timer.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let runtime = current_runtime().unwrap();

        let timer = schedule(&runtime, Duration::from_millis(100), move || {
            flag.store(true, Ordering::SeqCst);
        });
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(timer.is_finished());
    }
}
