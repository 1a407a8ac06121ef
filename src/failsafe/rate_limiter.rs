//! Keyed token-bucket rate limiting
//!
//! Each key owns a bucket of `tokens` that refills completely once per
//! `interval`. Buckets are created on first use and refilled lazily on the
//! next `take`, so an idle key costs nothing but its map entry. A background
//! sweeper evicts buckets that have been idle for longer than
//! `sweep_min_ttl`.
//!
//! # Concurrency
//!
//! - The bucket map sits behind a reader-writer lock. Lookups share the read
//!   lock; only inserts and sweeps take the write lock.
//! - A bucket's `(available, last_tick)` pair is packed into one `AtomicU64`
//!   and replaced with compare-and-swap, so concurrent takes on one key never
//!   block each other and never hand out the same token twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::clock::{self, Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::{Error, Result};

/// Result of a single [`RateLimiter::take`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TakeOutcome {
    /// Bucket size
    pub limit: u64,
    /// Tokens left after this call
    pub remaining: u64,
    /// Next tick boundary, in clock nanoseconds
    pub reset: u64,
    /// Whether a token was consumed
    pub ok: bool,
}

impl TakeOutcome {
    /// Outcome reported by a closed limiter
    pub const CLOSED: Self = Self {
        limit: 0,
        remaining: 0,
        reset: 0,
        ok: false,
    };
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Token bucket with a lock-free state word
///
/// The state word encodes `last_tick * (max_tokens + 1) + available`. Ticks
/// past `max_tick` saturate; at a one-second interval that horizon is over a
/// century even for `u32::MAX` tokens, but at `u32::MAX` tokens per
/// millisecond it is about 49 days.
///
/// A bucket past its horizon refills once more and then never again. Its
/// last observed time is pinned to the horizon, so the sweeper evicts it
/// `sweep_min_ttl` later even while it is in use, and the next take starts a
/// fresh bucket from the current time.
struct Bucket {
    start_time: u64,
    max_tokens: u64,
    interval: u64,
    max_tick: u64,
    state: AtomicU64,
}

impl Bucket {
    fn new(max_tokens: u32, interval: Duration, now: u64) -> Self {
        let max_tokens = u64::from(max_tokens.max(1));
        let radix = max_tokens + 1;
        Self {
            start_time: now,
            max_tokens,
            interval: duration_nanos(interval).max(1),
            max_tick: (u64::MAX - max_tokens) / radix,
            // Tick zero, full bucket
            state: AtomicU64::new(max_tokens),
        }
    }

    fn pack(&self, available: u64, tick: u64) -> u64 {
        tick.min(self.max_tick) * (self.max_tokens + 1) + available
    }

    fn unpack(&self, word: u64) -> (u64, u64) {
        let radix = self.max_tokens + 1;
        (word % radix, word / radix)
    }

    fn tick(&self, now: u64) -> u64 {
        (now.saturating_sub(self.start_time) / self.interval).min(self.max_tick)
    }

    fn tick_start(&self, tick: u64) -> u64 {
        self.start_time
            .saturating_add(tick.saturating_mul(self.interval))
    }

    /// Tokens after `elapsed_ticks` full intervals
    ///
    /// One interval refills `interval / fill_rate` tokens, which is the whole
    /// bucket.
    fn refill(&self, available: u64, elapsed_ticks: u64) -> u64 {
        available
            .saturating_add(elapsed_ticks.saturating_mul(self.max_tokens))
            .min(self.max_tokens)
    }

    /// Refilled `(available, tick)` as seen at `current_tick`
    fn refreshed(&self, word: u64, current_tick: u64) -> (u64, u64) {
        let (available, last_tick) = self.unpack(word);
        if current_tick > last_tick {
            (self.refill(available, current_tick - last_tick), current_tick)
        } else {
            (available, last_tick)
        }
    }

    fn take(&self, now: u64) -> TakeOutcome {
        let current_tick = self.tick(now);
        let reset = self.tick_start(current_tick.saturating_add(1));
        let mut word = self.state.load(Ordering::Acquire);

        loop {
            let (available, tick) = self.refreshed(word, current_tick);
            if available == 0 {
                return TakeOutcome {
                    limit: self.max_tokens,
                    remaining: 0,
                    reset,
                    ok: false,
                };
            }

            let next = self.pack(available - 1, tick);
            match self
                .state
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return TakeOutcome {
                        limit: self.max_tokens,
                        remaining: available - 1,
                        reset,
                        ok: true,
                    };
                }
                Err(actual) => word = actual,
            }
        }
    }

    /// Current `(limit, remaining)` without consuming a token
    fn peek(&self, now: u64) -> (u64, u64) {
        let (available, _) = self.refreshed(self.state.load(Ordering::Acquire), self.tick(now));
        (self.max_tokens, available)
    }

    /// Add `tokens` to the allowance, never beyond `max_tokens`
    fn burst(&self, now: u64, tokens: u64) {
        let current_tick = self.tick(now);
        let mut word = self.state.load(Ordering::Acquire);

        loop {
            let (available, tick) = self.refreshed(word, current_tick);
            let next = self.pack(
                available.saturating_add(tokens).min(self.max_tokens),
                tick,
            );
            match self
                .state
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }

    /// Start of the tick in which the bucket was last used
    fn last_observed(&self) -> u64 {
        let (_, last_tick) = self.unpack(self.state.load(Ordering::Acquire));
        self.tick_start(last_tick)
    }
}

struct Inner {
    tokens: u32,
    interval: Duration,
    sweep_min_ttl: u64,
    clock: Arc<dyn Clock>,
    stopped: AtomicBool,
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl Inner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_sub(bucket.last_observed()) <= self.sweep_min_ttl);
        before - buckets.len()
    }
}

/// In-memory keyed rate limiter
///
/// Dropping the limiter closes it.
pub struct RateLimiter {
    inner: Arc<Inner>,
    shutdown: broadcast::Sender<()>,
    sweeper: JoinHandle<()>,
}

impl RateLimiter {
    /// Create a limiter using the system clock and start its sweeper
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid settings and [`Error::NoRuntime`]
    /// outside a tokio runtime.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a limiter reading time from `clock`
    ///
    /// # Errors
    ///
    /// See [`RateLimiter::new`].
    pub fn with_clock(config: &RateLimitConfig, clock: impl Clock) -> Result<Self> {
        config.validate()?;
        let runtime = clock::current_runtime().ok_or(Error::NoRuntime)?;

        let inner = Arc::new(Inner {
            tokens: config.tokens,
            interval: config.interval,
            sweep_min_ttl: duration_nanos(config.sweep_min_ttl),
            clock: Arc::new(clock),
            stopped: AtomicBool::new(false),
            buckets: RwLock::new(HashMap::with_capacity(config.initial_capacity)),
        });

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let sweeper = runtime.spawn(run_sweeper(
            Arc::downgrade(&inner),
            config.sweep_interval,
            shutdown_rx,
        ));

        debug!(
            tokens = config.tokens,
            interval_ms = config.interval.as_millis(),
            sweep_interval_ms = config.sweep_interval.as_millis(),
            sweep_min_ttl_ms = config.sweep_min_ttl.as_millis(),
            "Rate limiter created"
        );
        Ok(Self {
            inner,
            shutdown,
            sweeper,
        })
    }

    /// Try to consume one token for `key`
    ///
    /// A closed limiter returns [`TakeOutcome::CLOSED`].
    pub fn take(&self, key: &str) -> TakeOutcome {
        let inner = &self.inner;
        if inner.is_stopped() {
            return TakeOutcome::CLOSED;
        }
        let now = inner.clock.now();

        if let Some(bucket) = inner.buckets.read().get(key) {
            let outcome = bucket.take(now);
            if !outcome.ok {
                trace!(key, "Rate limit exhausted");
            }
            return outcome;
        }

        let mut buckets = inner.buckets.write();
        // Close may have drained the map while we waited for the lock.
        if inner.is_stopped() {
            return TakeOutcome::CLOSED;
        }
        buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(inner.tokens, inner.interval, now))
            .take(now)
    }

    /// Current `(limit, remaining)` for `key` without consuming a token
    ///
    /// Returns `None` for unknown keys and once closed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<(u64, u64)> {
        if self.inner.is_stopped() {
            return None;
        }
        let now = self.inner.clock.now();
        self.inner.buckets.read().get(key).map(|b| b.peek(now))
    }

    /// Replace `key`'s bucket with a full one using its own size and interval
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero `tokens` or `interval`, and
    /// [`Error::Closed`] once closed.
    pub fn set(&self, key: &str, tokens: u32, interval: Duration) -> Result<()> {
        if tokens == 0 || interval.is_zero() {
            return Err(Error::Config(format!(
                "bucket for '{key}' needs tokens > 0 and interval > 0"
            )));
        }

        let inner = &self.inner;
        let now = inner.clock.now();
        let mut buckets = inner.buckets.write();
        if inner.is_stopped() {
            return Err(Error::Closed);
        }
        buckets.insert(key.to_string(), Bucket::new(tokens, interval, now));
        debug!(key, tokens, interval_ms = interval.as_millis(), "Bucket replaced");
        Ok(())
    }

    /// Give `key` extra tokens, capped at its bucket size
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once closed.
    pub fn burst(&self, key: &str, tokens: u64) -> Result<()> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(Error::Closed);
        }
        let now = inner.clock.now();

        if let Some(bucket) = inner.buckets.read().get(key) {
            bucket.burst(now, tokens);
            return Ok(());
        }

        let mut buckets = inner.buckets.write();
        if inner.is_stopped() {
            return Err(Error::Closed);
        }
        buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(inner.tokens, inner.interval, now))
            .burst(now, tokens);
        Ok(())
    }

    /// Evict idle buckets now, returning how many were removed
    ///
    /// The background sweeper calls this on every tick.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Number of live buckets
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.buckets.read().len()
    }

    /// Whether no bucket is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`RateLimiter::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Stop the sweeper and drop every bucket
    ///
    /// Idempotent; every later `take` reports [`TakeOutcome::CLOSED`].
    pub fn close(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // The sweeper may already be gone; nothing to signal then.
        let _ = self.shutdown.send(());

        let released = std::mem::take(&mut *self.inner.buckets.write()).len();
        info!(buckets = released, "Rate limiter closed");
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tokens", &self.inner.tokens)
            .field("interval", &self.inner.interval)
            .field("buckets", &self.len())
            .field("closed", &self.is_closed())
            .field("sweeper_running", &!self.sweeper.is_finished())
            .finish()
    }
}

/// Periodically evict idle buckets until shutdown or until the limiter is gone
async fn run_sweeper(
    inner: Weak<Inner>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    debug!(interval_ms = interval.as_millis(), "Rate limit sweeper started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.is_stopped() {
                    break;
                }
                let evicted = inner.sweep();
                if evicted > 0 {
                    debug!(count = evicted, "Swept idle rate limit buckets");
                }
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }
    debug!("Rate limit sweeper stopped");
}
