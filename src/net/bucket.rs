//! Token bucket shared by the per-connection and the aggregate limits.
//!
//! # Responsibilities
//! - Track a token level that refills at `rate` tokens/sec up to `capacity`
//! - Hand out reservations: consuming always succeeds at once, possibly
//!   taking the bucket into debt, and the caller learns when the debt is paid
//! - Refuse a reservation that could not be paid before a deadline
//! - Reconfigure rate and capacity in place
//!
//! # Design Decisions
//! - One token per byte
//! - Time comes from `tokio::time::Instant` so a paused test clock drives it
//! - [`TokenBucket`] is lock-free and owned; [`SharedBucket`] wraps it in a
//!   mutex that is never held across an `.await`

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Upper bound for a single computed wait.
///
/// Only reachable with absurd reservations; keeps `Instant` arithmetic from
/// overflowing.
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A reservation could not be paid for before the caller's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("token wait would exceed the deadline")]
pub struct DeadlineExceeded;

/// A byte-oriented token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Refill rate in tokens per second.
    rate: u64,
    /// Maximum number of stored tokens (burst).
    capacity: u64,
    /// Current level. Negative while reservations are outstanding.
    tokens: f64,
    /// Instant up to which `tokens` has been refilled.
    last: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// # Panics
    /// Panics if `rate` is zero.
    pub fn new(rate: u64, capacity: u64) -> Self {
        assert!(rate > 0, "token bucket rate must be non-zero");
        Self {
            rate,
            capacity,
            tokens: capacity as f64,
            last: Instant::now(),
        }
    }

    /// Create a bucket with `capacity == rate` and burn its initial burst,
    /// so the very first consumer is already throttled.
    pub fn drained(rate: u64) -> Self {
        let mut bucket = Self::new(rate, rate);
        bucket.drain(Instant::now());
        bucket
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Burst capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens available at `now`. Negative while in debt.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.advance(now);
        self.tokens
    }

    /// Change rate and capacity, keeping the tokens accrued so far.
    ///
    /// # Panics
    /// Panics if `rate` is zero.
    pub fn reconfigure(&mut self, rate: u64, capacity: u64, now: Instant) {
        assert!(rate > 0, "token bucket rate must be non-zero");
        self.advance(now);
        self.rate = rate;
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity as f64);
    }

    /// Empty the bucket, forgiving any outstanding debt.
    pub fn drain(&mut self, now: Instant) {
        self.advance(now);
        self.tokens = 0.0;
    }

    /// Take `n` tokens only if they are available right now.
    pub fn try_consume(&mut self, n: u64, now: Instant) -> bool {
        self.advance(now);
        if self.tokens >= n as f64 {
            self.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Reserve `n` tokens and return the instant at which they are paid for.
    ///
    /// When that instant lies past `deadline` the bucket is left untouched and
    /// [`DeadlineExceeded`] is returned.
    pub fn reserve(
        &mut self,
        n: u64,
        now: Instant,
        deadline: Option<Instant>,
    ) -> Result<Instant, DeadlineExceeded> {
        self.advance(now);
        let remaining = self.tokens - n as f64;
        let ready_at = if remaining >= 0.0 {
            now
        } else {
            now + self.time_to_refill(-remaining)
        };

        if deadline.is_some_and(|deadline| ready_at > deadline) {
            return Err(DeadlineExceeded);
        }

        self.tokens = remaining;
        Ok(ready_at)
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last);
        if now > self.last {
            self.last = now;
        }
        let refill = elapsed.as_secs_f64() * self.rate as f64;
        self.tokens = (self.tokens + refill).min(self.capacity as f64);
    }

    fn time_to_refill(&self, deficit: f64) -> Duration {
        Duration::try_from_secs_f64(deficit / self.rate as f64)
            .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
    }
}

/// A [`TokenBucket`] contended by many connections.
#[derive(Debug)]
pub struct SharedBucket {
    inner: Mutex<TokenBucket>,
}

impl SharedBucket {
    /// Wrap a bucket for shared use.
    pub fn new(bucket: TokenBucket) -> Self {
        Self {
            inner: Mutex::new(bucket),
        }
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> u64 {
        self.lock().rate()
    }

    /// Burst capacity.
    pub fn capacity(&self) -> u64 {
        self.lock().capacity()
    }

    /// Tokens available right now.
    pub fn available(&self) -> f64 {
        self.lock().available(Instant::now())
    }

    /// Change rate and capacity together.
    pub fn reconfigure(&self, rate: u64, capacity: u64) {
        self.lock().reconfigure(rate, capacity, Instant::now());
    }

    /// Empty the bucket.
    pub fn drain(&self) {
        self.lock().drain(Instant::now());
    }

    /// Take `n` tokens only if they are available right now.
    pub fn try_consume(&self, n: u64) -> bool {
        self.lock().try_consume(n, Instant::now())
    }

    /// Reserve `n` tokens; see [`TokenBucket::reserve`].
    pub fn reserve(&self, n: u64, deadline: Option<Instant>) -> Result<Instant, DeadlineExceeded> {
        self.lock().reserve(n, Instant::now(), deadline)
    }

    /// Reserve `n` tokens and sleep until they are paid for.
    pub async fn wait(&self, n: u64, deadline: Option<Instant>) -> Result<(), DeadlineExceeded> {
        let ready_at = self.reserve(n, deadline)?;
        sleep_until(ready_at).await;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.inner.lock().expect("token bucket mutex poisoned")
    }
}
