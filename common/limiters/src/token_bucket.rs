use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::WaitError;

/// Upper bound on how long `wait` sleeps before re-reading the fill rate.
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How much burst a bucket holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Burst {
    /// Capacity follows the fill rate: `rate * ratio`, at least one token while the
    /// rate is positive.
    Ratio(f64),
    /// Capacity is fixed regardless of the fill rate.
    Fixed(f64),
}

impl Default for Burst {
    /// One second worth of fill rate.
    fn default() -> Self {
        Burst::Ratio(1.0)
    }
}

impl Burst {
    pub fn capacity(&self, rate: f64) -> f64 {
        let capacity = match *self {
            Burst::Ratio(ratio) if rate > 0.0 => (rate * ratio).max(1.0),
            Burst::Ratio(_) => 0.0,
            Burst::Fixed(capacity) => capacity,
        };
        if capacity.is_nan() || capacity < 0.0 {
            0.0
        } else {
            capacity
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    /// Never refills for negative elapsed time, and always leaves
    /// `0 <= tokens <= capacity`.
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        if now > self.last_refill {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens += elapsed * rate;
            self.last_refill = now;
        }
        self.tokens = self.tokens.min(capacity).max(0.0);
    }
}

enum Acquire {
    Granted,
    Retry(Duration),
    ExceedsCapacity(f64),
}

/// A single-process token bucket with a fill rate that can be swapped at any time.
///
/// The `(tokens, last_refill)` pair lives behind one short mutex. The fill rate is an
/// `f64` stored as bits in an atomic so it can be read and replaced without taking that
/// lock; a new rate applies from the next refill on, never retroactively.
#[derive(Debug)]
pub struct TokenBucket {
    rate: AtomicU64,
    burst: Burst,
    wait_poll_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    pub fn new(rate: f64, burst: Burst) -> Self {
        Self::new_at(Instant::now(), rate, burst)
    }

    pub fn new_at(now: Instant, rate: f64, burst: Burst) -> Self {
        let rate = sanitize_rate(rate);
        Self {
            rate: AtomicU64::new(rate.to_bits()),
            burst,
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
            state: Mutex::new(BucketState {
                tokens: burst.capacity(rate),
                last_refill: now,
            }),
        }
    }

    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate.load(Ordering::Acquire))
    }

    /// Negative and NaN rates are stored as zero.
    pub fn set_rate(&self, rate: f64) {
        self.rate
            .store(sanitize_rate(rate).to_bits(), Ordering::Release);
    }

    pub fn burst(&self) -> Burst {
        self.burst
    }

    pub fn capacity(&self) -> f64 {
        self.burst.capacity(self.rate())
    }

    /// Tokens that would be available at `now`, without consuming or refilling.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let rate = self.rate();
        let capacity = self.burst.capacity(rate);
        let state = self.lock_state();
        let mut projected = BucketState {
            tokens: state.tokens,
            last_refill: state.last_refill,
        };
        projected.refill(now, rate, capacity);
        projected.tokens
    }

    pub fn allow(&self, cost: u32) -> bool {
        self.allow_at(Instant::now(), cost)
    }

    /// Take `cost` tokens if they are available at `now`. Never blocks beyond the
    /// state lock, and leaves the tokens untouched on rejection.
    pub fn allow_at(&self, now: Instant, cost: u32) -> bool {
        matches!(self.try_acquire(now, cost), Acquire::Granted)
    }

    /// Suspend until `cost` tokens are taken or `cancel` fires.
    ///
    /// An already-cancelled token returns `WaitError::Cancelled` before touching the
    /// bucket. Cancellation never consumes tokens.
    pub async fn wait(&self, cancel: &CancellationToken, cost: u32) -> Result<(), WaitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }

            let delay = match self.try_acquire(Instant::now(), cost) {
                Acquire::Granted => return Ok(()),
                Acquire::ExceedsCapacity(capacity) => {
                    return Err(WaitError::ExceedsCapacity { cost, capacity })
                }
                Acquire::Retry(delay) => delay,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn try_acquire(&self, now: Instant, cost: u32) -> Acquire {
        if cost == 0 {
            return Acquire::Granted;
        }

        let rate = self.rate();
        if rate.is_infinite() {
            return Acquire::Granted;
        }

        let capacity = self.burst.capacity(rate);
        let cost = f64::from(cost);

        let mut state = self.lock_state();
        state.refill(now, rate, capacity);

        // The rate may be raised by configuration later, so keep polling.
        if rate == 0.0 {
            return Acquire::Retry(self.wait_poll_interval);
        }

        if state.tokens >= cost {
            state.tokens -= cost;
            return Acquire::Granted;
        }

        if cost > capacity {
            return Acquire::ExceedsCapacity(capacity);
        }

        Acquire::Retry(delay_for(cost - state.tokens, rate, self.wait_poll_interval))
    }

    fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_nan() || rate < 0.0 {
        0.0
    } else {
        rate
    }
}

fn delay_for(deficit: f64, rate: f64, max_delay: Duration) -> Duration {
    let secs = deficit / rate;
    if secs.is_finite() && secs < max_delay.as_secs_f64() {
        Duration::from_secs_f64(secs)
    } else {
        max_delay
    }
}
