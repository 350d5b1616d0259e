use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::WaitError;
use crate::token_bucket::TokenBucket;

/// One unit of work asking for admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation being invoked.
    pub api: String,
    /// Identity of the caller, usually the namespace itself.
    pub caller: String,
    /// Tokens this request consumes.
    pub cost: u32,
}

impl Request {
    pub fn new(api: impl Into<String>, caller: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            caller: caller.into(),
            cost: 1,
        }
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

/// Cost-based limiting, independent of the shape of a request.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    fn allow_at(&self, now: Instant, cost: u32) -> bool;

    async fn wait(&self, cancel: &CancellationToken, cost: u32) -> Result<(), WaitError>;

    /// Fill rate currently enforced.
    fn rate(&self) -> f64;
}

/// Request-based limiting, the surface call sites use.
#[async_trait]
pub trait RequestRateLimiter: Send + Sync {
    fn allow(&self, now: Instant, request: &Request) -> bool;

    async fn wait(&self, cancel: &CancellationToken, request: &Request) -> Result<(), WaitError>;
}

#[async_trait]
impl RateLimiter for TokenBucket {
    fn allow_at(&self, now: Instant, cost: u32) -> bool {
        TokenBucket::allow_at(self, now, cost)
    }

    async fn wait(&self, cancel: &CancellationToken, cost: u32) -> Result<(), WaitError> {
        TokenBucket::wait(self, cancel, cost).await
    }

    fn rate(&self) -> f64 {
        TokenBucket::rate(self)
    }
}

#[async_trait]
impl<L: RateLimiter + ?Sized> RateLimiter for Arc<L> {
    fn allow_at(&self, now: Instant, cost: u32) -> bool {
        (**self).allow_at(now, cost)
    }

    async fn wait(&self, cancel: &CancellationToken, cost: u32) -> Result<(), WaitError> {
        (**self).wait(cancel, cost).await
    }

    fn rate(&self) -> f64 {
        (**self).rate()
    }
}

/// Maps a [`Request`] onto exactly one call into a cost-based limiter. No retries.
#[derive(Debug)]
pub struct RequestRateLimiterAdapter<L> {
    limiter: L,
}

impl<L: RateLimiter> RequestRateLimiterAdapter<L> {
    pub fn new(limiter: L) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &L {
        &self.limiter
    }
}

#[async_trait]
impl<L: RateLimiter> RequestRateLimiter for RequestRateLimiterAdapter<L> {
    fn allow(&self, now: Instant, request: &Request) -> bool {
        self.limiter.allow_at(now, request.cost)
    }

    async fn wait(&self, cancel: &CancellationToken, request: &Request) -> Result<(), WaitError> {
        self.limiter.wait(cancel, request.cost).await
    }
}
