use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::WaitError;
use crate::estimator::{EstimatorConfig, GlobalUsageEstimator};
use crate::rate::{FailOpenRate, RateSupplier, UNLIMITED};
use crate::request::RateLimiter;
use crate::token_bucket::{Burst, TokenBucket, DEFAULT_WAIT_POLL_INTERVAL};

const REQUESTS_COUNTER: &str = "namespace_limiter_requests_total";
const WAIT_COUNTER: &str = "namespace_limiter_wait_total";
const EFFECTIVE_RATE_GAUGE: &str = "namespace_limiter_effective_rate";

/// Settings shared by every limiter a controller builds.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Identifies this process in usage reports.
    pub instance_id: String,
    pub burst: Burst,
    /// Rate enforced until the supplier first resolves a value.
    pub fallback_rate: f64,
    pub wait_poll_interval: Duration,
    pub estimator: EstimatorConfig,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            instance_id: "local".to_string(),
            burst: Burst::default(),
            fallback_rate: UNLIMITED,
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
            estimator: EstimatorConfig::default(),
        }
    }
}

/// Token bucket whose fill rate follows the configured target scaled by the estimated share.
///
/// The supplier is polled on every admission, so configuration changes apply without
/// rebuilding the limiter.
pub struct DynamicRateLimiter {
    namespace: String,
    bucket: TokenBucket,
    rate: FailOpenRate,
    estimator: Arc<GlobalUsageEstimator>,
    wait_poll_interval: Duration,
}

impl DynamicRateLimiter {
    pub fn new(
        namespace: impl Into<String>,
        supplier: Arc<dyn RateSupplier>,
        estimator: Arc<GlobalUsageEstimator>,
        config: &LimiterConfig,
    ) -> Self {
        let namespace = namespace.into();
        let rate = FailOpenRate::new(namespace.clone(), supplier, config.fallback_rate);
        let initial = effective_rate(rate.resolve(), estimator.rate_multiplier());
        let bucket = TokenBucket::new(initial, config.burst)
            .with_wait_poll_interval(config.wait_poll_interval);
        gauge!(EFFECTIVE_RATE_GAUGE, "namespace" => namespace.clone()).set(initial);

        Self {
            namespace,
            bucket,
            rate,
            estimator,
            wait_poll_interval: config.wait_poll_interval,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Last target rate resolved from configuration, before share scaling.
    pub fn target_rate(&self) -> f64 {
        self.rate.last_known()
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Re-read the target and apply the current share to the bucket.
    pub fn refresh(&self) -> f64 {
        let effective = effective_rate(self.rate.resolve(), self.estimator.rate_multiplier());
        if effective.to_bits() != self.bucket.rate().to_bits() {
            self.bucket.set_rate(effective);
            gauge!(EFFECTIVE_RATE_GAUGE, "namespace" => self.namespace.clone()).set(effective);
        }
        effective
    }

    fn record_wait(&self, result: &Result<(), WaitError>, cost: u32) {
        let label = match result {
            Ok(()) => "granted",
            Err(WaitError::Cancelled) => "cancelled",
            Err(WaitError::ExceedsCapacity { .. }) => "exceeds_capacity",
        };
        self.estimator.record(result.is_ok(), cost);
        counter!(WAIT_COUNTER, "namespace" => self.namespace.clone(), "result" => label).increment(1);
    }
}

/// An unlimited target stays unlimited whatever the share.
pub fn effective_rate(target: f64, multiplier: f64) -> f64 {
    if target.is_infinite() {
        target
    } else {
        target * multiplier
    }
}

#[async_trait]
impl RateLimiter for DynamicRateLimiter {
    fn allow_at(&self, now: Instant, cost: u32) -> bool {
        self.refresh();
        let admitted = self.bucket.allow_at(now, cost);
        self.estimator.record(admitted, cost);

        let result = if admitted { "admitted" } else { "rejected" };
        counter!(REQUESTS_COUNTER, "namespace" => self.namespace.clone(), "result" => result)
            .increment(1);
        admitted
    }

    async fn wait(&self, cancel: &CancellationToken, cost: u32) -> Result<(), WaitError> {
        // Each bounded attempt re-reads the supplier before blocking again.
        let result = loop {
            self.refresh();
            if let Ok(result) =
                tokio::time::timeout(self.wait_poll_interval, self.bucket.wait(cancel, cost)).await
            {
                break result;
            }
        };
        self.record_wait(&result, cost);
        result
    }

    fn rate(&self) -> f64 {
        self.bucket.rate()
    }
}
