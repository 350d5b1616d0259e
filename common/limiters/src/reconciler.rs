use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use health::{HealthHandle, HealthRegistry};
use metrics::{counter, histogram};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{Controller, NamespaceLimiter};
use crate::error::ExchangeError;
use crate::estimator::ShareEstimate;
use crate::exchange::PeerExchange;

const EXCHANGE_ERRORS_COUNTER: &str = "namespace_limiter_peer_exchange_errors_total";
const EXCHANGE_HISTOGRAM: &str = "namespace_limiter_peer_exchange_seconds";
const ROUNDS_COUNTER: &str = "namespace_limiter_reconcile_rounds_total";

/// Rounds the loop may miss before its liveness component stalls.
const LIVENESS_MISSED_ROUNDS: u32 = 3;
const LIVENESS_COMPONENT: &str = "usage_reconciler";

/// Background loop that shares usage with peers and rebalances every active namespace.
///
/// Exchange trouble only delays estimates; admissions never wait on this loop.
pub struct UsageReconciler {
    controller: Arc<Controller>,
    exchange: Arc<dyn PeerExchange>,
    interval: Duration,
    exchange_timeout: Duration,
    liveness: Option<HealthHandle>,
}

impl UsageReconciler {
    pub fn new(
        controller: Arc<Controller>,
        exchange: Arc<dyn PeerExchange>,
        exchange_timeout: Duration,
    ) -> Self {
        let interval = controller.config().estimator.report_interval;
        Self {
            controller,
            exchange,
            interval,
            exchange_timeout,
            liveness: None,
        }
    }

    /// Register with `registry`, reporting healthy after every completed round.
    pub fn with_liveness(mut self, registry: &HealthRegistry) -> Self {
        self.liveness = Some(registry.register(LIVENESS_COMPONENT, self.liveness_deadline()));
        self
    }

    pub fn liveness_deadline(&self) -> Duration {
        self.interval * LIVENESS_MISSED_ROUNDS
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one exchange round across all namespaces concurrently.
    pub async fn run_once(&self) -> Vec<ShareEstimate> {
        let limiters = self.controller.limiters();
        let estimates = join_all(limiters.iter().map(|limiter| self.reconcile(limiter))).await;

        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
        counter!(ROUNDS_COUNTER).increment(1);
        estimates
    }

    /// Loop until `cancel` fires. The first round runs immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "starting usage reconciler");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("usage reconciler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let estimates = self.run_once().await;
                    debug!(namespaces = estimates.len(), "reconcile round complete");
                }
            }
        }
    }

    async fn reconcile(&self, limiter: &NamespaceLimiter) -> ShareEstimate {
        let estimator = limiter.estimator();
        let namespace = limiter.namespace();
        let own = estimator.take_report(Utc::now());

        let publish_start = Instant::now();
        match self.bounded(self.exchange.publish(&own)).await {
            Ok(()) => record_duration("publish", publish_start),
            Err(e) => record_error("publish", namespace, &e),
        }

        let collect_start = Instant::now();
        let peers = match self.bounded(self.exchange.collect(namespace)).await {
            Ok(peers) => {
                record_duration("collect", collect_start);
                peers
            }
            Err(e) => {
                record_error("collect", namespace, &e);
                Vec::new()
            }
        };

        let estimate = estimator.reconcile(&own, peers, Instant::now());
        // Push the new share into the bucket without waiting for the next admission
        limiter.rate();
        estimate
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        tokio::time::timeout(self.exchange_timeout, call)
            .await
            .map_err(|_| ExchangeError::Timeout)?
    }
}

fn record_duration(step: &'static str, start: Instant) {
    histogram!(EXCHANGE_HISTOGRAM, "step" => step).record(start.elapsed().as_secs_f64());
}

fn record_error(step: &'static str, namespace: &str, e: &ExchangeError) {
    counter!(EXCHANGE_ERRORS_COUNTER, "step" => step, "cause" => e.cause()).increment(1);
    warn!(namespace = %namespace, step, error = %e, "peer exchange failed");
}
