use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use metrics::gauge;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::WaitError;
use crate::estimator::{GlobalUsageEstimator, ShareEstimate};
use crate::limiter::{DynamicRateLimiter, LimiterConfig};
use crate::rate::{NamespaceRate, RateConfig};
use crate::request::{Request, RequestRateLimiter, RequestRateLimiterAdapter};

const REGISTRY_SIZE_GAUGE: &str = "namespace_limiter_registry_size";

/// The composed limiter of one namespace: bucket, rate supplier and usage estimator.
pub struct NamespaceLimiter {
    namespace: String,
    adapter: RequestRateLimiterAdapter<Arc<DynamicRateLimiter>>,
    estimator: Arc<GlobalUsageEstimator>,
}

impl NamespaceLimiter {
    fn new(namespace: &str, rates: Arc<dyn RateConfig>, config: &LimiterConfig) -> Self {
        let estimator = Arc::new(GlobalUsageEstimator::new(
            namespace,
            config.instance_id.clone(),
            config.estimator.clone(),
        ));
        let supplier = Arc::new(NamespaceRate::new(rates, namespace));
        let limiter = DynamicRateLimiter::new(namespace, supplier, estimator.clone(), config);

        Self {
            namespace: namespace.to_string(),
            adapter: RequestRateLimiterAdapter::new(Arc::new(limiter)),
            estimator,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn estimator(&self) -> &Arc<GlobalUsageEstimator> {
        &self.estimator
    }

    pub fn estimate(&self) -> ShareEstimate {
        self.estimator.estimate()
    }

    /// Fill rate currently enforced by this instance.
    pub fn rate(&self) -> f64 {
        self.adapter.limiter().refresh()
    }

    pub fn target_rate(&self) -> f64 {
        self.adapter.limiter().target_rate()
    }
}

#[async_trait]
impl RequestRateLimiter for NamespaceLimiter {
    fn allow(&self, now: Instant, request: &Request) -> bool {
        self.adapter.allow(now, request)
    }

    async fn wait(&self, cancel: &CancellationToken, request: &Request) -> Result<(), WaitError> {
        self.adapter.wait(cancel, request).await
    }
}

/// Registry of namespace limiters; the entry point for admission checks.
///
/// Lookups take the read lock. A miss takes the write lock and checks again before
/// constructing, so concurrent first calls for a namespace share one limiter. Entries
/// live as long as the controller.
pub struct Controller {
    config: LimiterConfig,
    rates: Arc<dyn RateConfig>,
    limiters: RwLock<HashMap<String, Arc<NamespaceLimiter>>>,
}

impl Controller {
    pub fn new(config: LimiterConfig, rates: Arc<dyn RateConfig>) -> Self {
        Self {
            config,
            rates,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// The limiter of `namespace` if one was created, without registering it.
    pub fn lookup(&self, namespace: &str) -> Option<Arc<NamespaceLimiter>> {
        let limiters = self.limiters.read().unwrap_or_else(PoisonError::into_inner);
        limiters.get(namespace).cloned()
    }

    pub fn get(&self, namespace: &str) -> Arc<NamespaceLimiter> {
        if let Some(limiter) = self.lookup(namespace) {
            return limiter;
        }

        let mut limiters = self.limiters.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(limiter) = limiters.get(namespace) {
            return limiter.clone();
        }

        let limiter = Arc::new(NamespaceLimiter::new(
            namespace,
            self.rates.clone(),
            &self.config,
        ));
        limiters.insert(namespace.to_string(), limiter.clone());
        gauge!(REGISTRY_SIZE_GAUGE).set(limiters.len() as f64);
        info!(namespace = %namespace, rate = limiter.target_rate(), "created namespace limiter");
        limiter
    }

    /// Limiters created so far.
    pub fn limiters(&self) -> Vec<Arc<NamespaceLimiter>> {
        let limiters = self.limiters.read().unwrap_or_else(PoisonError::into_inner);
        limiters.values().cloned().collect()
    }

    pub fn namespaces(&self) -> Vec<String> {
        let limiters = self.limiters.read().unwrap_or_else(PoisonError::into_inner);
        let mut namespaces: Vec<String> = limiters.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    pub fn len(&self) -> usize {
        self.limiters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
