use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use metrics::counter;
use tracing::{info, warn};

/// Rate value meaning "do not limit".
pub const UNLIMITED: f64 = f64::INFINITY;

const RATE_SOURCE_UNAVAILABLE_COUNTER: &str = "namespace_limiter_rate_source_unavailable_total";

/// Yields the currently configured target rate of a single namespace.
///
/// `None` means the value could not be resolved right now.
pub trait RateSupplier: Send + Sync {
    fn current_rate(&self) -> Option<f64>;
}

impl<F> RateSupplier for F
where
    F: Fn() -> Option<f64> + Send + Sync,
{
    fn current_rate(&self) -> Option<f64> {
        self()
    }
}

/// Configuration collaborator: looks up the target rate of any namespace.
pub trait RateConfig: Send + Sync {
    fn current_rate(&self, namespace: &str) -> Option<f64>;
}

/// Binds a [`RateConfig`] to one namespace.
pub struct NamespaceRate {
    config: Arc<dyn RateConfig>,
    namespace: String,
}

impl NamespaceRate {
    pub fn new(config: Arc<dyn RateConfig>, namespace: impl Into<String>) -> Self {
        Self {
            config,
            namespace: namespace.into(),
        }
    }
}

impl RateSupplier for NamespaceRate {
    fn current_rate(&self) -> Option<f64> {
        self.config.current_rate(&self.namespace)
    }
}

/// A fixed default plus per-namespace overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticRates {
    pub default: f64,
    pub overrides: HashMap<String, f64>,
}

impl StaticRates {
    pub fn new(default: f64) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, namespace: impl Into<String>, rate: f64) -> Self {
        self.overrides.insert(namespace.into(), rate);
        self
    }
}

impl Default for StaticRates {
    fn default() -> Self {
        Self::new(UNLIMITED)
    }
}

impl RateConfig for StaticRates {
    fn current_rate(&self, namespace: &str) -> Option<f64> {
        Some(self.overrides.get(namespace).copied().unwrap_or(self.default))
    }
}

/// Parses overrides in the form `acme:10,beta:100`. The default is `UNLIMITED`.
impl FromStr for StaticRates {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rates = StaticRates::default();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (namespace, rate) = entry
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("expected namespace:rate, got {entry:?}"))?;
            let namespace = namespace.trim();
            if namespace.is_empty() {
                anyhow::bail!("empty namespace in {entry:?}");
            }
            let rate: f64 = rate
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid rate for {namespace}: {e}"))?;
            if rate.is_nan() || rate < 0.0 {
                anyhow::bail!("rate for {namespace} must be non-negative, got {rate}");
            }
            rates.overrides.insert(namespace.to_string(), rate);
        }
        Ok(rates)
    }
}

/// Operator-adjustable rates that can change while limiters are running.
#[derive(Debug)]
pub struct DynamicRates {
    default: AtomicU64,
    rates: RwLock<HashMap<String, f64>>,
}

impl DynamicRates {
    pub fn new(default: f64) -> Self {
        Self {
            default: AtomicU64::new(default.to_bits()),
            rates: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_static(rates: &StaticRates) -> Self {
        let dynamic = Self::new(rates.default);
        for (namespace, rate) in &rates.overrides {
            dynamic.set_rate(namespace, *rate);
        }
        dynamic
    }

    pub fn set_rate(&self, namespace: &str, rate: f64) {
        let mut rates = self.rates.write().unwrap_or_else(PoisonError::into_inner);
        rates.insert(namespace.to_string(), rate);
    }

    /// Returns whether an override existed.
    pub fn clear_rate(&self, namespace: &str) -> bool {
        let mut rates = self.rates.write().unwrap_or_else(PoisonError::into_inner);
        rates.remove(namespace).is_some()
    }

    pub fn set_default(&self, rate: f64) {
        self.default.store(rate.to_bits(), Ordering::Release);
    }

    pub fn default_rate(&self) -> f64 {
        f64::from_bits(self.default.load(Ordering::Acquire))
    }
}

impl RateConfig for DynamicRates {
    fn current_rate(&self, namespace: &str) -> Option<f64> {
        let rates = self.rates.read().unwrap_or_else(PoisonError::into_inner);
        Some(rates.get(namespace).copied().unwrap_or_else(|| self.default_rate()))
    }
}

/// Wraps a supplier so that an unresolvable value keeps the last known-good rate.
///
/// Negative and NaN values count as unresolvable. Until the first successful read the
/// fallback rate is used. The transition to unavailable is logged once, not per call.
pub struct FailOpenRate {
    namespace: String,
    supplier: Arc<dyn RateSupplier>,
    last_known: AtomicU64,
    unavailable: AtomicBool,
}

impl FailOpenRate {
    pub fn new(namespace: impl Into<String>, supplier: Arc<dyn RateSupplier>, fallback: f64) -> Self {
        Self {
            namespace: namespace.into(),
            supplier,
            last_known: AtomicU64::new(fallback.to_bits()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn last_known(&self) -> f64 {
        f64::from_bits(self.last_known.load(Ordering::Acquire))
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Relaxed)
    }

    /// Poll the supplier, returning the value to enforce.
    pub fn resolve(&self) -> f64 {
        match self.supplier.current_rate() {
            Some(rate) if !rate.is_nan() && rate >= 0.0 => {
                self.last_known.store(rate.to_bits(), Ordering::Release);
                if self.unavailable.swap(false, Ordering::Relaxed) {
                    info!(namespace = %self.namespace, rate, "rate source recovered");
                }
                rate
            }
            resolved => {
                counter!(RATE_SOURCE_UNAVAILABLE_COUNTER, "namespace" => self.namespace.clone())
                    .increment(1);
                let last_known = self.last_known();
                if !self.unavailable.swap(true, Ordering::Relaxed) {
                    warn!(
                        namespace = %self.namespace,
                        resolved = ?resolved,
                        last_known,
                        "rate source unavailable, keeping last known rate"
                    );
                }
                last_known
            }
        }
    }
}
