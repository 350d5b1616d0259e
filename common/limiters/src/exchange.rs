use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::estimator::UsageReport;

/// Transport carrying usage reports between instances.
///
/// Delivery is best-effort: `collect` returns the latest report of every reachable
/// instance for the namespace, possibly including this instance's own, in no
/// particular order.
#[async_trait]
pub trait PeerExchange: Send + Sync {
    async fn publish(&self, report: &UsageReport) -> Result<(), ExchangeError>;

    async fn collect(&self, namespace: &str) -> Result<Vec<UsageReport>, ExchangeError>;
}

/// In-process exchange, shared by cloning. Keeps the newest report per instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryExchange {
    reports: Arc<RwLock<HashMap<String, HashMap<String, UsageReport>>>>,
}

impl MemoryExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget an instance, as if its reports had expired.
    pub fn remove_instance(&self, instance_id: &str) {
        let mut reports = self.reports.write().unwrap_or_else(PoisonError::into_inner);
        for by_instance in reports.values_mut() {
            by_instance.remove(instance_id);
        }
    }
}

#[async_trait]
impl PeerExchange for MemoryExchange {
    async fn publish(&self, report: &UsageReport) -> Result<(), ExchangeError> {
        let mut reports = self.reports.write().unwrap_or_else(PoisonError::into_inner);
        let by_instance = reports.entry(report.namespace.clone()).or_default();
        match by_instance.get(&report.instance_id) {
            Some(existing) if existing.window_end >= report.window_end => {}
            _ => {
                by_instance.insert(report.instance_id.clone(), report.clone());
            }
        }
        Ok(())
    }

    async fn collect(&self, namespace: &str) -> Result<Vec<UsageReport>, ExchangeError> {
        let reports = self.reports.read().unwrap_or_else(PoisonError::into_inner);
        Ok(reports
            .get(namespace)
            .map(|by_instance| by_instance.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn report(namespace: &str, instance_id: &str, admitted: u64, end: i64) -> UsageReport {
        let at = |secs: i64| -> DateTime<Utc> { DateTime::from_timestamp(secs, 0).unwrap() };
        UsageReport {
            namespace: namespace.to_string(),
            instance_id: instance_id.to_string(),
            admitted,
            rejected: 0,
            window_start: at(end - 5),
            window_end: at(end),
        }
    }

    #[tokio::test]
    async fn test_collect_returns_latest_per_instance() {
        let exchange = MemoryExchange::new();
        exchange.publish(&report("acme", "a", 1, 10)).await.unwrap();
        exchange.publish(&report("acme", "a", 2, 15)).await.unwrap();
        exchange.publish(&report("acme", "a", 3, 5)).await.unwrap();
        exchange.publish(&report("acme", "b", 4, 15)).await.unwrap();
        exchange.publish(&report("beta", "a", 5, 15)).await.unwrap();

        let mut collected = exchange.collect("acme").await.unwrap();
        collected.sort_by(|l, r| l.instance_id.cmp(&r.instance_id));
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].admitted, 2);
        assert_eq!(collected[1].admitted, 4);

        assert!(exchange.collect("gamma").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let exchange = MemoryExchange::new();
        let other = exchange.clone();
        other.publish(&report("acme", "b", 1, 5)).await.unwrap();
        assert_eq!(exchange.collect("acme").await.unwrap().len(), 1);

        exchange.remove_instance("b");
        assert!(other.collect("acme").await.unwrap().is_empty());
    }
}
