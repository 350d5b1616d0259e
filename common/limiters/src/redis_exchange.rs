use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common_redis::{Client, CustomRedisError};
use metrics::counter;
use tracing::{debug, error, warn};

use crate::error::ExchangeError;
use crate::estimator::UsageReport;
use crate::exchange::PeerExchange;

const DECODE_ERRORS_COUNTER: &str = "namespace_limiter_peer_exchange_decode_errors_total";
const PRUNED_REPORTS_COUNTER: &str = "namespace_limiter_peer_exchange_pruned_total";

#[derive(Debug, Clone)]
pub struct RedisExchangeConfig {
    /// Reports of a namespace live in the hash `{key_prefix}:{namespace}`.
    pub key_prefix: String,
    /// TTL refreshed on every publish. Fields older than this are pruned on collect.
    pub report_ttl: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for RedisExchangeConfig {
    fn default() -> Self {
        Self {
            key_prefix: "@admission/usage_reports".to_string(),
            report_ttl: Duration::from_secs(60),
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(200),
        }
    }
}

/// Shares usage reports through one Redis hash per namespace, one field per instance.
pub struct RedisExchange {
    redis: Arc<dyn Client + Send + Sync>,
    config: RedisExchangeConfig,
}

impl RedisExchange {
    pub fn new(redis: Arc<dyn Client + Send + Sync>, config: RedisExchangeConfig) -> anyhow::Result<Self> {
        if config.report_ttl.as_secs() == 0 {
            anyhow::bail!("report_ttl must be at least one second");
        }
        if config.read_timeout.is_zero() || config.write_timeout.is_zero() {
            anyhow::bail!("read and write timeouts must be non-zero");
        }
        Ok(Self { redis, config })
    }

    pub fn key(&self, namespace: &str) -> String {
        format!("{}:{}", self.config.key_prefix, namespace)
    }

    async fn prune(&self, key: String, fields: Vec<String>) {
        let count = fields.len() as u64;
        match tokio::time::timeout(self.config.write_timeout, self.redis.hdel(key.clone(), fields)).await {
            Ok(Ok(())) => {
                counter!(PRUNED_REPORTS_COUNTER).increment(count);
                debug!(key = %key, count, "pruned expired usage reports");
            }
            Ok(Err(e)) => warn!(key = %key, error = %e, "failed to prune expired usage reports"),
            Err(_) => warn!(key = %key, "timed out pruning expired usage reports"),
        }
    }
}

fn from_redis(e: CustomRedisError) -> ExchangeError {
    match e {
        CustomRedisError::Timeout => ExchangeError::Timeout,
        other if other.is_unrecoverable_error() => {
            error!(error = %other, "redis rejected the usage exchange");
            ExchangeError::Misconfigured(other.to_string())
        }
        other => ExchangeError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl PeerExchange for RedisExchange {
    async fn publish(&self, report: &UsageReport) -> Result<(), ExchangeError> {
        let value = serde_json::to_string(report)?;
        let ttl = self.config.report_ttl.as_secs() as usize;

        tokio::time::timeout(
            self.config.write_timeout,
            self.redis.hset_with_expire(
                self.key(&report.namespace),
                report.instance_id.clone(),
                value,
                ttl,
            ),
        )
        .await
        .map_err(|_| ExchangeError::Timeout)?
        .map_err(from_redis)
    }

    async fn collect(&self, namespace: &str) -> Result<Vec<UsageReport>, ExchangeError> {
        let key = self.key(namespace);
        let fields = tokio::time::timeout(self.config.read_timeout, self.redis.hgetall(key.clone()))
            .await
            .map_err(|_| ExchangeError::Timeout)?
            .map_err(from_redis)?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.report_ttl)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let mut reports = Vec::with_capacity(fields.len());
        let mut expired = Vec::new();

        for (field, value) in fields {
            match serde_json::from_str::<UsageReport>(&value) {
                Ok(report) if now.signed_duration_since(report.window_end) > ttl => expired.push(field),
                Ok(report) => reports.push(report),
                Err(e) => {
                    counter!(DECODE_ERRORS_COUNTER).increment(1);
                    warn!(key = %key, field = %field, error = %e, "skipping undecodable usage report");
                }
            }
        }

        if !expired.is_empty() {
            self.prune(key, expired).await;
        }

        Ok(reports)
    }
}
