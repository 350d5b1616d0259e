use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use limiters::{Burst, EstimatorConfig, LimiterConfig, RedisExchangeConfig, StaticRates};
use uuid::Uuid;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    /// Name of this instance in usage reports, a random UUID when empty.
    #[envconfig(from = "INSTANCE_ID", default = "")]
    pub instance_id: String,

    /// Usage is only shared in memory when unset.
    #[envconfig(from = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[envconfig(from = "DEFAULT_NAMESPACE_RATE", default = "100")]
    pub default_namespace_rate: f64,

    #[envconfig(from = "NAMESPACE_RATES", default = "")]
    pub namespace_rates: StaticRates,

    #[envconfig(from = "BURST_RATIO", default = "1.0")]
    pub burst_ratio: f64,

    #[envconfig(from = "FALLBACK_RATE", default = "inf")]
    pub fallback_rate: f64,

    #[envconfig(from = "REPORT_INTERVAL_MS", default = "5000")]
    pub report_interval: EnvMsDuration,

    #[envconfig(from = "FRESHNESS_WINDOW_MS", default = "15000")]
    pub freshness_window: EnvMsDuration,

    #[envconfig(from = "MAX_STALE_WINDOWS", default = "3")]
    pub max_stale_windows: u32,

    #[envconfig(from = "SHARE_FLOOR", default = "0.01")]
    pub share_floor: f64,

    #[envconfig(from = "EXCHANGE_TIMEOUT_MS", default = "500")]
    pub exchange_timeout: EnvMsDuration,

    #[envconfig(from = "REDIS_KEY_PREFIX", default = "@admission/usage_reports")]
    pub redis_key_prefix: String,

    #[envconfig(from = "REDIS_REPORT_TTL_SECS", default = "60")]
    pub redis_report_ttl_secs: u64,

    #[envconfig(from = "REDIS_CONNECTION_TIMEOUT_MS", default = "5000")]
    pub redis_connection_timeout: EnvMsDuration,

    /// Longest time a `/wait` request blocks before giving up.
    #[envconfig(from = "MAX_WAIT_MS", default = "1000")]
    pub max_wait: EnvMsDuration,

    #[envconfig(from = "EXPORT_PROMETHEUS", default = "true")]
    pub export_prometheus: bool,

    #[envconfig(from = "LOG_JSON", default = "false")]
    pub log_json: bool,
}

impl Config {
    /// Reject settings that would otherwise be silently coerced by the limiter.
    pub fn validate(&self) -> eyre::Result<()> {
        if !self.burst_ratio.is_finite() || self.burst_ratio <= 0.0 {
            eyre::bail!("BURST_RATIO must be a positive number, got {}", self.burst_ratio);
        }
        if !(0.0..=1.0).contains(&self.share_floor) {
            eyre::bail!("SHARE_FLOOR must be within [0, 1], got {}", self.share_floor);
        }
        Ok(())
    }

    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn instance_id(&self) -> String {
        if self.instance_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.instance_id.clone()
        }
    }

    pub fn rates(&self) -> StaticRates {
        StaticRates {
            default: self.default_namespace_rate,
            overrides: self.namespace_rates.overrides.clone(),
        }
    }

    pub fn limiter_config(&self, instance_id: String) -> LimiterConfig {
        LimiterConfig {
            instance_id,
            burst: Burst::Ratio(self.burst_ratio),
            fallback_rate: self.fallback_rate,
            estimator: EstimatorConfig {
                report_interval: self.report_interval.0,
                freshness_window: self.freshness_window.0,
                max_stale_windows: self.max_stale_windows,
                share_floor: self.share_floor,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn redis_exchange_config(&self) -> RedisExchangeConfig {
        RedisExchangeConfig {
            key_prefix: self.redis_key_prefix.clone(),
            report_ttl: time::Duration::from_secs(self.redis_report_ttl_secs),
            read_timeout: self.exchange_timeout.0,
            write_timeout: self.exchange_timeout.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use limiters::{RateConfig, UNLIMITED};
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3310");
        assert!(config.redis_url.is_none());
        assert_eq!(config.fallback_rate, UNLIMITED);
        assert_eq!(config.report_interval.0, time::Duration::from_secs(5));
        assert_eq!(config.max_wait.0, time::Duration::from_secs(1));
        assert!(config.export_prometheus);
        assert!(!config.log_json);

        let limiter = config.limiter_config("instance-a".to_string());
        assert_eq!(limiter.burst, Burst::Ratio(1.0));
        assert_eq!(limiter.estimator.freshness_window, time::Duration::from_secs(15));
        assert_eq!(limiter.estimator.max_stale_windows, 3);
    }

    #[test]
    fn test_namespace_rates_override_default() {
        let env = HashMap::from([
            ("DEFAULT_NAMESPACE_RATE".to_string(), "5".to_string()),
            ("NAMESPACE_RATES".to_string(), "acme:10,beta:0".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        let rates = config.rates();

        assert_eq!(rates.current_rate("acme"), Some(10.0));
        assert_eq!(rates.current_rate("beta"), Some(0.0));
        assert_eq!(rates.current_rate("gamma"), Some(5.0));
    }

    #[test]
    fn test_invalid_namespace_rates_fail() {
        let env = HashMap::from([("NAMESPACE_RATES".to_string(), "acme=10".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_burst_ratio() {
        assert!(Config::init_from_hashmap(&HashMap::new())
            .unwrap()
            .validate()
            .is_ok());

        for ratio in ["-1", "0", "NaN", "inf"] {
            let env = HashMap::from([("BURST_RATIO".to_string(), ratio.to_string())]);
            let config = Config::init_from_hashmap(&env).unwrap();
            assert!(config.validate().is_err(), "BURST_RATIO={ratio}");
        }

        let env = HashMap::from([("SHARE_FLOOR".to_string(), "1.5".to_string())]);
        assert!(Config::init_from_hashmap(&env).unwrap().validate().is_err());
    }

    #[test]
    fn test_instance_id() {
        let env = HashMap::from([("INSTANCE_ID".to_string(), "pod-1".to_string())]);
        assert_eq!(Config::init_from_hashmap(&env).unwrap().instance_id(), "pod-1");

        let generated = Config::init_from_hashmap(&HashMap::new())
            .unwrap()
            .instance_id();
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn test_ms_duration_parse() {
        assert_eq!(
            "250".parse::<EnvMsDuration>().unwrap().0,
            time::Duration::from_millis(250)
        );
        assert_eq!(
            "soon".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }
}
