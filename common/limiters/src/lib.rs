pub mod controller;
pub mod error;
pub mod estimator;
pub mod exchange;
pub mod limiter;
pub mod rate;
pub mod reconciler;
pub mod redis_exchange;
pub mod request;
pub mod token_bucket;

pub use controller::{Controller, NamespaceLimiter};
pub use error::{ExchangeError, WaitError};
pub use estimator::{EstimatorConfig, EstimatorState, GlobalUsageEstimator, ShareEstimate, UsageReport};
pub use exchange::{MemoryExchange, PeerExchange};
pub use limiter::{DynamicRateLimiter, LimiterConfig};
pub use rate::{DynamicRates, NamespaceRate, RateConfig, RateSupplier, StaticRates, UNLIMITED};
pub use reconciler::UsageReconciler;
pub use redis_exchange::{RedisExchange, RedisExchangeConfig};
pub use request::{RateLimiter, Request, RequestRateLimiter, RequestRateLimiterAdapter};
pub use token_bucket::{Burst, TokenBucket};
