use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::time::Duration;

use crate::{Client, CustomRedisError};

pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    /// Create a new RedisClient with explicit timeouts
    ///
    /// `None` means no timeout (blocks indefinitely). `Some(Duration::ZERO)` is rejected
    /// with `CustomRedisError::InvalidConfiguration`.
    ///
    /// ```no_run
    /// use common_redis::RedisClient;
    /// use std::time::Duration;
    ///
    /// # async fn example() {
    /// let client = RedisClient::with_config(
    ///     "redis://localhost:6379".to_string(),
    ///     Some(Duration::from_millis(100)),
    ///     Some(Duration::from_millis(5000)),
    /// ).await.unwrap();
    /// # }
    /// ```
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        if response_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis response timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }
        if connection_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }
        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisClient { connection })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn hset_with_expire(
        &self,
        k: String,
        field: String,
        v: String,
        ttl_seconds: usize,
    ) -> Result<(), CustomRedisError> {
        let mut pipe = redis::pipe();
        pipe.cmd("HSET").arg(&k).arg(&field).arg(&v).ignore();
        pipe.cmd("EXPIRE").arg(&k).arg(ttl_seconds).ignore();

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn hgetall(&self, k: String) -> Result<HashMap<String, String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&k).query_async(&mut conn).await?;
        Ok(fields)
    }

    async fn hdel(&self, k: String, fields: Vec<String>) -> Result<(), CustomRedisError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        redis::cmd("HDEL")
            .arg(&k)
            .arg(&fields)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}
