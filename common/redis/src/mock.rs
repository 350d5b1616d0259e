use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{Client, CustomRedisError};

#[derive(Clone, Default)]
pub struct MockRedisClient {
    hset_with_expire_ret: Option<Result<(), CustomRedisError>>,
    hgetall_ret: HashMap<String, HashMap<String, String>>,
    hgetall_error: Option<CustomRedisError>,
    hdel_ret: Option<Result<(), CustomRedisError>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<MockRedisCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn hset_with_expire_ret(&mut self, ret: Result<(), CustomRedisError>) -> Self {
        self.hset_with_expire_ret = Some(ret);
        self.clone()
    }

    pub fn hgetall_ret(&mut self, key: &str, ret: HashMap<String, String>) -> Self {
        self.hgetall_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn hgetall_error(&mut self, err: CustomRedisError) -> Self {
        self.hgetall_error = Some(err);
        self.clone()
    }

    pub fn hdel_ret(&mut self, ret: Result<(), CustomRedisError>) -> Self {
        self.hdel_ret = Some(ret);
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock_calls().clone()
    }
}

#[derive(Debug, Clone)]
pub enum MockRedisValue {
    None,
    FieldWithTTL(String, String, usize),
    VecString(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

#[async_trait]
impl Client for MockRedisClient {
    async fn hset_with_expire(
        &self,
        key: String,
        field: String,
        value: String,
        ttl_seconds: usize,
    ) -> Result<(), CustomRedisError> {
        self.lock_calls().push(MockRedisCall {
            op: "hset_with_expire".to_string(),
            key,
            value: MockRedisValue::FieldWithTTL(field, value, ttl_seconds),
        });

        match &self.hset_with_expire_ret {
            Some(ret) => ret.clone(),
            None => Ok(()),
        }
    }

    async fn hgetall(&self, key: String) -> Result<HashMap<String, String>, CustomRedisError> {
        self.lock_calls().push(MockRedisCall {
            op: "hgetall".to_string(),
            key: key.clone(),
            value: MockRedisValue::None,
        });

        if let Some(err) = &self.hgetall_error {
            return Err(err.clone());
        }

        Ok(self.hgetall_ret.get(&key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: String, fields: Vec<String>) -> Result<(), CustomRedisError> {
        self.lock_calls().push(MockRedisCall {
            op: "hdel".to_string(),
            key,
            value: MockRedisValue::VecString(fields),
        });

        match &self.hdel_ret {
            Some(ret) => ret.clone(),
            None => Ok(()),
        }
    }
}
