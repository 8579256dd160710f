//! Redis-backed [`CacheStore`] implementation for production deployments.

use super::{CacheError, CacheStore};
use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{error, info};

pub type RedisPool = Pool<RedisConnectionManager>;

/// Initialize the Redis connection pool used by [`RedisCache`].
pub async fn init_cache_pool(
    redis_url: &str,
    max_connections: u32,
) -> Result<RedisPool, CacheError> {
    info!(max_connections, "initializing redis cache pool");

    let manager = RedisConnectionManager::new(redis_url).map_err(|e| {
        error!("failed to create redis connection manager: {}", e);
        CacheError::Connection(e.to_string())
    })?;

    Pool::builder()
        .max_size(max_connections)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
        .await
        .map_err(|e| {
            error!("failed to build redis connection pool: {}", e);
            CacheError::Connection(e.to_string())
        })
}

pub struct RedisCache {
    pool: RedisPool,
}

impl RedisCache {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        conn.get(key)
            .await
            .map_err(|e| CacheError::Operation(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        conn.set_ex(key, value, ttl.as_secs())
            .await
            .map_err(|e| CacheError::Operation(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        conn.del(key)
            .await
            .map_err(|e| CacheError::Operation(e.to_string()))
    }
}
