//! Redis implementation of the lathe [`Cache`] contract.
//!
//! Used for the distributed cancel-flag entries. Strictly best-effort: every
//! failure maps to a transient cache error, which the engine degrades to a
//! job-store read. The connection manager reconnects on its own.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use lathe::cancel::Cache;
use lathe::EngineError;

pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, EngineError> {
        let client = redis::Client::open(url).map_err(cache_err)?;
        let manager = ConnectionManager::new(client).await.map_err(cache_err)?;
        info!("redis cache connected");
        Ok(Self { manager })
    }
}

fn cache_err(err: redis::RedisError) -> EngineError {
    EngineError::Transient {
        subsystem: lathe::Subsystem::Cache,
        message: err.to_string(),
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await.map_err(cache_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EngineError> {
        let mut conn = self.manager.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, seconds).await.map_err(cache_err)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), EngineError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await.map_err(cache_err)?;
        Ok(())
    }
}
