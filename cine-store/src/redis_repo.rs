use async_trait::async_trait;
use cine_core::{CoreError, CoreResult, LockStore};
use redis::RedisResult;
use std::time::Duration;
use tracing::debug;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, window_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count <= limit)
    }
}

fn lock_store_err(e: redis::RedisError) -> CoreError {
    CoreError::LockStore(e.to_string())
}

#[async_trait]
impl LockStore for RedisClient {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> CoreResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(lock_store_err)?;

        // SET NX: Only set if key does not exist
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(lock_store_err)?;

        debug!("SET NX {} -> {}", key, result.is_some());
        Ok(result.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> CoreResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(lock_store_err)?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_store_err)?;
        Ok(deleted == 1)
    }

    async fn ttl_remaining(&self, key: &str) -> CoreResult<Option<Duration>> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(lock_store_err)?;
        // -2: missing, -1: no expiry
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await.map_err(lock_store_err)?;
        Ok(if ms >= 0 { Some(Duration::from_millis(ms as u64)) } else { None })
    }
}
