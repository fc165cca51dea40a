use cine_core::{CoreResult, LockStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Short-lived named mutex on top of the lock store.
///
/// Used to serialize webhook, capture and refund handling for one payment
/// across API instances.
#[derive(Clone)]
pub struct KeyedMutex {
    locks: Arc<dyn LockStore>,
    ttl: Duration,
    attempts: u32,
    backoff: Duration,
}

impl KeyedMutex {
    pub fn new(locks: Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self { locks, ttl, attempts: 20, backoff: Duration::from_millis(50) }
    }

    pub fn payment_key(payment_id: Uuid) -> String {
        format!("payment:{}", payment_id)
    }

    /// Run `f` while holding `key`. `None` when the key stayed busy for every attempt.
    pub async fn run<F, Fut, T>(&self, key: &str, f: F) -> CoreResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let token = Uuid::new_v4().simple().to_string();

        let mut acquired = false;
        for attempt in 0..self.attempts {
            if self.locks.acquire(key, &token, self.ttl).await? {
                acquired = true;
                break;
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }
        if !acquired {
            warn!("Gave up waiting for {}", key);
            return Ok(None);
        }

        let out = f().await;

        if let Err(e) = self.locks.release(key, &token).await {
            // The TTL frees it anyway
            warn!("Failed to release {}: {}", key, e);
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cine_store::MemoryLockStore;

    #[tokio::test]
    async fn test_busy_key_gives_up() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        store.acquire("payment:x", "other", Duration::from_secs(60)).await.unwrap();

        let mut mutex = KeyedMutex::new(store.clone(), Duration::from_secs(5));
        mutex.attempts = 2;
        mutex.backoff = Duration::from_millis(1);

        let out = mutex.run("payment:x", || async { 1 }).await.unwrap();
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn test_key_released_after_run() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let mutex = KeyedMutex::new(store.clone(), Duration::from_secs(5));

        assert_eq!(mutex.run("k", || async { 7 }).await.unwrap(), Some(7));
        assert!(store.acquire("k", "next", Duration::from_secs(5)).await.unwrap());
    }
}
