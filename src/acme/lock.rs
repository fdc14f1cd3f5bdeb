//! Distributed mutual exclusion over the key store. A lock is a `d:lock:*`
//! key written with NX and a lease TTL; waiting callers poll until the
//! wait window runs out. Release only removes the key when the stored
//! token still matches, so an expired lease cannot release a successor.

use rand::RngExt;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::store::KeyStore;

/// Poll interval while waiting on a held lock
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// A successfully acquired lock
pub struct LockHandle {
    key: String,
    token: String,
}

/// Store-backed lock manager
pub struct StoreLock<S: KeyStore> {
    store: S,
}

impl<S: KeyStore> StoreLock<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Try to acquire `name` for `lease`, waiting up to `wait`. Returns
    /// `None` when the wait window closes without the lock.
    pub async fn acquire(
        &self,
        name: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<LockHandle>> {
        let key = format!("d:lock:{}", name);
        let token: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();

        let deadline = Instant::now() + wait;
        loop {
            if self.store.set_nx(&key, token.as_bytes(), lease).await? {
                tracing::debug!("acquired lock {}", key);
                return Ok(Some(LockHandle { key, token }));
            }
            if Instant::now() >= deadline {
                tracing::debug!("gave up waiting for lock {}", key);
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Release a held lock. A lease that already expired and was taken
    /// over by another holder is left alone.
    pub async fn release(&self, handle: LockHandle) -> Result<()> {
        if let Some(current) = self.store.get(&handle.key).await? {
            if current == handle.token.as_bytes() {
                self.store.del(&handle.key).await?;
                tracing::debug!("released lock {}", handle.key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let store = Arc::new(MemoryStore::new());
        let lock = StoreLock::new(store);

        let lease = Duration::from_secs(60);
        let first = lock
            .acquire("cert:abc", lease, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = lock
            .acquire("cert:abc", lease, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(second.is_none());

        lock.release(first.unwrap()).await.unwrap();
        let third = lock
            .acquire("cert:abc", lease, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(third.is_some());
    }
}
