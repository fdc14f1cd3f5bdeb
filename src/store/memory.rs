/// In-memory key store backend for tests
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::KeyStore;
use crate::error::Result;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Vec<u8>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, BTreeMap<String, i64>>,
    expiry: HashMap<String, Instant>,
}

impl Inner {
    fn purge(&mut self, key: &str) {
        if let Some(deadline) = self.expiry.get(key) {
            if Instant::now() >= *deadline {
                self.expiry.remove(key);
                self.strings.remove(key);
                self.hashes.remove(key);
                self.sets.remove(key);
                self.zsets.remove(key);
            }
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.sets.contains_key(key)
            || self.zsets.contains_key(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        let existed = self.contains(key);
        self.strings.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
        self.zsets.remove(key);
        self.expiry.remove(key);
        existed
    }
}

/// In-memory store, semantics matching the Redis backend
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(key.to_string(), value.to_vec());
        match ttl {
            Some(ttl) => {
                inner.expiry.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                inner.expiry.remove(key);
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        if inner.contains(key) {
            return Ok(false);
        }
        inner.strings.insert(key.to_string(), value.to_vec());
        inner.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner.remove(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner.contains(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        if !inner.contains(key) {
            return Ok(false);
        }
        inner.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hset_nx_indexed(
        &self,
        key: &str,
        field: &str,
        value: &str,
        index: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let added = if hash.contains_key(field) {
            false
        } else {
            hash.insert(field.to_string(), value.to_string());
            true
        };
        inner
            .sets
            .entry(index.to_string())
            .or_default()
            .insert(key.to_string());
        Ok(added)
    }

    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let Some(hash) = inner.hashes.get_mut(key) else {
            return Ok(false);
        };
        let existed = hash.remove(field).is_some();
        if hash.is_empty() {
            inner.hashes.remove(key);
        }
        Ok(existed)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(false);
        };
        let existed = set.remove(member);
        if set.is_empty() {
            inner.sets.remove(key);
        }
        Ok(existed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let existed = zset.remove(member).is_some();
        if zset.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(existed)
    }

    async fn pop_due(&self, key: &str, max_score: i64, new_score: i64) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge(key);
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(None);
        };
        let due = zset
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .min_by_key(|(member, score)| (**score, member.clone()))
            .map(|(member, _)| member.clone());
        if let Some(member) = due {
            zset.insert(member.clone(), new_score);
            return Ok(Some(member));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_ops() {
        let store = MemoryStore::new();
        store.set("k", b"v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.del("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_respects_existing() {
        let store = MemoryStore::new();
        assert!(
            store
                .set_nx("lock", b"a", Duration::from_secs(60))
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_nx("lock", b"b", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = MemoryStore::new();
        assert!(store.hset_nx("h", "f", "1").await.unwrap());
        assert!(!store.hset_nx("h", "f", "2").await.unwrap());
        assert_eq!(store.hget("h", "f").await.unwrap(), Some("1".to_string()));
        assert!(store.hdel("h", "f").await.unwrap());
        assert!(!store.hdel("h", "f").await.unwrap());
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_pop_due_reinserts() {
        let store = MemoryStore::new();
        store.zadd("q", "a", 10).await.unwrap();
        store.zadd("q", "b", 20).await.unwrap();

        let popped = store.pop_due("q", 15, 100).await.unwrap();
        assert_eq!(popped, Some("a".to_string()));

        // "a" is rescored into the future, "b" is not yet due
        let popped = store.pop_due("q", 15, 100).await.unwrap();
        assert_eq!(popped, None);

        let popped = store.pop_due("q", 20, 100).await.unwrap();
        assert_eq!(popped, Some("b".to_string()));
    }
}
