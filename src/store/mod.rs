/// Key store abstraction backing every persistent structure: zone records,
/// the health queue, certificate material, session tickets and the external
/// resolver cache. Redis is the production backend; the in-memory backend
/// serves tests.
pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Operations the zone store and its sibling subsystems rely on.
/// Implementations must be thread-safe; every method is a suspension point.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetch a string key. Returns `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a string key, optionally with a TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Set a string key only if absent; the TTL doubles as a lease.
    /// Returns true when the key was set.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete a key of any kind. Returns true when something was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Whether a key of any kind exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Apply a TTL to an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Set a hash field unconditionally.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Set a hash field only if absent. Returns true when the field was set.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Set a hash field only if absent and add the hash key to an index set
    /// in the same atomic step. Returns true when the field was set.
    async fn hset_nx_indexed(
        &self,
        key: &str,
        field: &str,
        value: &str,
        index: &str,
    ) -> Result<bool>;

    /// Set several hash fields at once.
    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Fetch one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Fetch all fields of a hash. Empty map when the key is absent.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Delete one hash field. Returns true iff the field existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Add a set member. Returns true when the member was new.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a set member. Returns true when the member existed.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Add (or rescore) a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Remove a sorted-set member. Returns true when the member existed.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Pop the lowest-scored member with score <= `max_score` and reinsert
    /// it at `new_score`, atomically. Returns the member, or `None` when
    /// nothing is due. At most one concurrent caller observes a given
    /// member per cycle, across processes.
    async fn pop_due(&self, key: &str, max_score: i64, new_score: i64) -> Result<Option<String>>;
}

/// Blanket implementation so components can share backends behind an `Arc`.
#[async_trait]
impl<T: KeyStore + ?Sized> KeyStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        (**self).set_nx(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        (**self).del(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        (**self).expire(key, ttl).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        (**self).hset(key, field, value).await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        (**self).hset_nx(key, field, value).await
    }

    async fn hset_nx_indexed(
        &self,
        key: &str,
        field: &str,
        value: &str,
        index: &str,
    ) -> Result<bool> {
        (**self).hset_nx_indexed(key, field, value, index).await
    }

    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        (**self).hset_multi(key, fields).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        (**self).hget(key, field).await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        (**self).hget_all(key).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        (**self).hdel(key, field).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        (**self).sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        (**self).srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        (**self).smembers(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        (**self).zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        (**self).zrem(key, member).await
    }

    async fn pop_due(&self, key: &str, max_score: i64, new_score: i64) -> Result<Option<String>> {
        (**self).pop_due(key, max_score, new_score).await
    }
}

pub use memory::MemoryStore;
pub use redis::RedisStore;
