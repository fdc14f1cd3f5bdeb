/// Redis key store backend
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

use super::KeyStore;
use crate::error::{DnsError, Result};

/// Pops the lowest-scored member at or below the deadline and reinserts it
/// at the caller's future score, in one atomic step.
const POP_DUE_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #items == 0 then
    return false
end
redis.call('ZADD', KEYS[1], ARGV[2], items[1])
return items[1]
"#;

/// Redis-backed key store
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
    pop_due: redis::Script,
}

impl RedisStore {
    /// Connect to Redis and build the managed connection
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| DnsError::storage(format!("Redis connect error: {}", e)))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| DnsError::storage(format!("Redis conn error: {}", e)))?;
        tracing::info!("Connected to key store at {}", redis_url);
        Ok(Self {
            manager,
            pop_due: redis::Script::new(POP_DUE_SCRIPT),
        })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KeyStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let data: Option<Vec<u8>> = conn.get(key).await?;
        Ok(data)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let applied: bool = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(applied)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: bool = conn.hset_nx(key, field, value).await?;
        Ok(added)
    }

    async fn hset_nx_indexed(
        &self,
        key: &str,
        field: &str,
        value: &str,
        index: &str,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let (added, _): (bool, i64) = redis::pipe()
            .atomic()
            .hset_nx(key, field, value)
            .sadd(index, key)
            .query_async(&mut conn)
            .await?;
        Ok(added)
    }

    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn pop_due(&self, key: &str, max_score: i64, new_score: i64) -> Result<Option<String>> {
        let mut conn = self.conn();
        let member: Option<String> = self
            .pop_due
            .key(key)
            .arg(max_score)
            .arg(new_score)
            .invoke_async(&mut conn)
            .await?;
        Ok(member)
    }
}
