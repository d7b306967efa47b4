use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};

use crate::config::duration_millis;
use crate::store::LeaseStore;
use crate::LockError;

/// Redis-backed lease store.
///
/// Acquisition is a single `SET key token NX PX ms`; release and renewal run
/// as Lua scripts so the token comparison and the mutation are one atomic step.
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisLeaseStore {
    /// Open a multiplexed connection to `url` (e.g. "redis://127.0.0.1:6379").
    pub async fn new(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self::from_connection(conn))
    }

    /// Reuse an existing connection. The store never assumes exclusive use of it.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "lock".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn lease_key(&self, key: &str) -> String {
        format_lease_key(&self.key_prefix, key)
    }
}

/// Deletes the key only if it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Resets the TTL only if the key still holds the caller's token.
const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lease_key(key);

        let result: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(duration_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result.is_some())
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lease_key(key);

        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&full_key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(deleted == 1)
    }

    async fn compare_and_renew(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lease_key(key);

        let renewed: i64 = Script::new(RENEW_SCRIPT)
            .key(&full_key)
            .arg(token)
            .arg(duration_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(renewed == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lease_key(key);
        let exists: bool = conn.exists(&full_key).await.map_err(map_redis_error)?;
        Ok(exists)
    }
}

fn map_redis_error(err: RedisError) -> LockError {
    LockError::Store(err.to_string())
}

/// Format a namespaced lease key (exposed for testing without a Redis connection).
pub fn format_lease_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}
