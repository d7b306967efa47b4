use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::store::LeaseStore;
use crate::LockError;

struct LeaseEntry {
    token: String,
    /// `None` は加算できないほど長い TTL（実質無期限）。
    expires_at: Option<Instant>,
}

impl LeaseEntry {
    fn new(token: &str, ttl: Duration) -> Self {
        Self {
            token: token.to_string(),
            expires_at: expiry_after(ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |exp| Instant::now() >= exp)
    }
}

fn expiry_after(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

fn purge_expired(leases: &mut HashMap<String, LeaseEntry>) {
    leases.retain(|_, e| !e.is_expired());
}

/// プロセス内で完結する `LeaseStore` 実装。
///
/// 期限切れの判定は `tokio::time::Instant` で行うため、
/// 一時停止したテスト用クロックでも Redis と同じ TTL の挙動になる。
/// 期限切れのエントリは書き込み系の操作のたびに取り除く。
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseEntry>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// 期限内のリースに保存されているトークンを返す。
    pub async fn current_token(&self, key: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.token.clone())
    }

    /// 保持しているエントリ数（未掃除の期限切れを含む）。
    pub async fn len(&self) -> usize {
        self.leases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leases.lock().await.is_empty()
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().await;
        purge_expired(&mut leases);
        if leases.contains_key(key) {
            return Ok(false);
        }
        leases.insert(key.to_string(), LeaseEntry::new(token, ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().await;
        purge_expired(&mut leases);
        match leases.get(key) {
            Some(entry) if entry.token == token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_renew(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().await;
        purge_expired(&mut leases);
        match leases.get_mut(key) {
            Some(entry) if entry.token == token => {
                entry.expires_at = expiry_after(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        let leases = self.leases.lock().await;
        Ok(leases.get(key).map_or(false, |e| !e.is_expired()))
    }
}
