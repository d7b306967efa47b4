use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;

use crate::config::{duration_millis, LeaseLockConfig};
use crate::renewer::{LeaseStatus, Renewer};
use crate::store::LeaseStore;
use crate::token::generate_token;
use crate::LockError;

/// `unlock` の結果。どちらの場合もハンドルは Idle に戻る。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// 自分のトークンが一致し、キーを削除した。
    Released,
    /// キーが存在しないか、他者のトークンになっていた。
    NotOwned,
}

struct HeldLease {
    name: String,
    token: String,
    renewer: Option<Renewer>,
}

enum LockState {
    Idle,
    Acquiring,
    Held(HeldLease),
}

impl LockState {
    fn status(&self) -> LeaseStatus {
        match self {
            LockState::Idle => LeaseStatus::Idle,
            LockState::Acquiring => LeaseStatus::Acquiring,
            LockState::Held(_) => LeaseStatus::Held,
        }
    }
}

/// 共有 KVS 上のリースで相互排他を実現するロックハンドル。
///
/// 1 つのハンドルは 1 つの呼び出し元が所有する。`lock` と `unlock` は
/// 内部の排他ガードで直列化されるが、並行利用を想定したものではない。
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use k1s0_lease_lock::{InMemoryLeaseStore, LeaseLock};
/// # async fn run() -> Result<(), k1s0_lease_lock::LockError> {
/// let lock = LeaseLock::new(Arc::new(InMemoryLeaseStore::new()));
/// lock.lock("orders", Duration::from_secs(5), Duration::from_secs(10)).await?;
/// // クリティカルセクション
/// lock.ensure_valid()?;
/// lock.unlock().await?;
/// # Ok(())
/// # }
/// ```
pub struct LeaseLock {
    store: Arc<dyn LeaseStore>,
    config: LeaseLockConfig,
    state: Mutex<LockState>,
    status: Arc<watch::Sender<LeaseStatus>>,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self::build(store, LeaseLockConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn LeaseStore>,
        config: LeaseLockConfig,
    ) -> Result<Self, LockError> {
        config.validate()?;
        Ok(Self::build(store, config))
    }

    fn build(store: Arc<dyn LeaseStore>, config: LeaseLockConfig) -> Self {
        let (status, _) = watch::channel(LeaseStatus::Idle);
        Self {
            store,
            config,
            state: Mutex::new(LockState::Idle),
            status: Arc::new(status),
        }
    }

    /// `name` のリースを取得する。
    ///
    /// 取得できるまで `retry_interval_ms` 間隔で再試行し、`acquire_timeout` を
    /// 過ぎたら `LockError::AcquireTimeout` を返す。取得後は `auto_renew` が有効なら
    /// バックグラウンドで `lease_duration` の更新を続ける。
    pub async fn lock(
        &self,
        name: &str,
        acquire_timeout: Duration,
        lease_duration: Duration,
    ) -> Result<(), LockError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, LockState::Idle) {
            return Err(LockError::AlreadyHeld(name.to_string()));
        }
        if lease_duration < Duration::from_millis(1) {
            return Err(LockError::InvalidConfig(format!(
                "リース期間は 1ms 以上である必要があります: {:?}",
                lease_duration
            )));
        }

        let token = generate_token(self.config.token_bytes)?;

        self.transition(&mut state, LockState::Acquiring);
        // 取得ループの途中でこの Future が破棄されても Idle に戻す
        let mut state = AcquireGuard {
            state,
            status: &self.status,
        };
        self.acquire(name, &token, lease_duration, acquire_timeout).await?;
        tracing::info!(lease = %name, ttl_ms = duration_millis(lease_duration), "lease acquired");

        // 更新タスクが Lost を書く前に Held を公開しておく
        self.transition(
            &mut state,
            LockState::Held(HeldLease {
                name: name.to_string(),
                token: token.clone(),
                renewer: None,
            }),
        );
        if self.config.auto_renew {
            if let LockState::Held(held) = &mut *state {
                held.renewer = Some(Renewer::spawn(
                    self.store.clone(),
                    name.to_string(),
                    token,
                    lease_duration,
                    self.config.renew_period(lease_duration),
                    self.status.clone(),
                ));
            }
        }
        Ok(())
    }

    /// 更新タスクを停止してからリースを解放し、ハンドルを Idle に戻す。
    ///
    /// 既に他者がリースを持っていた場合は何も削除せず `NotOwned` を返す。
    pub async fn unlock(&self) -> Result<ReleaseOutcome, LockError> {
        let mut state = self.state.lock().await;
        let held = match &mut *state {
            LockState::Held(held) => Some((
                held.name.clone(),
                held.token.clone(),
                held.renewer.take(),
            )),
            _ => None,
        };
        let Some((name, token, renewer)) = held else {
            self.transition(&mut state, LockState::Idle);
            return Ok(ReleaseOutcome::NotOwned);
        };
        if let Some(renewer) = renewer {
            renewer.stop().await;
        }

        let released = self.store.compare_and_delete(&name, &token).await;
        self.transition(&mut state, LockState::Idle);

        if released? {
            tracing::info!(lease = %name, "lease released");
            Ok(ReleaseOutcome::Released)
        } else {
            tracing::warn!(lease = %name, "lease was not held by this handle at release");
            Ok(ReleaseOutcome::NotOwned)
        }
    }

    async fn acquire(
        &self,
        name: &str,
        token: &str,
        lease_duration: Duration,
        acquire_timeout: Duration,
    ) -> Result<(), LockError> {
        // 加算できないほど大きい期限は無期限として扱う
        let deadline = Instant::now().checked_add(acquire_timeout);
        let retry_interval = self.config.retry_interval();
        let mut attempts: u32 = 0;

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::debug!(lease = %name, attempts, "lease acquisition timed out");
                return Err(LockError::AcquireTimeout {
                    name: name.to_string(),
                    timeout: acquire_timeout,
                });
            }

            attempts += 1;
            if self.store.set_if_absent(name, token, lease_duration).await? {
                return Ok(());
            }
            tracing::debug!(lease = %name, attempts, "lease held elsewhere, retrying");

            let backoff = match deadline {
                Some(d) => retry_interval.min(d.saturating_duration_since(Instant::now())),
                None => retry_interval,
            };
            tokio::time::sleep(backoff).await;
        }
    }

    fn transition(&self, slot: &mut LockState, next: LockState) -> LockState {
        publish(&self.status, slot, next)
    }

    pub fn status(&self) -> LeaseStatus {
        self.status.borrow().clone()
    }

    /// リースを保持していて、更新タスクが喪失を検知していなければ `true`。
    pub fn is_valid(&self) -> bool {
        self.status().is_valid()
    }

    /// クリティカルセクション内から呼び、リースが失われていればエラーを返す。
    pub fn ensure_valid(&self) -> Result<(), LockError> {
        match self.status() {
            LeaseStatus::Held => Ok(()),
            LeaseStatus::Lost => Err(LockError::LeaseLost(
                "他のクライアントがリースを取得しています".to_string(),
            )),
            LeaseStatus::RenewalFailed(reason) => Err(LockError::LeaseLost(format!(
                "リースの更新に失敗しました: {}",
                reason
            ))),
            LeaseStatus::Idle | LeaseStatus::Acquiring => Err(LockError::LeaseLost(
                "リースを保持していません".to_string(),
            )),
        }
    }

    /// 状態の変化を受け取るレシーバを返す。
    pub fn subscribe(&self) -> watch::Receiver<LeaseStatus> {
        self.status.subscribe()
    }

    /// 保持中のトークン。取得処理中は完了するまで待つ。
    pub async fn token(&self) -> Option<String> {
        match &*self.state.lock().await {
            LockState::Held(held) => Some(held.token.clone()),
            _ => None,
        }
    }

    pub async fn is_locked(&self, name: &str) -> Result<bool, LockError> {
        self.store.exists(name).await
    }
}

fn publish(
    status: &watch::Sender<LeaseStatus>,
    slot: &mut LockState,
    next: LockState,
) -> LockState {
    status.send_replace(next.status());
    std::mem::replace(slot, next)
}

/// `lock` の取得中だけ状態を握るガード。Acquiring のまま破棄されたら Idle に戻す。
struct AcquireGuard<'a> {
    state: MutexGuard<'a, LockState>,
    status: &'a watch::Sender<LeaseStatus>,
}

impl Deref for AcquireGuard<'_> {
    type Target = LockState;

    fn deref(&self) -> &LockState {
        &*self.state
    }
}

impl DerefMut for AcquireGuard<'_> {
    fn deref_mut(&mut self) -> &mut LockState {
        &mut *self.state
    }
}

impl Drop for AcquireGuard<'_> {
    fn drop(&mut self) {
        if matches!(*self.state, LockState::Acquiring) {
            publish(self.status, &mut *self.state, LockState::Idle);
        }
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        if let LockState::Held(held) = self.state.get_mut() {
            if let Some(renewer) = &held.renewer {
                renewer.cancel();
            }
            tracing::warn!(lease = %held.name, "lease lock dropped while held, lease left to expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockLeaseStore;

    fn store_error() -> LockError {
        LockError::Store("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_without_store_call() {
        let mut store = MockLeaseStore::new();
        store.expect_set_if_absent().never();
        let lock = LeaseLock::new(Arc::new(store));

        let result = lock.lock("orders", Duration::ZERO, Duration::from_secs(10)).await;
        assert!(matches!(result, Err(LockError::AcquireTimeout { .. })));
        assert_eq!(lock.status(), LeaseStatus::Idle);
    }

    #[tokio::test]
    async fn test_acquire_store_error_is_surfaced_immediately() {
        let mut store = MockLeaseStore::new();
        store
            .expect_set_if_absent()
            .times(1)
            .returning(|_, _, _| Err(store_error()));
        let lock = LeaseLock::new(Arc::new(store));

        let result = lock
            .lock("orders", Duration::from_secs(5), Duration::from_secs(10))
            .await;
        assert!(matches!(result, Err(LockError::Store(_))));
        assert_eq!(lock.status(), LeaseStatus::Idle);
        assert!(lock.token().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_lease_duration_is_rejected() {
        let mut store = MockLeaseStore::new();
        store.expect_set_if_absent().never();
        let lock = LeaseLock::new(Arc::new(store));

        let result = lock.lock("orders", Duration::from_secs(1), Duration::ZERO).await;
        assert!(matches!(result, Err(LockError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_lock_while_held_is_rejected() {
        let mut store = MockLeaseStore::new();
        store
            .expect_set_if_absent()
            .times(1)
            .returning(|_, _, _| Ok(true));
        let config = LeaseLockConfig::default().with_auto_renew(false);
        let lock = LeaseLock::with_config(Arc::new(store), config).unwrap();

        lock.lock("orders", Duration::from_secs(1), Duration::from_secs(10))
            .await
            .unwrap();
        let result = lock
            .lock("orders", Duration::from_secs(1), Duration::from_secs(10))
            .await;
        assert!(matches!(result, Err(LockError::AlreadyHeld(_))));
        assert_eq!(lock.status(), LeaseStatus::Held);
    }

    #[tokio::test]
    async fn test_unlock_store_error_still_returns_to_idle() {
        let mut store = MockLeaseStore::new();
        store.expect_set_if_absent().returning(|_, _, _| Ok(true));
        store
            .expect_compare_and_delete()
            .times(1)
            .returning(|_, _| Err(store_error()));
        let config = LeaseLockConfig::default().with_auto_renew(false);
        let lock = LeaseLock::with_config(Arc::new(store), config).unwrap();

        lock.lock("orders", Duration::from_secs(1), Duration::from_secs(10))
            .await
            .unwrap();
        let result = lock.unlock().await;
        assert!(matches!(result, Err(LockError::Store(_))));
        assert_eq!(lock.status(), LeaseStatus::Idle);
        assert!(lock.token().await.is_none());
    }

    #[tokio::test]
    async fn test_unlock_without_lock_does_not_touch_store() {
        let mut store = MockLeaseStore::new();
        store.expect_compare_and_delete().never();
        let lock = LeaseLock::new(Arc::new(store));

        assert_eq!(lock.unlock().await.unwrap(), ReleaseOutcome::NotOwned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_mismatch_marks_lease_lost() {
        let mut store = MockLeaseStore::new();
        store.expect_set_if_absent().returning(|_, _, _| Ok(true));
        store
            .expect_compare_and_renew()
            .times(1)
            .returning(|_, _, _| Ok(false));
        store.expect_compare_and_delete().returning(|_, _| Ok(false));
        let lock = LeaseLock::new(Arc::new(store));

        lock.lock("orders", Duration::from_secs(1), Duration::from_secs(10))
            .await
            .unwrap();
        let mut rx = lock.subscribe();
        rx.wait_for(|s| *s == LeaseStatus::Lost).await.unwrap();

        assert!(!lock.is_valid());
        assert!(matches!(lock.ensure_valid(), Err(LockError::LeaseLost(_))));
        // 喪失を検知しても unlock までは保持中として扱う
        assert!(matches!(
            lock.lock("orders", Duration::from_secs(1), Duration::from_secs(10)).await,
            Err(LockError::AlreadyHeld(_))
        ));
        assert_eq!(lock.unlock().await.unwrap(), ReleaseOutcome::NotOwned);
        assert_eq!(lock.status(), LeaseStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_store_error_stops_renewer() {
        let mut store = MockLeaseStore::new();
        store.expect_set_if_absent().returning(|_, _, _| Ok(true));
        store
            .expect_compare_and_renew()
            .times(1)
            .returning(|_, _, _| Err(store_error()));
        let lock = LeaseLock::new(Arc::new(store));

        lock.lock("orders", Duration::from_secs(1), Duration::from_secs(10))
            .await
            .unwrap();
        let mut rx = lock.subscribe();
        rx.wait_for(|s| matches!(s, LeaseStatus::RenewalFailed(_)))
            .await
            .unwrap();

        // 停止後は再試行しない（times(1) で検証）
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(matches!(lock.ensure_valid(), Err(LockError::LeaseLost(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lost_status_survives_short_lease_on_multi_thread() {
        for _ in 0..20 {
            let mut store = MockLeaseStore::new();
            store.expect_set_if_absent().returning(|_, _, _| Ok(true));
            store
                .expect_compare_and_renew()
                .times(1)
                .returning(|_, _, _| Ok(false));
            let lock = LeaseLock::new(Arc::new(store));

            lock.lock("orders", Duration::from_secs(1), Duration::from_millis(1))
                .await
                .unwrap();
            let mut rx = lock.subscribe();
            tokio::time::timeout(
                Duration::from_secs(5),
                rx.wait_for(|s| *s == LeaseStatus::Lost),
            )
            .await
            .expect("Lost が Held で上書きされてはならない")
            .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_resets_any_non_held_state() {
        let store = MockLeaseStore::new();
        let lock = LeaseLock::new(Arc::new(store));
        {
            let mut state = lock.state.lock().await;
            lock.transition(&mut state, LockState::Acquiring);
        }
        assert_eq!(lock.status(), LeaseStatus::Acquiring);

        assert_eq!(lock.unlock().await.unwrap(), ReleaseOutcome::NotOwned);
        assert_eq!(lock.status(), LeaseStatus::Idle);
    }
}
