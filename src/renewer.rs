use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::duration_millis;
use crate::store::LeaseStore;

/// ハンドルから観測できるリースの状態。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    Idle,
    Acquiring,
    Held,
    /// 更新時にトークンが一致しなかった。リースは期限切れ後に他者に取得されている。
    Lost,
    /// 更新時にストアとの通信に失敗し、更新を停止した。
    RenewalFailed(String),
}

impl LeaseStatus {
    /// クリティカルセクションを続けてよい状態かどうか。
    pub fn is_valid(&self) -> bool {
        matches!(self, LeaseStatus::Held)
    }
}

/// 実行中の更新タスクへのハンドル。
pub(crate) struct Renewer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Renewer {
    pub(crate) fn spawn(
        store: Arc<dyn LeaseStore>,
        name: String,
        token: String,
        lease_duration: Duration,
        period: Duration,
        status: Arc<watch::Sender<LeaseStatus>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                // キャンセルは待機の境界でのみ観測する。実行中の更新は最後まで走らせる。
                tokio::select! {
                    biased;
                    _ = token_cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }

                match store.compare_and_renew(&name, &token, lease_duration).await {
                    Ok(true) => {
                        tracing::debug!(lease = %name, ttl_ms = duration_millis(lease_duration), "lease renewed");
                    }
                    Ok(false) => {
                        tracing::error!(lease = %name, "lease lost: stored token no longer matches");
                        status.send_replace(LeaseStatus::Lost);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(lease = %name, error = %e, "lease renewal failed, renewer stopped");
                        status.send_replace(LeaseStatus::RenewalFailed(e.to_string()));
                        break;
                    }
                }
            }
        });

        Self { cancel, task }
    }

    /// キャンセルを通知し、タスクの終了を待つ。
    ///
    /// 戻った時点で更新は実行中でもなく、以後開始されることもない。
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "lease renewer task terminated abnormally");
        }
    }

    /// 待たずにキャンセルだけ通知する（Drop 用）。
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}
