use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("トークンの生成に失敗しました: {0}")]
    Entropy(String),
    #[error("ストアとの通信に失敗しました: {0}")]
    Store(String),
    #[error("ロック取得がタイムアウトしました: {name} ({timeout:?})")]
    AcquireTimeout { name: String, timeout: Duration },
    #[error("リースが失われました: {0}")]
    LeaseLost(String),
    #[error("既にロック済みです: {0}")]
    AlreadyHeld(String),
    #[error("設定が不正です: {0}")]
    InvalidConfig(String),
}

impl LockError {
    /// 呼び出し側が新しい期限で再試行してよいエラーかどうか。
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::AcquireTimeout { .. })
    }
}
