use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::LockError;

/// LeaseLockConfig はリースロックの取得・更新の挙動を表す。
///
/// YAML や JSON から serde でデシリアライズ可能。省略したフィールドはデフォルト値になる。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseLockConfig {
    /// 取得失敗時の再試行間隔（ミリ秒）
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// リース期間に対する更新周期の割合
    #[serde(default = "default_renew_ratio")]
    pub renew_ratio: f64,
    /// トークンの乱数バイト数（base64 エンコード前）
    #[serde(default = "default_token_bytes")]
    pub token_bytes: usize,
    /// 取得後にバックグラウンド更新を開始するかどうか
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
}

fn default_retry_interval_ms() -> u64 {
    100
}

fn default_renew_ratio() -> f64 {
    0.9
}

fn default_token_bytes() -> usize {
    32
}

fn default_auto_renew() -> bool {
    true
}

/// `Duration` をミリ秒に変換する。`u64` に収まらない値は `u64::MAX` に丸める。
pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for LeaseLockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            renew_ratio: default_renew_ratio(),
            token_bytes: default_token_bytes(),
            auto_renew: default_auto_renew(),
        }
    }
}

impl LeaseLockConfig {
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = duration_millis(interval);
        self
    }

    pub fn with_renew_ratio(mut self, ratio: f64) -> Self {
        self.renew_ratio = ratio;
        self
    }

    pub fn with_token_bytes(mut self, bytes: usize) -> Self {
        self.token_bytes = bytes;
        self
    }

    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// リース期間から更新周期を求める。
    pub fn renew_period(&self, lease_duration: Duration) -> Duration {
        lease_duration.mul_f64(self.renew_ratio)
    }

    pub fn validate(&self) -> Result<(), LockError> {
        if self.retry_interval_ms == 0 {
            return Err(LockError::InvalidConfig(
                "retry_interval_ms は 1 以上である必要があります".to_string(),
            ));
        }
        if !(self.renew_ratio > 0.0 && self.renew_ratio < 1.0) {
            return Err(LockError::InvalidConfig(format!(
                "renew_ratio は 0 より大きく 1 未満である必要があります: {}",
                self.renew_ratio
            )));
        }
        if self.token_bytes == 0 {
            return Err(LockError::InvalidConfig(
                "token_bytes は 1 以上である必要があります".to_string(),
            ));
        }
        Ok(())
    }
}
