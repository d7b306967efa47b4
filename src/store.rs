use async_trait::async_trait;
use std::time::Duration;

use crate::LockError;

/// リースロックが前提とするストアのアトミック操作。
///
/// 各メソッドはストア側で不可分に実行されなければならない。
/// 「存在確認してから書く」「読んでから消す」のような 2 往復の実装は不可。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// キーが存在しない場合のみ `token` を値、`ttl` を有効期限として作成する。
    /// 作成できたら `true`、既に存在していれば `false`。
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// 現在の値が `token` と一致する場合のみキーを削除する。
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// 現在の値が `token` と一致する場合のみ有効期限を `ttl` に再設定する。
    async fn compare_and_renew(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    async fn exists(&self, key: &str) -> Result<bool, LockError>;
}
