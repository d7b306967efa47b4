//! k1s0-lease-lock: 共有 KVS 上のリースによる分散ロック。
//!
//! アトミックな「存在しなければ作成（TTL 付き）」で取得し、バックグラウンドの
//! 更新タスクがトークン一致時のみ TTL を延長し、解放はトークン一致時のみ削除する。
//! クラッシュしたホルダーのリースは TTL で自然に失効する。

pub mod config;
pub mod error;
pub mod lease;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod renewer;
pub mod store;
pub mod token;

pub use config::LeaseLockConfig;
pub use error::LockError;
pub use lease::{LeaseLock, ReleaseOutcome};
pub use memory::InMemoryLeaseStore;
pub use renewer::LeaseStatus;
pub use store::LeaseStore;
pub use token::generate_token;
#[cfg(feature = "redis")]
pub use self::redis::RedisLeaseStore;

#[cfg(feature = "mock")]
pub use store::MockLeaseStore;
