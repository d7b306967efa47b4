use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::LockError;

/// OS のエントロピー源から `len` バイトの乱数を読み、base64 文字列のトークンを返す。
pub fn generate_token(len: usize) -> Result<String, LockError> {
    generate_token_with(&mut OsRng, len)
}

/// 任意の乱数源からトークンを生成する。
///
/// 乱数源の失敗はそのまま `LockError::Entropy` として返し、再試行しない。
pub fn generate_token_with<R: RngCore + ?Sized>(
    rng: &mut R,
    len: usize,
) -> Result<String, LockError> {
    let mut buf = vec![0u8; len];
    rng.try_fill_bytes(&mut buf)
        .map_err(|e| LockError::Entropy(e.to_string()))?;
    Ok(STANDARD.encode(&buf))
}
