use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const HMAC_SIZE: usize = 32;

/// HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; HMAC_SIZE]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time check of `expected` against HMAC-SHA256(key, message).
pub fn verify_hmac_sha256(key: &[u8], message: &[u8], expected: &[u8]) -> Result<bool> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(message);
    Ok(mac.verify_slice(expected).is_ok())
}

/// One-way digest of an operator-entered password (lowercase hex SHA-256).
///
/// Only this digest is ever used as key material; neither it nor the
/// password is sent to the peer.
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}
