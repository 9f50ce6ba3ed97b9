/// Peersync Crypto Library
///
/// Primitives used by the pairing handshake and the encrypted file stream:
/// - RSA-2048 keypairs (PKCS#1 v1.5 encryption, SHA-256 signatures)
/// - AES-128-CBC with a random IV prefixed to every ciphertext
/// - HMAC-SHA256 and the SHA-256 session key derivation
/// - OS-backed secure random bytes

pub mod encrypt;
pub mod error;
pub mod keys;
pub mod mac;

pub use encrypt::{
    decrypt, derive_session_key, encrypt, encrypted_len, SessionKey, AES_BLOCK_SIZE, IV_SIZE,
    SESSION_KEY_SIZE,
};
pub use error::{CryptoError, Result};
pub use keys::{
    public_key_from_base64, public_key_to_base64, rsa_encrypt, rsa_verify, secure_random_bytes,
    RsaKeyPair, RsaPublicKey, NONCE_SIZE, PRE_MASTER_SECRET_SIZE, RSA_KEY_BITS,
};
pub use mac::{hmac_sha256, password_digest, verify_hmac_sha256, HMAC_SIZE};
