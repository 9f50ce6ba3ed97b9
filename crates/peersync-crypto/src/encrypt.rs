use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, Result};
use crate::keys::secure_random_bytes;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size; PKCS#5 pads to a multiple of it.
pub const AES_BLOCK_SIZE: usize = 16;

/// Random IV prefixed to every ciphertext.
pub const IV_SIZE: usize = AES_BLOCK_SIZE;

/// AES-128 session key size.
pub const SESSION_KEY_SIZE: usize = 16;

pub type SessionKey = [u8; SESSION_KEY_SIZE];

/// Derive the session key: SHA-256(pre_master || nonce_a || nonce_b)[..16].
///
/// Both peers must pass the inputs in the same order (initiator nonce first).
pub fn derive_session_key(pre_master_secret: &[u8], nonce_a: &[u8], nonce_b: &[u8]) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(pre_master_secret);
    hasher.update(nonce_a);
    hasher.update(nonce_b);
    let hash = hasher.finalize();
    let mut key = [0u8; SESSION_KEY_SIZE];
    key.copy_from_slice(&hash[..SESSION_KEY_SIZE]);
    key
}

/// Size of `encrypt` output for a plaintext of `plaintext_len` bytes.
///
/// PKCS#5 always adds between 1 and 16 bytes, so a block-aligned plaintext
/// grows by a full block.
pub fn encrypted_len(plaintext_len: usize) -> usize {
    IV_SIZE + (plaintext_len / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE
}

/// Encrypt with AES-128-CBC under a fresh random IV. Returns IV + ciphertext.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let iv = secure_random_bytes(IV_SIZE);
    let cipher =
        Aes128CbcEnc::new_from_slices(key, &iv).map_err(|_| CryptoError::InvalidKeyLength)?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an IV-prefixed AES-128-CBC ciphertext produced by [`encrypt`].
pub fn decrypt(key: &SessionKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < IV_SIZE + AES_BLOCK_SIZE || (data.len() - IV_SIZE) % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidCiphertextLength(data.len()));
    }
    let (iv, ciphertext) = data.split_at(IV_SIZE);
    let cipher =
        Aes128CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)
}
