use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand_core::{OsRng, RngCore};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use sha2::Sha256;

use crate::error::{CryptoError, Result};

pub use rsa::RsaPublicKey;

/// RSA modulus size for handshake keypairs.
pub const RSA_KEY_BITS: usize = 2048;

/// Size of the nonce each side contributes to key derivation.
pub const NONCE_SIZE: usize = 32;

/// Size of the pre-master secret contributed by the initiator.
pub const PRE_MASTER_SECRET_SIZE: usize = 48;

/// Fill a fresh buffer with `len` bytes from the OS CSPRNG.
pub fn secure_random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Ephemeral RSA keypair, generated once per handshake.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    /// Generate a new 2048-bit keypair.
    pub fn generate() -> Result<Self> {
        Self::generate_with_bits(RSA_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Base64 of the DER-encoded SubjectPublicKeyInfo.
    pub fn public_key_base64(&self) -> Result<String> {
        public_key_to_base64(&self.public)
    }

    /// PKCS#1 v1.5 decryption with the private half.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.private.decrypt(Pkcs1v15Encrypt, ciphertext)?)
    }

    /// SHA256withRSA signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(self.private.clone());
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| CryptoError::Signature(e.to_string()))?;
        Ok(signature.to_vec())
    }
}

/// Encode a public key for transport inside a handshake payload.
pub fn public_key_to_base64(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

/// Decode a public key received from the peer.
pub fn public_key_from_base64(encoded: &str) -> Result<RsaPublicKey> {
    let der = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// PKCS#1 v1.5 encryption of a short secret to the peer's public key.
pub fn rsa_encrypt(data: &[u8], key: &RsaPublicKey) -> Result<Vec<u8>> {
    Ok(key.encrypt(&mut OsRng, Pkcs1v15Encrypt, data)?)
}

/// Verify a SHA256withRSA signature. Malformed signatures verify as false.
pub fn rsa_verify(data: &[u8], signature: &[u8], key: &RsaPublicKey) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(data, &signature)
        .is_ok()
}
