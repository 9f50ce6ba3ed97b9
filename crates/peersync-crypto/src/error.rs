use thiserror::Error;

/// Errors raised by the crypto primitives.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key material could not be generated, encoded or parsed.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// RSA encryption or decryption failed.
    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    /// Signature could not be produced or decoded.
    #[error("Signature error: {0}")]
    Signature(String),

    /// Ciphertext is shorter than an IV plus one block, or not block aligned.
    #[error("Ciphertext has invalid length {0}")]
    InvalidCiphertextLength(usize),

    /// Padding check failed after decryption (wrong key or corrupted data).
    #[error("Decryption failed: bad padding")]
    BadPadding,

    /// A key of the wrong size was handed to a cipher or MAC.
    #[error("Invalid key length")]
    InvalidKeyLength,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
