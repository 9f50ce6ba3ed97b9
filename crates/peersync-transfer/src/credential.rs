/// Local password digest, held by each device independently.
use std::sync::Mutex;

/// Source of this device's password digest.
///
/// The digest keys the HMAC that vouches for this device's public key
/// during the handshake. After a completed sync the receiving device
/// becomes the authoritative copy and its password is invalidated.
pub trait CredentialStore: Send + Sync {
    /// Current digest, or `None` once invalidated / never set.
    fn local_digest(&self) -> Option<String>;

    /// Forget the stored digest.
    fn invalidate(&self);
}

/// In-process credential store.
pub struct MemoryCredential {
    digest: Mutex<Option<String>>,
}

impl MemoryCredential {
    pub fn new(digest: impl Into<String>) -> Self {
        Self { digest: Mutex::new(Some(digest.into())) }
    }

    /// Store whose digest is derived from a plain password.
    pub fn from_password(password: &str) -> Self {
        Self::new(peersync_crypto::password_digest(password))
    }
}

impl CredentialStore for MemoryCredential {
    fn local_digest(&self) -> Option<String> {
        match self.digest.lock() {
            Ok(digest) => digest.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn invalidate(&self) {
        match self.digest.lock() {
            Ok(mut digest) => *digest = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}
