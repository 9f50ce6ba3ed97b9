/// Password digest persisted in a small file next to the binary's data.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use peersync_crypto::password_digest;
use peersync_transfer::CredentialStore;

/// File-backed credential. Invalidation blanks the file so the next run
/// needs a fresh password.
pub struct FileCredential {
    path: PathBuf,
    digest: Mutex<Option<String>>,
}

impl FileCredential {
    /// Load the stored digest, or replace it when `password` is given.
    pub fn open(path: &Path, password: Option<&str>) -> anyhow::Result<Self> {
        let digest = match password {
            Some(password) => {
                let digest = password_digest(password);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("cannot create {}", parent.display()))?;
                }
                fs::write(path, &digest)
                    .with_context(|| format!("cannot write credential file {}", path.display()))?;
                Some(digest)
            }
            None => match fs::read_to_string(path) {
                Ok(text) => Some(text.trim().to_string()).filter(|d| !d.is_empty()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("cannot read credential file {}", path.display()));
                }
            },
        };
        Ok(Self { path: path.to_path_buf(), digest: Mutex::new(digest) })
    }
}

impl CredentialStore for FileCredential {
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
        if let Err(e) = fs::write(&self.path, "") {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to clear credential file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file() -> PathBuf {
        std::env::temp_dir()
            .join(format!("peersync_cred_{}", uuid::Uuid::new_v4()))
            .join("credential")
    }

    #[test]
    fn password_is_persisted_and_reloaded() {
        let path = temp_file();
        let store = FileCredential::open(&path, Some("hunter2")).unwrap();
        assert_eq!(store.local_digest(), Some(password_digest("hunter2")));

        let reloaded = FileCredential::open(&path, None).unwrap();
        assert_eq!(reloaded.local_digest(), Some(password_digest("hunter2")));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn invalidate_blanks_file() {
        let path = temp_file();
        let store = FileCredential::open(&path, Some("hunter2")).unwrap();
        store.invalidate();
        assert_eq!(store.local_digest(), None);
        assert_eq!(fs::read_to_string(&path).unwrap(), "");

        let reloaded = FileCredential::open(&path, None).unwrap();
        assert_eq!(reloaded.local_digest(), None);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_means_no_password() {
        let store = FileCredential::open(&temp_file(), None).unwrap();
        assert_eq!(store.local_digest(), None);
    }
}
