//! Key pair bundle
//!
//! The fleet shares one key pair. It is read from disk once when the
//! connection manager is built and reused for every node.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::PrivateKey;
use tracing::info;

use super::error::SshError;

#[derive(Clone)]
pub struct KeyPairBundle {
    path: PathBuf,
    key: Arc<PrivateKey>,
}

impl KeyPairBundle {
    /// Load a private key, decrypting it with `passphrase` when given
    pub fn load(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self, SshError> {
        let path = path.as_ref();
        let key = russh::keys::load_secret_key(path, passphrase)
            .map_err(|e| SshError::KeyError(format!("{}: {}", path.display(), e)))?;

        info!("Loaded SSH key pair from {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            key: Arc::new(key),
        })
    }

    pub fn private_key(&self) -> Arc<PrivateKey> {
        self.key.clone()
    }
}

impl std::fmt::Debug for KeyPairBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairBundle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
