//! Private key file SSH authentication.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::db::error::{Error, Result};
use crate::db::session::SshClientHandler;

use super::traits::AuthStrategy;

/// Private key authentication strategy.
///
/// The key is read and decrypted when the strategy is built, so a bad path or
/// passphrase surfaces as [`Error::Authentication`] before any network call.
pub struct KeyAuth {
    key_path: PathBuf,
    key: Arc<keys::PrivateKey>,
}

impl KeyAuth {
    /// Load the private key at `key_path` (a leading `~` is expanded).
    ///
    /// `passphrase` is only consulted when the key file is encrypted.
    pub fn load(key_path: &str, passphrase: Option<&str>) -> Result<Self> {
        let key_path = expand_home(key_path);

        let key = keys::load_secret_key(&key_path, passphrase).map_err(|e| {
            Error::Authentication(format!(
                "failed to load private key from {}: {}",
                key_path.display(),
                e
            ))
        })?;

        debug!(
            "Loaded {} private key from {}",
            key.algorithm().as_str(),
            key_path.display()
        );

        Ok(Self {
            key_path,
            key: Arc::new(key),
        })
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> std::result::Result<bool, String> {
        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

/// Expand a leading `~` to the current user's home directory.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}
