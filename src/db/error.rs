//! Error taxonomy for credential loading, tunneling and database operations.
//!
//! Errors fall into four groups:
//!
//! 1. **Configuration**: the credentials file is missing, unreadable, or lacks a
//!    required field. Raised before any network activity.
//!
//! 2. **Authentication**: the configured private key could not be read or
//!    decrypted.
//!
//! 3. **Tunnel**: the SSH host was unreachable, rejected the key, or the local
//!    listener could not be bound. Carries the SSH endpoint and the forwarding
//!    target so the caller can tell which leg failed.
//!
//! 4. **Query / Write**: failures from delegated database operations. Driver
//!    errors are wrapped without translation so the native `sqlx::Error` stays
//!    reachable through [`Error::Query`].

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid credential fields.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Private key load or decrypt failure.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Tunnel failed to start or the SSH host rejected the session.
    #[error("failed to establish SSH tunnel to {ssh} -> {target}: {reason}")]
    Tunnel {
        ssh: String,
        target: String,
        reason: String,
    },

    /// Error raised by the database driver.
    #[error(transparent)]
    Query(#[from] sqlx::Error),

    /// A write was refused before reaching the database.
    #[error("write error: {0}")]
    Write(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn tunnel(
        ssh: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Tunnel {
            ssh: ssh.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error was produced by the database driver.
    pub fn is_query(&self) -> bool {
        matches!(self, Error::Query(_))
    }
}
