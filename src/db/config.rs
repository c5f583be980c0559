//! Credential loading and runtime configuration.
//!
//! Credentials come from a dotenv-style file located by directory + filename.
//! Values are kept as strings; callers coerce what they need.
//!
//! Runtime knobs use a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | SSH connection timeout in seconds |
//! | `SSH_KEEPALIVE_INTERVAL` | 30s | SSH keepalive interval in seconds |
//! | `DB_POOL_MAX_CONNECTIONS` | 5 | Engine pool size |
//! | `DB_ACQUIRE_TIMEOUT` | 5s | Engine connection acquire timeout in seconds |

use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::db::error::{Error, Result};

pub const SERVER: &str = "SERVER";
pub const PORT: &str = "PORT";
pub const NAME_DATABASE: &str = "NAME_DATABASE";
pub const NAME_USER: &str = "NAME_USER";
pub const PASSWORD_USER: &str = "PASSWORD_USER";
pub const SSH_HOST: &str = "SSH_HOST";
pub const SSH_USERNAME: &str = "SSH_USERNAME";
pub const SSH_PKEY: &str = "SSH_PKEY";
pub const SSH_PORT: &str = "SSH_PORT";

/// Fields the direct connector needs.
pub const DATABASE_KEYS: &[&str] = &[SERVER, PORT, NAME_DATABASE, NAME_USER, PASSWORD_USER];

/// Default credentials filename
pub const DEFAULT_CREDENTIAL_FILE: &str = ".env";

/// Default SSH port used when neither the caller nor the credentials file set one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default SSH keepalive interval in seconds
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Default engine pool size
pub(crate) const DEFAULT_POOL_MAX_CONNECTIONS: u32 = 5;

/// Default engine acquire timeout in seconds
pub(crate) const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const KEEPALIVE_INTERVAL_ENV_VAR: &str = "SSH_KEEPALIVE_INTERVAL";
pub(crate) const POOL_MAX_CONNECTIONS_ENV_VAR: &str = "DB_POOL_MAX_CONNECTIONS";
pub(crate) const ACQUIRE_TIMEOUT_ENV_VAR: &str = "DB_ACQUIRE_TIMEOUT";

/// Immutable mapping from credential field name to its raw string value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value for `key`, treating empty strings as absent.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.non_empty(key).ok_or_else(|| {
            Error::Configuration(format!("missing {} in credentials file", key))
        })
    }

    /// Check every key at once so the error names all of the missing ones.
    pub fn require_all(&self, keys: &[&str]) -> Result<()> {
        let missing: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|k| self.non_empty(k).is_none())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "missing {} in credentials file. Expected keys: {}",
                missing.join(", "),
                keys.join(", ")
            )))
        }
    }

    /// Parse a required port field.
    pub fn port(&self, key: &str) -> Result<u16> {
        let raw = self.require(key)?;
        raw.trim().parse::<u16>().map_err(|_| {
            Error::Configuration(format!("{} must be an integer port, got: {:?}", key, raw))
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Load `dir/filename` as a dotenv file without touching the process environment.
pub fn get_credentials(dir: impl AsRef<Path>, filename: &str) -> Result<Credentials> {
    let path = dir.as_ref().join(filename);

    // The only dotenv reader that leaves the process environment alone
    #[allow(deprecated)]
    let iter = dotenv::from_path_iter(&path).map_err(|e| {
        Error::Configuration(format!(
            "cannot read credentials file {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut values = BTreeMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| {
            Error::Configuration(format!(
                "invalid credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        values.insert(key, value);
    }

    debug!("Loaded {} credential fields from {}", values.len(), path.display());
    Ok(Credentials { values })
}

fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set
    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.parse::<T>()
    {
        return value;
    }

    // Priority 3: Default value
    default
}

/// Resolve the SSH connection timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    resolve(timeout_param, CONNECT_TIMEOUT_ENV_VAR, DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Resolve the SSH keepalive interval with priority: parameter -> env var -> default
pub(crate) fn resolve_keepalive_interval(interval_param: Option<u64>) -> u64 {
    resolve(
        interval_param,
        KEEPALIVE_INTERVAL_ENV_VAR,
        DEFAULT_KEEPALIVE_INTERVAL_SECS,
    )
}

/// Resolve the engine pool size with priority: parameter -> env var -> default
pub(crate) fn resolve_pool_max_connections(max_param: Option<u32>) -> u32 {
    resolve(
        max_param,
        POOL_MAX_CONNECTIONS_ENV_VAR,
        DEFAULT_POOL_MAX_CONNECTIONS,
    )
}

/// Resolve the engine acquire timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_acquire_timeout(timeout_param: Option<u64>) -> u64 {
    resolve(timeout_param, ACQUIRE_TIMEOUT_ENV_VAR, DEFAULT_ACQUIRE_TIMEOUT_SECS)
}
