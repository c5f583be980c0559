//! Direct PostgreSQL connector.
//!
//! Builds its engine (a lazily connecting `PgPool`) from the five database
//! fields of a credentials file. The engine can be re-pointed at another
//! host/port, which is how the tunneled connector routes traffic through its
//! local forwarding port.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{debug, info};

use crate::db::config::{
    Credentials, DATABASE_KEYS, NAME_DATABASE, NAME_USER, PASSWORD_USER, PORT, SERVER,
    get_credentials, resolve_acquire_timeout, resolve_pool_max_connections,
};
use crate::db::error::Result;
use crate::db::ops::DataOps;

/// Everything needed to reach one database.
#[derive(Clone, PartialEq, Eq)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl DbSettings {
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        credentials.require_all(DATABASE_KEYS)?;
        Ok(Self {
            host: credentials.require(SERVER)?.to_string(),
            port: credentials.port(PORT)?,
            database: credentials.require(NAME_DATABASE)?.to_string(),
            user: credentials.require(NAME_USER)?.to_string(),
            password: credentials.require(PASSWORD_USER)?.to_string(),
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
    }
}

impl fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Connector that talks to the database at the address in its settings.
///
/// Building or redirecting the engine opens no connection and needs no
/// runtime; connections are made by the first operation and kept until
/// [`close`](Self::close) or the next redirect.
pub struct DatabaseConnector {
    settings: DbSettings,
    pool: PgPool,
}

impl DatabaseConnector {
    /// Load `dir/filename` and build an engine for the database it names.
    pub fn new(dir: impl AsRef<Path>, filename: &str) -> Result<Self> {
        let credentials = get_credentials(dir, filename)?;
        Self::from_credentials(&credentials)
    }

    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        Ok(Self::from_settings(DbSettings::from_credentials(credentials)?))
    }

    pub fn from_settings(settings: DbSettings) -> Self {
        let pool = build_engine(&settings);
        Self { settings, pool }
    }

    pub fn settings(&self) -> &DbSettings {
        &self.settings
    }

    pub fn host(&self) -> &str {
        &self.settings.host
    }

    pub fn port(&self) -> u16 {
        self.settings.port
    }

    /// Point the connector at `host:port` and rebuild the engine there.
    ///
    /// The previous engine is closed in the background; database name and
    /// user credentials are kept.
    pub fn redirect(&mut self, host: &str, port: u16) {
        debug!(
            "Redirecting database connector from {}:{} to {}:{}",
            self.settings.host, self.settings.port, host, port
        );
        self.settings.host = host.to_string();
        self.settings.port = port;
        self.reconnect_engine();
    }

    /// Replace the engine with one built from the current settings.
    ///
    /// Inside a runtime the previous engine is closed in the background;
    /// otherwise it is simply dropped.
    pub fn reconnect_engine(&mut self) {
        let previous = std::mem::replace(&mut self.pool, build_engine(&self.settings));
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                previous.close().await;
            });
        }
    }

    /// Close every engine connection. Later operations fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(
            "Database engine for {}:{} closed",
            self.settings.host, self.settings.port
        );
    }
}

impl DataOps for DatabaseConnector {
    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Lazy pool without idle reaping, so no maintenance task is spawned.
fn build_engine(settings: &DbSettings) -> PgPool {
    PgPoolOptions::new()
        .max_connections(resolve_pool_max_connections(None))
        .min_connections(0)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .acquire_timeout(Duration::from_secs(resolve_acquire_timeout(None)))
        .connect_lazy_with(settings.connect_options())
}
