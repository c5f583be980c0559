//! Database connector reached through an SSH tunnel.
//!
//! Construction follows a fixed order and stops at the first failure:
//!
//! 1. Load the credentials file.
//! 2. Validate `SERVER` / `PORT`, the database address as seen from the SSH host.
//! 3. Read `SSH_HOST`, `SSH_USERNAME`, `SSH_PKEY` and the optional `SSH_PORT`.
//! 4. Load the one configured private key. The agent is left out of the
//!    auth chain unless `disable_agent` is turned off.
//! 5. Start the tunnel on an ephemeral loopback port.
//! 6. Point a [`DatabaseConnector`] at `127.0.0.1:<local port>`.
//!
//! Steps 1-4 never touch the network. If step 5 fails the tunnel has already
//! released its session and listener when the error is returned.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::db::auth::{AuthChain, KeyAuth};
use crate::db::config::{
    Credentials, DEFAULT_CREDENTIAL_FILE, DEFAULT_SSH_PORT, PORT, SERVER, SSH_HOST, SSH_PKEY,
    SSH_PORT, SSH_USERNAME, get_credentials,
};
use crate::db::connector::{DatabaseConnector, DbSettings};
use crate::db::error::Result;
use crate::db::forward::LOCAL_BIND_HOST;
use crate::db::ops::DataOps;
use crate::db::tunnel::{SshTunnel, TunnelConfig, TunnelState};

/// Caller-side settings for [`SshDatabaseConnector`].
#[derive(Clone)]
pub struct TunnelOptions {
    /// SSH port used when the credentials file has no `SSH_PORT`.
    pub ssh_port: u16,
    /// Decrypts `SSH_PKEY` when it is encrypted. Never read from the file.
    pub ssh_key_passphrase: Option<String>,
    pub db_credential_file: String,
    /// Directory holding `db_credential_file`.
    pub path: PathBuf,
    /// Keep the SSH agent out of authentication.
    pub disable_agent: bool,
    /// Overrides `SSH_CONNECT_TIMEOUT`.
    pub connect_timeout: Option<Duration>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            ssh_port: DEFAULT_SSH_PORT,
            ssh_key_passphrase: None,
            db_credential_file: DEFAULT_CREDENTIAL_FILE.to_string(),
            path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            disable_agent: true,
            connect_timeout: None,
        }
    }
}

impl TunnelOptions {
    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.ssh_key_passphrase = Some(passphrase.into());
        self
    }

    pub fn with_credential_file(mut self, filename: impl Into<String>) -> Self {
        self.db_credential_file = filename.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_agent(mut self, enabled: bool) -> Self {
        self.disable_agent = !enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for TunnelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelOptions")
            .field("ssh_port", &self.ssh_port)
            .field(
                "ssh_key_passphrase",
                &self.ssh_key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("db_credential_file", &self.db_credential_file)
            .field("path", &self.path)
            .field("disable_agent", &self.disable_agent)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Everything construction derives from the credentials before going online.
#[derive(Debug)]
pub(crate) struct TunnelPlan {
    pub tunnel: TunnelConfig,
    pub key_path: String,
    pub database: DbSettings,
}

impl TunnelPlan {
    pub(crate) fn from_credentials(
        credentials: &Credentials,
        options: &TunnelOptions,
    ) -> Result<Self> {
        credentials.require_all(&[SERVER, PORT])?;
        let remote_host = credentials.require(SERVER)?;
        let remote_port = credentials.port(PORT)?;

        credentials.require_all(&[SSH_HOST, SSH_USERNAME, SSH_PKEY])?;
        let ssh_port = match credentials.non_empty(SSH_PORT) {
            Some(_) => credentials.port(SSH_PORT)?,
            None => options.ssh_port,
        };

        let database = DbSettings::from_credentials(credentials)?;

        let mut tunnel = TunnelConfig::new(
            credentials.require(SSH_HOST)?,
            credentials.require(SSH_USERNAME)?,
            remote_host,
            remote_port,
        )
        .with_ssh_port(ssh_port);
        if let Some(timeout) = options.connect_timeout {
            tunnel = tunnel.with_connect_timeout(timeout);
        }

        Ok(Self {
            tunnel,
            key_path: credentials.require(SSH_PKEY)?.to_string(),
            database,
        })
    }
}

/// A [`DatabaseConnector`] whose traffic runs through an [`SshTunnel`].
///
/// Call [`close`](Self::close) (or use [`scoped`](Self::scoped)) to release
/// the tunnel deterministically. Dropping an open connector only cancels
/// the forwarder in the background.
#[must_use = "an open connector holds an SSH tunnel; call close() when done"]
pub struct SshDatabaseConnector {
    tunnel: SshTunnel,
    db: DatabaseConnector,
    server: String,
}

impl SshDatabaseConnector {
    /// Load `options.path/options.db_credential_file`, open the tunnel and
    /// point a database connector through it.
    pub async fn connect(options: TunnelOptions) -> Result<Self> {
        let credentials = get_credentials(&options.path, &options.db_credential_file)?;
        Self::from_credentials(&credentials, &options).await
    }

    pub async fn from_credentials(
        credentials: &Credentials,
        options: &TunnelOptions,
    ) -> Result<Self> {
        let plan = TunnelPlan::from_credentials(credentials, options)?;

        let key = KeyAuth::load(&plan.key_path, options.ssh_key_passphrase.as_deref())?;
        let auth = AuthChain::for_tunnel(key, options.disable_agent);

        let server = plan.tunnel.remote_host.clone();
        let mut tunnel = SshTunnel::new(plan.tunnel, auth);
        let local_port = tunnel.start().await?;

        let mut db = DatabaseConnector::from_settings(plan.database);
        db.redirect(LOCAL_BIND_HOST, local_port);

        info!(
            "Database {} reachable through {}:{}",
            server, LOCAL_BIND_HOST, local_port
        );

        Ok(Self { tunnel, db, server })
    }

    /// The connector all operations are delegated to.
    pub fn db(&self) -> &DatabaseConnector {
        &self.db
    }

    pub fn tunnel(&self) -> &SshTunnel {
        &self.tunnel
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.tunnel.state()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.tunnel.local_port()
    }

    /// `SERVER` from the credentials file, i.e. the tunnel's forwarding target.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Close the engine and stop the tunnel. Never fails and may be called
    /// any number of times.
    pub async fn close(&mut self) {
        if self.tunnel.state() == TunnelState::Stopped {
            debug!("Tunnel connector for {} already closed", self.server);
            return;
        }
        self.db.close().await;
        self.tunnel.stop().await;
    }

    /// Run `f` against the connector, then close it whatever `f` returned.
    ///
    /// ```ignore
    /// let frame = connector
    ///     .scoped(|db| Box::pin(async move { db.get_data("SELECT 1").await }))
    ///     .await?;
    /// ```
    pub async fn scoped<T, F>(mut self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a SshDatabaseConnector) -> BoxFuture<'a, Result<T>>,
    {
        let result = f(&self).await;
        self.close().await;
        result
    }
}

impl DataOps for SshDatabaseConnector {
    fn pool(&self) -> &PgPool {
        self.db.pool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::{NAME_DATABASE, NAME_USER, PASSWORD_USER};
    use crate::db::error::Error;

    fn credentials(overrides: &[(&str, &str)], without: &[&str]) -> Credentials {
        let key = format!("{}/tests/fixtures/id_ed25519", env!("CARGO_MANIFEST_DIR"));
        let mut fields = vec![
            (SERVER.to_string(), "db.internal".to_string()),
            (PORT.to_string(), "5432".to_string()),
            (NAME_DATABASE.to_string(), "shop".to_string()),
            (NAME_USER.to_string(), "svc".to_string()),
            (PASSWORD_USER.to_string(), "s3cret".to_string()),
            (SSH_HOST.to_string(), "bastion.example.com".to_string()),
            (SSH_USERNAME.to_string(), "svc".to_string()),
            (SSH_PKEY.to_string(), key),
        ];
        fields.retain(|(k, _)| !without.contains(&k.as_str()));
        for (k, v) in overrides {
            fields.retain(|(existing, _)| existing != k);
            fields.push((k.to_string(), v.to_string()));
        }
        fields.into_iter().collect()
    }

    mod plan {
        use super::*;

        #[test]
        fn test_plan_targets_remote_database() {
            let plan =
                TunnelPlan::from_credentials(&credentials(&[], &[]), &TunnelOptions::default())
                    .unwrap();
            assert_eq!(plan.tunnel.ssh_endpoint(), "bastion.example.com:22");
            assert_eq!(plan.tunnel.target(), "db.internal:5432");
            assert_eq!(plan.tunnel.local_port, 0);
            assert_eq!(plan.database.database, "shop");
        }

        #[test]
        fn test_ssh_port_option_is_fallback() {
            let options = TunnelOptions::default().with_ssh_port(2222);
            let plan = TunnelPlan::from_credentials(&credentials(&[], &[]), &options).unwrap();
            assert_eq!(plan.tunnel.ssh_port, 2222);
        }

        #[test]
        fn test_ssh_port_from_file_wins() {
            let options = TunnelOptions::default().with_ssh_port(2222);
            let creds = credentials(&[(SSH_PORT, "2200")], &[]);
            let plan = TunnelPlan::from_credentials(&creds, &options).unwrap();
            assert_eq!(plan.tunnel.ssh_port, 2200);
        }

        #[test]
        fn test_invalid_ssh_port_is_configuration_error() {
            let creds = credentials(&[(SSH_PORT, "ssh")], &[]);
            let err = TunnelPlan::from_credentials(&creds, &TunnelOptions::default()).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)));
            assert!(err.to_string().contains("SSH_PORT"));
        }

        #[test]
        fn test_missing_ssh_fields_are_named() {
            let creds = credentials(&[], &[SSH_HOST, SSH_PKEY]);
            let err = TunnelPlan::from_credentials(&creds, &TunnelOptions::default()).unwrap_err();
            assert!(err.to_string().contains("SSH_HOST, SSH_PKEY"));
        }
    }

    mod construction {
        use super::*;

        #[tokio::test]
        async fn test_missing_server_fails_before_network() {
            let creds = credentials(&[], &[SERVER]);
            let err = SshDatabaseConnector::from_credentials(&creds, &TunnelOptions::default())
                .await
                .err()
                .unwrap();
            assert!(matches!(err, Error::Configuration(_)));
            assert!(err.to_string().contains("SERVER"));
        }

        #[tokio::test]
        async fn test_missing_port_fails_before_network() {
            let creds = credentials(&[], &[PORT]);
            let err = SshDatabaseConnector::from_credentials(&creds, &TunnelOptions::default())
                .await
                .err()
                .unwrap();
            assert!(matches!(err, Error::Configuration(_)));
            assert!(err.to_string().contains("PORT"));
        }

        #[tokio::test]
        async fn test_non_numeric_port_fails_before_network() {
            let creds = credentials(&[(PORT, "postgres")], &[]);
            let err = SshDatabaseConnector::from_credentials(&creds, &TunnelOptions::default())
                .await
                .err()
                .unwrap();
            assert!(matches!(err, Error::Configuration(_)));
            assert!(err.to_string().contains("\"postgres\""));
        }

        #[tokio::test]
        async fn test_unreadable_key_is_authentication_error() {
            let creds = credentials(&[(SSH_PKEY, "/nonexistent/pgtunnel/key")], &[]);
            let err = SshDatabaseConnector::from_credentials(&creds, &TunnelOptions::default())
                .await
                .err()
                .unwrap();
            assert!(matches!(err, Error::Authentication(_)));
        }

        #[tokio::test]
        async fn test_missing_credentials_file() {
            let dir = tempfile::tempdir().unwrap();
            let options = TunnelOptions::default().with_path(dir.path());
            let err = SshDatabaseConnector::connect(options).await.err().unwrap();
            assert!(matches!(err, Error::Configuration(_)));
        }
    }

    #[test]
    fn test_options_defaults() {
        let options = TunnelOptions::default();
        assert_eq!(options.ssh_port, 22);
        assert_eq!(options.db_credential_file, ".env");
        assert!(options.disable_agent);
        assert!(options.ssh_key_passphrase.is_none());
    }

    #[test]
    fn test_options_debug_redacts_passphrase() {
        let options = TunnelOptions::default().with_passphrase("hunter2");
        let debug = format!("{:?}", options);
        assert!(!debug.contains("hunter2"));
    }
}
