//! SSH tunnel lifecycle.
//!
//! A tunnel moves through `Unstarted -> Active -> Stopped`. A failed start
//! goes straight to `Stopped` after releasing whatever it acquired, and a
//! stopped tunnel can never become active again.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::auth::AuthChain;
use crate::db::client::{connect_to_ssh, disconnect};
use crate::db::config::{
    DEFAULT_SSH_PORT, resolve_connect_timeout, resolve_keepalive_interval,
};
use crate::db::error::{Error, Result};
use crate::db::forward::setup_port_forwarding;
use crate::db::session::SshClientHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Unstarted,
    Active,
    Stopped,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Unstarted => "unstarted",
            TunnelState::Active => "active",
            TunnelState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Where the tunnel connects and what it forwards to.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    /// Forwarding target as seen from the SSH host.
    pub remote_host: String,
    pub remote_port: u16,
    /// Loopback port to bind; 0 lets the OS pick one.
    pub local_port: u16,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl TunnelConfig {
    pub fn new(
        ssh_host: impl Into<String>,
        ssh_username: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_username: ssh_username.into(),
            remote_host: remote_host.into(),
            remote_port,
            local_port: 0,
            connect_timeout: Duration::from_secs(resolve_connect_timeout(None)),
            keepalive_interval: Duration::from_secs(resolve_keepalive_interval(None)),
        }
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ssh_endpoint(&self) -> String {
        format!("{}:{}", self.ssh_host, self.ssh_port)
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Owns the SSH session, the loopback listener and its forwarding tasks.
pub struct SshTunnel {
    config: TunnelConfig,
    auth: AuthChain,
    state: TunnelState,
    local_addr: Option<SocketAddr>,
    session: Option<Arc<client::Handle<SshClientHandler>>>,
    forwarder: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SshTunnel {
    pub fn new(config: TunnelConfig, auth: AuthChain) -> Self {
        Self {
            config,
            auth,
            state: TunnelState::Unstarted,
            local_addr: None,
            session: None,
            forwarder: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TunnelState::Active
    }

    /// Bound loopback address, only while active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }

    /// Connect, authenticate and start forwarding. Returns the local port.
    pub async fn start(&mut self) -> Result<u16> {
        if self.state != TunnelState::Unstarted {
            return Err(self.error(format!("tunnel is {} and cannot be started", self.state)));
        }

        let connected = connect_to_ssh(
            &self.config.ssh_host,
            self.config.ssh_port,
            &self.config.ssh_username,
            &self.auth,
            self.config.connect_timeout,
            self.config.keepalive_interval,
        )
        .await;

        let handle = match connected {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                self.state = TunnelState::Stopped;
                warn!(
                    "SSH tunnel to {} failed: {}",
                    self.config.ssh_endpoint(),
                    e
                );
                return Err(self.error(e));
            }
        };

        let forwarding = setup_port_forwarding(
            handle.clone(),
            self.config.local_port,
            &self.config.remote_host,
            self.config.remote_port,
            self.cancel.clone(),
        )
        .await;

        let (local_addr, forwarder) = match forwarding {
            Ok(bound) => bound,
            Err(e) => {
                disconnect(&handle).await;
                self.state = TunnelState::Stopped;
                return Err(self.error(e));
            }
        };

        info!(
            "SSH tunnel established: {} -> {} via {}",
            local_addr,
            self.config.target(),
            self.config.ssh_endpoint()
        );

        self.local_addr = Some(local_addr);
        self.session = Some(handle);
        self.forwarder = Some(forwarder);
        self.state = TunnelState::Active;
        Ok(local_addr.port())
    }

    /// Stop forwarding and close the session. Safe to call in any state.
    pub async fn stop(&mut self) {
        if self.state == TunnelState::Stopped {
            return;
        }

        self.cancel.cancel();

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            // Wait for the listener to be dropped before reporting stopped
            let _ = forwarder.await;
        }

        if let Some(session) = self.session.take() {
            disconnect(&session).await;
        }

        if let Some(addr) = self.local_addr.take() {
            info!("SSH tunnel on {} stopped", addr);
        }
        self.state = TunnelState::Stopped;
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::tunnel(self.config.ssh_endpoint(), self.config.target(), reason)
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if self.state != TunnelState::Active {
            return;
        }

        debug!("SSH tunnel dropped while active, releasing in background");
        self.cancel.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(session) = self.session.take()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move {
                disconnect(&session).await;
            });
        }
        self.state = TunnelState::Stopped;
    }
}
