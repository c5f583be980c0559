//! SSH session establishment for the tunnel.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: russh config with keepalive enabled and no
//!    inactivity timeout, since a tunnel may sit idle between queries.
//!
//! 2. **Connection Establishment**: TCP connection to the SSH server bounded
//!    by the connect timeout.
//!
//! 3. **Authentication**: the [`AuthChain`] built for the tunnel. If it fails
//!    the half-open session is disconnected before the error is returned.
//!
//! There is no retry loop; a failed connection is reported to the caller,
//! which must build a new tunnel to try again.

use std::sync::Arc;
use std::time::Duration;

use russh::{Disconnect, client};
use tracing::{debug, info};

use crate::db::auth::{AuthChain, AuthStrategy};
use crate::db::session::SshClientHandler;

/// Keepalives that may go unanswered before the session is considered dead
pub(crate) const KEEPALIVE_MAX: usize = 3;

/// Build russh client configuration for a long-lived tunnel session.
///
/// - No inactivity timeout
/// - Keepalive every `keepalive_interval`, at most [`KEEPALIVE_MAX`] unanswered
pub(crate) fn build_client_config(keepalive_interval: Duration) -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(keepalive_interval),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    })
}

/// Establish an SSH connection to `host:port` and authenticate as `username`.
///
/// Returns a message describing the failure; the caller attaches endpoint
/// context.
pub(crate) async fn connect_to_ssh(
    host: &str,
    port: u16,
    username: &str,
    auth_chain: &AuthChain,
    timeout: Duration,
    keepalive_interval: Duration,
) -> Result<client::Handle<SshClientHandler>, String> {
    let config = build_client_config(keepalive_interval);

    debug!("Connecting to SSH server {}:{}", host, port);
    let connect_future = client::connect(config, (host, port), SshClientHandler);

    let mut handle = tokio::time::timeout(timeout, connect_future)
        .await
        .map_err(|_| format!("Connection timed out after {:?}", timeout))?
        .map_err(|e| format!("Failed to connect: {}", e))?;

    let authenticated = match auth_chain.authenticate(&mut handle, username).await {
        Ok(true) => Ok(()),
        Ok(false) => Err("Authentication failed: no authentication methods succeeded".to_string()),
        Err(e) => Err(e),
    };

    if let Err(e) = authenticated {
        disconnect(&handle).await;
        return Err(e);
    }

    info!("SSH session established with {}@{}:{}", username, host, port);
    Ok(handle)
}

/// Best-effort disconnect; errors are logged and dropped.
pub(crate) async fn disconnect(handle: &client::Handle<SshClientHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
        .await
    {
        debug!("SSH disconnect ended with error: {}", e);
    }
}
