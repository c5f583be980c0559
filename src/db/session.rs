//! russh client handler used by the tunnel's SSH session.
//!
//! The handler accepts every server host key (similar to
//! `StrictHostKeyChecking=no` in OpenSSH). Host key pinning against
//! known_hosts is not implemented.

use russh::{client, keys};
use tracing::debug;

pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting SSH host key ({})",
            server_public_key.algorithm().as_str()
        );
        Ok(true)
    }
}
