//! SSH agent authentication.
//!
//! Only part of the chain when a caller turns `disable_agent` off. The
//! configured key is always tried first.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use russh::client;
use russh::keys::HashAlg;
use russh::keys::agent::client::AgentClient;
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::db::session::SshClientHandler;

use super::traits::AuthStrategy;

const AUTH_SOCK_ENV_VAR: &str = "SSH_AUTH_SOCK";

/// Offers every identity held by an SSH agent until the server accepts one.
pub struct AgentAuth {
    /// `None` reads `SSH_AUTH_SOCK` when authenticating.
    socket: Option<PathBuf>,
}

impl AgentAuth {
    /// Agent found through `SSH_AUTH_SOCK`.
    pub fn from_env() -> Self {
        Self { socket: None }
    }

    /// Agent listening on an explicit socket path.
    pub fn at(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    pub fn socket(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    async fn connect(&self) -> Result<AgentClient<UnixStream>, String> {
        let socket = match &self.socket {
            Some(path) => path.clone(),
            None => std::env::var_os(AUTH_SOCK_ENV_VAR)
                .map(PathBuf::from)
                .ok_or_else(|| format!("{} not set", AUTH_SOCK_ENV_VAR))?,
        };
        AgentClient::connect_uds(&socket)
            .await
            .map_err(|e| format!("cannot reach agent at {}: {}", socket.display(), e))
    }
}

impl Default for AgentAuth {
    fn default() -> Self {
        Self::from_env()
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = self.connect().await?;
        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("agent refused to list identities: {}", e))?;
        if identities.is_empty() {
            return Err("agent holds no identities".to_string());
        }

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        for identity in identities {
            let fingerprint = identity.fingerprint(HashAlg::Sha256);
            match handle
                .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    info!("Authenticated with agent identity {}", fingerprint);
                    return Ok(true);
                }
                Ok(_) => debug!("Agent identity {} not accepted", fingerprint),
                Err(e) => debug!("Agent identity {} failed to sign: {}", fingerprint, e),
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_auth_name() {
        assert_eq!(AgentAuth::from_env().name(), "agent");
    }

    #[test]
    fn test_socket_path() {
        assert!(AgentAuth::default().socket().is_none());
        let agent = AgentAuth::at("/run/user/1000/agent.sock");
        assert_eq!(agent.socket(), Some(Path::new("/run/user/1000/agent.sock")));
    }

    #[tokio::test]
    async fn test_missing_socket_is_reported() {
        let agent = AgentAuth::at("/nonexistent/pgtunnel/agent.sock");
        let err = agent.connect().await.err().unwrap();
        assert!(err.contains("/nonexistent/pgtunnel/agent.sock"));
    }
}
