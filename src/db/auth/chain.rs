//! Authentication chain for trying multiple strategies.

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::db::session::SshClientHandler;

use super::traits::AuthStrategy;
use super::{AgentAuth, KeyAuth};

/// Authentication chain that tries strategies in the order they were added.
///
/// The first successful authentication stops the chain.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build the chain used by the tunnel: the loaded key, then the agent
    /// unless `disable_agent` is set.
    pub fn for_tunnel(key: KeyAuth, disable_agent: bool) -> Self {
        let chain = Self::new().with_key(key);
        if disable_agent {
            chain
        } else {
            chain.with_agent()
        }
    }

    pub fn with_key(mut self, key: KeyAuth) -> Self {
        self.strategies.push(Box::new(key));
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.strategies.push(Box::new(AgentAuth::from_env()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Strategy names in the order they will be tried.
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    /// Try each strategy in turn. When none succeeds the error lists every
    /// strategy's outcome, e.g. `key: rejected by server; agent: SSH_AUTH_SOCK not set`.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("no authentication method configured".to_string());
        }

        let mut outcomes = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            let outcome = match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authenticated {} with {}", username, strategy.name());
                    return Ok(true);
                }
                Ok(false) => "rejected by server".to_string(),
                Err(e) => e,
            };
            debug!("{} authentication for {} failed: {}", strategy.name(), username, outcome);
            outcomes.push(format!("{}: {}", strategy.name(), outcome));
        }

        Err(format!("authentication failed ({})", outcomes.join("; ")))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
