use async_trait::async_trait;
use russh::client;

use crate::db::session::SshClientHandler;

/// One way of proving identity to the SSH host.
///
/// `Ok(false)` means the server declined the credentials; `Err` means the
/// strategy could not even make an attempt (unreachable agent, signing
/// failure). [`AuthChain`](super::AuthChain) reports both per strategy.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Short label used in logs and failure messages.
    fn name(&self) -> &'static str;
}
