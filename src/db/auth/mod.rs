//! Authentication strategies for the tunnel's SSH session.
//!
//! - [`KeyAuth`]: a single private key, loaded (and decrypted) up front
//! - [`AgentAuth`]: identities offered by the SSH agent at `SSH_AUTH_SOCK`
//!
//! The tunnel only ever builds a chain of the configured key, plus the agent
//! when the caller explicitly leaves `disable_agent` off.

mod agent;
mod chain;
mod key;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::KeyAuth;
pub use traits::AuthStrategy;
