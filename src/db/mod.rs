//! PostgreSQL connectors, optionally reached through an SSH tunnel.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Credential files and runtime settings with environment overrides
//! - `error`: Error taxonomy shared by every operation
//! - `connector`: Direct connector built from the database credential fields
//! - `ops`: Database operations provided to every connector
//! - `frame`: Tabular results and rows to write
//! - `auth`: SSH authentication strategies
//! - `client`: SSH connection and authentication logic
//! - `forward`: Local port forwarding over `direct-tcpip` channels
//! - `tunnel`: Tunnel lifecycle (unstarted, active, stopped)
//! - `ssh_connector`: Connector whose traffic runs through a tunnel

pub mod auth;
pub(crate) mod client;
pub mod config;
pub mod connector;
pub mod error;
pub(crate) mod forward;
pub mod frame;
pub mod hash;
pub mod ops;
pub mod session;
pub mod ssh_connector;
pub mod tunnel;

pub use config::{Credentials, get_credentials};
pub use connector::{DatabaseConnector, DbSettings};
pub use error::{Error, Result};
pub use forward::LOCAL_BIND_HOST;
pub use frame::{DataFrame, FrameColumn, SqlType, Value};
pub use hash::hash_value;
pub use ops::{DataOps, IfExists};
pub use ssh_connector::{SshDatabaseConnector, TunnelOptions};
pub use tunnel::{SshTunnel, TunnelConfig, TunnelState};
