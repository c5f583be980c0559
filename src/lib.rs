pub mod db;

pub use db::{
    DataFrame, DataOps, DatabaseConnector, Error, IfExists, Result, SshDatabaseConnector,
    TunnelOptions, hash_value,
};
