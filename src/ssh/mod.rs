pub mod allowlist;
pub mod client;
pub mod connection;
pub mod error;
pub mod pool;
pub mod state_machine;
pub mod trust_store;

pub use client::ClientHandler;
pub use error::SshError;
pub use pool::{PoolConfig, SshPool};
pub use state_machine::{ConnectionEvent, ConnectionEventKind, ConnectionState};
