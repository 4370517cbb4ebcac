//! Tagnet peer process: threaded TCP server, LAN discovery and remote invocation on top of
//! the protocol core.

pub mod builtins;
pub mod config;
pub mod connect;
pub mod discovery;
pub mod peer;
mod server;
pub mod transport;

pub use config::Config;
pub use connect::Connection;
pub use discovery::{DiscoveryResult, Subnet};
pub use peer::{PeerBuilder, PeerError, PeerProcess, PeerQuery, RequestError};
