#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use tagnet_node::{Config, PeerProcess};

/// Loopback-only config: `group` on `port_start .. port_start + range`, sweeping 127.0.0.1 only.
pub fn local_config(group: &str, port_start: u16, range: u16) -> Config {
    Config {
        thread_limit: 2,
        host: "127.0.0.1".to_string(),
        bind: "127.0.0.1".to_string(),
        subnet: Ipv4Addr::LOCALHOST,
        subnet_mask: 32,
        port_start,
        port_range: range,
        group: group.to_string(),
        hub: false,
        probe_timeout_ms: 200,
    }
}

/// Unguarded peer, so one test binary can run several.
pub fn test_peer(config: Config) -> Arc<PeerProcess> {
    PeerProcess::builder(config)
        .test_mode(true)
        .launch()
        .expect("launch test peer")
}
