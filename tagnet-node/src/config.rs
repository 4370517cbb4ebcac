//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::discovery::{Subnet, SubnetError};

/// Peer configuration. File: ~/.config/tagnet/config.toml or /etc/tagnet/config.toml.
/// Env overrides: NET_THREAD_LIMIT, NET_HOST, NET_BIND, NET_SUBNET, NET_SUBNET_MASK, NET_PORT,
/// NET_PORT_RANGE, NET_GROUP, NET_IS_HUB, NET_PROBE_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery worker threads (default 5).
    #[serde(default = "default_thread_limit")]
    pub thread_limit: usize,
    /// Host advertised in this peer's identity (default: LAN address, else 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Subnet swept by discovery (default: advertised host with the last octet zeroed).
    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Addr,
    /// Subnet prefix length (default 25).
    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: u8,
    /// First port tried when binding and probed by discovery (default 3010).
    #[serde(default = "default_port_start")]
    pub port_start: u16,
    /// Number of ports after `port_start` (default 10).
    #[serde(default = "default_port_range")]
    pub port_range: u16,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub hub: bool,
    /// Per-probe timeout during discovery, milliseconds (default 50).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_thread_limit() -> usize {
    5
}
fn default_host() -> String {
    local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST).to_string()
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_subnet() -> Ipv4Addr {
    let [a, b, c, _] = local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST).octets();
    Ipv4Addr::new(a, b, c, 0)
}
fn default_subnet_mask() -> u8 {
    25
}
fn default_port_start() -> u16 {
    3010
}
fn default_port_range() -> u16 {
    10
}
fn default_group() -> String {
    "default".to_string()
}
fn default_probe_timeout_ms() -> u64 {
    50
}

/// Address of the interface that routes outward. UDP connect sends nothing.
fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_limit: default_thread_limit(),
            host: default_host(),
            bind: default_bind(),
            subnet: default_subnet(),
            subnet_mask: default_subnet_mask(),
            port_start: default_port_start(),
            port_range: default_port_range(),
            group: default_group(),
            hub: false,
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Config {
    /// Ports tried when binding and probed during discovery: `port_start .. port_start + port_range`.
    pub fn ports(&self) -> Range<u16> {
        self.port_start..self.port_start.saturating_add(self.port_range)
    }

    pub fn subnet(&self) -> Result<Subnet, SubnetError> {
        Subnet::new(self.subnet, self.subnet_mask)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Load one specific config file. Environment overrides are not applied.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply `NET_*` overrides read through `lookup`. Values that fail to parse are logged and skipped.
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = parsed(&lookup, "NET_THREAD_LIMIT") {
        c.thread_limit = v;
    }
    if let Some(v) = lookup("NET_HOST") {
        c.host = v;
    }
    if let Some(v) = lookup("NET_BIND") {
        c.bind = v;
    }
    if let Some(v) = parsed(&lookup, "NET_SUBNET") {
        c.subnet = v;
    }
    if let Some(v) = parsed(&lookup, "NET_SUBNET_MASK") {
        c.subnet_mask = v;
    }
    if let Some(v) = parsed(&lookup, "NET_PORT") {
        c.port_start = v;
    }
    if let Some(v) = parsed(&lookup, "NET_PORT_RANGE") {
        c.port_range = v;
    }
    if let Some(v) = lookup("NET_GROUP") {
        c.group = v;
    }
    // Presence marks a hub; "0" and "false" opt back out.
    if let Some(v) = lookup("NET_IS_HUB") {
        let v = v.trim();
        c.hub = !(v == "0" || v.eq_ignore_ascii_case("false"));
    }
    if let Some(v) = parsed(&lookup, "NET_PROBE_TIMEOUT_MS") {
        c.probe_timeout_ms = v;
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tagnet/config.toml"));
    }
    out.push(PathBuf::from("/etc/tagnet/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match load_from(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring config file");
            None
        }
    }
}
