//! LAN discovery: sweep a subnet and port range for live peers with a fixed pool of worker
//! threads, each owning a contiguous slice of the address list.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::ops::Range;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use serde::{Deserialize, Serialize};
use tagnet_core::{PeerId, PeerInfo, PeerToken};

/// IPv4 network given as an address and prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: u32,
    mask: u32,
    prefix: u8,
}

impl Subnet {
    pub fn new(ip: Ipv4Addr, prefix: u8) -> Result<Self, SubnetError> {
        if prefix > 32 {
            return Err(SubnetError::Prefix(prefix));
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        };
        Ok(Self {
            network: u32::from(ip) & mask,
            mask,
            prefix,
        })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// `ip & mask`.
    pub fn first(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// `(ip & mask) | !mask`.
    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network | !self.mask)
    }

    /// Number of addresses from `first()` to `last()`, both included.
    pub fn host_count(&self) -> u64 {
        u64::from(!self.mask) + 1
    }

    /// The `index`-th address of the subnet, counting from `first()`.
    pub fn nth(&self, index: u64) -> Option<Ipv4Addr> {
        if index >= self.host_count() {
            return None;
        }
        Some(Ipv4Addr::from(self.network + index as u32))
    }

    /// Every address from `first()` to `last()`, both included.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        (self.network..=(self.network | !self.mask)).map(Ipv4Addr::from)
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    /// Parse `a.b.c.d/len`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, prefix) = s
            .split_once('/')
            .ok_or_else(|| SubnetError::Syntax(s.to_string()))?;
        let ip: Ipv4Addr = ip.parse().map_err(|_| SubnetError::Syntax(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| SubnetError::Syntax(s.to_string()))?;
        Subnet::new(ip, prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubnetError {
    #[error("prefix length {0} is larger than 32")]
    Prefix(u8),
    #[error("expected `a.b.c.d/len`, got {0:?}")]
    Syntax(String),
}

/// Peers found by one sweep. `groups` keeps each group's tokens in the order responses arrived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub peers: BTreeMap<PeerToken, PeerInfo>,
    pub groups: BTreeMap<String, Vec<PeerToken>>,
}

impl DiscoveryResult {
    fn add(&mut self, token: PeerToken, info: PeerInfo) {
        let group = info.group.clone();
        if self.peers.insert(token.clone(), info).is_none() {
            self.groups.entry(group).or_default().push(token);
        }
    }

    pub fn group(&self, name: &str) -> &[PeerToken] {
        self.groups.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, token: &PeerToken) -> bool {
        self.peers.contains_key(token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &PeerToken> {
        self.peers.keys()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Ask whoever answers at `token`'s address who they are. `None` means nobody (or nobody
/// speaking the protocol) is there; absence is the common case, not an error.
pub trait Probe: Sync {
    fn probe(&self, token: &PeerToken) -> Option<PeerInfo>;
}

/// Hosts a sweep visits. Subnet addresses are produced on demand, never collected up front.
#[derive(Debug, Clone)]
pub enum Hosts {
    Subnet(Subnet),
    List(Vec<String>),
}

impl Hosts {
    pub fn count(&self) -> u64 {
        match self {
            Hosts::Subnet(subnet) => subnet.host_count(),
            Hosts::List(hosts) => hosts.len() as u64,
        }
    }

    pub fn get(&self, index: u64) -> Option<String> {
        match self {
            Hosts::Subnet(subnet) => subnet.nth(index).map(|ip| ip.to_string()),
            Hosts::List(hosts) => usize::try_from(index).ok().and_then(|i| hosts.get(i)).cloned(),
        }
    }
}

/// Search space of one sweep.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub hosts: Hosts,
    pub ports: Range<u16>,
    pub groups: Vec<String>,
    pub hubs_only: bool,
    /// Worker threads; 0 probes synchronously on the calling thread.
    pub workers: usize,
}

/// Split host indices `0..total` into at most `workers` contiguous slices.
fn partition(total: u64, workers: usize) -> Vec<Range<u64>> {
    let workers = (workers as u64).max(1);
    let size = total.div_ceil(workers).max(1);
    let mut slices = Vec::new();
    let mut start = 0;
    while start < total {
        let end = total.min(start + size);
        slices.push(start..end);
        start = end;
    }
    slices
}

/// Probe every (host, port, group) triple of `plan` and collect the responders. Blocks until
/// every worker is done; the result is complete or not returned at all.
pub fn sweep<P: Probe + ?Sized>(prober: &P, plan: &SweepPlan) -> DiscoveryResult {
    let found = Mutex::new(DiscoveryResult::default());
    let probes = AtomicUsize::new(0);
    let total = if plan.ports.is_empty() || plan.groups.is_empty() {
        0
    } else {
        plan.hosts.count()
    };
    if plan.workers == 0 {
        scan(prober, plan, 0..total, &found, &probes);
    } else {
        let (found, probes) = (&found, &probes);
        thread::scope(|s| {
            for (i, slice) in partition(total, plan.workers).into_iter().enumerate() {
                let spawned = thread::Builder::new()
                    .name(format!("tagnet-sweep-{i}"))
                    .spawn_scoped(s, {
                        let slice = slice.clone();
                        move || scan(prober, plan, slice, found, probes)
                    });
                if let Err(e) = spawned {
                    tracing::warn!(error = %e, "failed to spawn sweep worker, probing inline");
                    scan(prober, plan, slice, found, probes);
                }
            }
        });
    }
    let result = found.into_inner().unwrap_or_else(PoisonError::into_inner);
    tracing::info!(
        probes = probes.load(Ordering::Relaxed),
        found = result.len(),
        "discovery sweep finished"
    );
    result
}

fn scan<P: Probe + ?Sized>(
    prober: &P,
    plan: &SweepPlan,
    indices: Range<u64>,
    found: &Mutex<DiscoveryResult>,
    probes: &AtomicUsize,
) {
    for index in indices {
        let Some(host) = plan.hosts.get(index) else {
            continue;
        };
        for port in plan.ports.clone() {
            for group in &plan.groups {
                let Ok(id) = PeerId::new(host.clone(), port, group.clone()) else {
                    continue;
                };
                let token = id.token();
                probes.fetch_add(1, Ordering::Relaxed);
                let Some(info) = prober.probe(&token) else {
                    continue;
                };
                if info.group != *group || (plan.hubs_only && !info.hub) {
                    continue;
                }
                tracing::debug!(peer = %id, hub = info.hub, "found peer");
                found
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .add(token, info);
            }
        }
    }
}
