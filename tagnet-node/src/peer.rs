//! The peer process: owns the bound port, the registries and the server thread.
//! One guarded peer may exist per OS process; test-mode peers bypass the guard.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tagnet_core::{
    wire, ConnectionRegistry, ConnectionTag, ControlSignal, FlagCall, FlagError, FlagRegistry,
    FlagToken, FrameDecodeError, FrameEncodeError, IdentityError, Inbound, PeerId, PeerInfo,
    PeerToken, RemoteError, Reply, Request, WireError,
};

use crate::builtins;
use crate::config::Config;
use crate::discovery::{self, DiscoveryResult, Hosts, Probe, Subnet, SubnetError, SweepPlan};
use crate::server;
use crate::transport;

/// Set while a guarded peer exists in this process.
static SINGLETON: AtomicBool = AtomicBool::new(false);

/// Liveness probe timeout while scanning for a free port.
const PING_TIMEOUT: Duration = Duration::from_millis(250);

pub struct PeerProcess {
    id: PeerId,
    token: PeerToken,
    hub: bool,
    subnet: Subnet,
    config: Config,
    connections: ConnectionRegistry<PeerProcess>,
    flags: FlagRegistry<PeerProcess>,
    /// Last sweep and the query that produced it.
    discovered: Mutex<Option<(PeerQuery, DiscoveryResult)>>,
}

/// Configures and launches a [`PeerProcess`].
pub struct PeerBuilder {
    config: Config,
    test_mode: bool,
}

impl PeerBuilder {
    /// Skip the one-peer-per-process guard. For tests that need several local peers.
    pub fn test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;
        self
    }

    /// Bind a port, register the built-ins and start serving.
    pub fn launch(self) -> Result<Arc<PeerProcess>, PeerError> {
        let guarded = !self.test_mode;
        if guarded
            && SINGLETON
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(PeerError::SingletonViolation);
        }
        let started = PeerProcess::start(self.config);
        if started.is_err() && guarded {
            SINGLETON.store(false, Ordering::SeqCst);
        }
        started
    }
}

impl PeerProcess {
    pub fn builder(config: Config) -> PeerBuilder {
        PeerBuilder {
            config,
            test_mode: false,
        }
    }

    /// Launch the process-wide peer.
    pub fn launch(config: Config) -> Result<Arc<PeerProcess>, PeerError> {
        Self::builder(config).launch()
    }

    fn start(config: Config) -> Result<Arc<PeerProcess>, PeerError> {
        let subnet = config.subnet()?;
        let (listener, port) = scan_for_port(&config)?;
        let id = PeerId::new(config.host.clone(), port, config.group.clone())?;
        let peer = Arc::new(PeerProcess {
            token: id.token(),
            id,
            hub: config.hub,
            subnet,
            config,
            connections: ConnectionRegistry::new(),
            flags: FlagRegistry::new(),
            discovered: Mutex::new(None),
        });
        builtins::install(&peer)?;
        server::spawn(listener, peer.clone())?;
        tracing::info!(peer = %peer.token, identity = %peer.id, hub = peer.hub, "peer serving");
        Ok(peer)
    }

    /// This peer's token.
    pub fn id(&self) -> PeerToken {
        self.token.clone()
    }

    pub fn identity(&self) -> &PeerId {
        &self.id
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo::new(&self.id, self.hub)
    }

    pub fn is_hub(&self) -> bool {
        self.hub
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionRegistry<PeerProcess> {
        &self.connections
    }

    pub fn flags(&self) -> &FlagRegistry<PeerProcess> {
        &self.flags
    }

    /// Register a connection under its default tag.
    pub fn register<F>(&self, handler: F) -> ConnectionTag
    where
        F: Fn(&PeerProcess, &Request) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        self.connections.register(handler)
    }

    /// Register a connection under `name`, or under its default tag when `name` is `None`.
    pub fn register_as<F>(&self, name: Option<&str>, handler: F) -> ConnectionTag
    where
        F: Fn(&PeerProcess, &Request) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        self.connections.register_as(name, handler)
    }

    pub fn register_flag<F>(&self, name: &str, handler: F) -> Result<FlagToken, FlagError>
    where
        F: Fn(&PeerProcess, &FlagCall) -> Result<Value, ControlSignal> + Send + Sync + 'static,
    {
        self.flags.register(name, handler)
    }

    /// Sentinel token of a registered flag.
    pub fn flag(&self, name: &str) -> Result<FlagToken, FlagError> {
        self.flags.token(name)
    }

    /// Is anything accepting connections on `host:port`?
    pub fn ping(host: &str, port: u16) -> bool {
        transport::ping(host, port, PING_TIMEOUT)
    }

    /// Call `connection` on `peer`, blocking until it answers.
    pub fn request(
        &self,
        peer: &PeerToken,
        connection: &ConnectionTag,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RequestError> {
        self.request_with_timeout(peer, connection, args, kwargs, None)
    }

    /// Call `connection` on `peer`. Sentinels are dispatched to the local flag handlers before
    /// any decoding; error payloads come back as [`RequestError::Remote`].
    pub fn request_with_timeout(
        &self,
        peer: &PeerToken,
        connection: &ConnectionTag,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RequestError> {
        let target = peer.decode()?;
        let request = Request::new(connection.clone(), args, kwargs).with_peer(self.id());
        let frame = wire::encode_request(&request)?;
        let reply = transport::exchange(&target, &frame, timeout)?;
        let inbound = wire::inspect(&reply, &self.flags).map_err(|e| {
            tracing::error!(peer = %target, connection = %connection, error = %e, "malformed response");
            e
        })?;
        match inbound {
            Inbound::Flag { name, handler } => {
                let call = FlagCall {
                    flag: name,
                    connection: connection.clone(),
                    peer: peer.clone(),
                };
                handler(self, &call).map_err(RequestError::Signal)
            }
            Inbound::Response(response) => response.into_result().map_err(RequestError::Remote),
        }
    }

    /// Names registered on `peer`, via its built-in `connections` call. Flags are not dispatched,
    /// so this never recurses into flag handlers.
    pub fn remote_connections(&self, peer: &PeerToken) -> Option<Vec<String>> {
        let target = peer.decode().ok()?;
        let request = Request::new(
            ConnectionTag::named(builtins::CONNECTIONS),
            Vec::new(),
            Map::new(),
        )
        .with_peer(self.id());
        let frame = wire::encode_request(&request).ok()?;
        let reply = transport::exchange(&target, &frame, Some(PING_TIMEOUT * 4)).ok()?;
        let value = wire::decode_response(&reply).ok()?.into_result().ok()?;
        serde_json::from_value(value).ok()
    }

    /// Discover peers, reusing the last sweep for an identical query unless `refresh` is set.
    pub fn get_peers(&self, query: &PeerQuery) -> DiscoveryResult {
        let mut cache = self.discovered.lock().unwrap_or_else(PoisonError::into_inner);
        if !query.refresh {
            if let Some((last, result)) = cache.as_ref() {
                if last.same_search(query) {
                    return result.clone();
                }
            }
        }
        let result = discovery::sweep(self, &self.sweep_plan(query));
        *cache = Some((query.clone(), result.clone()));
        result
    }

    /// Tokens of one group: from the cached sweep when it searched for the group, else a fresh
    /// sweep. A searched group with no members is a cache hit too.
    pub fn peer_group(&self, group: &str) -> Vec<PeerToken> {
        {
            let cache = self.discovered.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((last, result)) = cache.as_ref() {
                if last.covers(group, &self.id.group) {
                    return result.group(group).to_vec();
                }
            }
        }
        self.get_peers(&PeerQuery::new().group(group))
            .group(group)
            .to_vec()
    }

    fn sweep_plan(&self, query: &PeerQuery) -> SweepPlan {
        let groups = if query.groups.is_empty() {
            vec![self.id.group.clone()]
        } else {
            query.groups.clone()
        };
        let hosts = if query.on_host {
            Hosts::List(vec![self.id.host.clone()])
        } else {
            Hosts::Subnet(self.subnet)
        };
        SweepPlan {
            hosts,
            ports: self.config.ports(),
            groups,
            hubs_only: query.hubs_only,
            workers: self.config.thread_limit,
        }
    }
}

impl Probe for PeerProcess {
    fn probe(&self, token: &PeerToken) -> Option<PeerInfo> {
        let info = ConnectionTag::named(builtins::INFO);
        match self.request_with_timeout(
            token,
            &info,
            Vec::new(),
            Map::new(),
            Some(self.config.probe_timeout()),
        ) {
            Ok(value) => serde_json::from_value(value).ok(),
            Err(e) => {
                tracing::trace!(peer = %token, error = %e, "no peer");
                None
            }
        }
    }
}

/// Try `config.ports()` in order. Ports with a live listener are skipped; ports that fail to
/// bind are logged as stale and skipped.
fn scan_for_port(config: &Config) -> Result<(TcpListener, u16), PeerError> {
    let ports = config.ports();
    tracing::debug!(start = ports.start, end = ports.end, "scanning for open port");
    for port in ports.clone() {
        if transport::ping(&config.host, port, PING_TIMEOUT) {
            tracing::debug!(port, "port answered, skipping");
            continue;
        }
        match TcpListener::bind((config.bind.as_str(), port)) {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                tracing::debug!(port, "found port");
                return Ok((listener, port));
            }
            Err(e) => tracing::warn!(port, error = %e, "stale port"),
        }
    }
    Err(PeerError::PortExhausted {
        start: ports.start,
        end: ports.end,
    })
}

/// Which peers a sweep should look for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerQuery {
    /// Groups to match; empty means this peer's own group.
    pub groups: Vec<String>,
    /// Only sweep this peer's own host.
    pub on_host: bool,
    pub hubs_only: bool,
    /// Ignore the cached result.
    pub refresh: bool,
}

impl PeerQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn on_host(mut self) -> Self {
        self.on_host = true;
        self
    }

    pub fn hubs_only(mut self) -> Self {
        self.hubs_only = true;
        self
    }

    pub fn refresh(mut self) -> Self {
        self.refresh = true;
        self
    }

    /// Did this query search for every member of `group`? Empty `groups` stands for `own`.
    fn covers(&self, group: &str, own: &str) -> bool {
        let searched = if self.groups.is_empty() {
            group == own
        } else {
            self.groups.iter().any(|g| g == group)
        };
        searched && !self.hubs_only
    }

    fn same_search(&self, other: &PeerQuery) -> bool {
        self.groups == other.groups
            && self.on_host == other.on_host
            && self.hubs_only == other.hubs_only
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("no open port in {start}..{end}")]
    PortExhausted { start: u16, end: u16 },
    #[error("a peer is already running in this process")]
    SingletonViolation,
    #[error("invalid peer identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("invalid subnet: {0}")]
    Subnet(#[from] SubnetError),
    #[error("failed to register built-in flag: {0}")]
    Flag(#[from] FlagError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a call to a connection, local or remote.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid peer token: {0}")]
    Identity(#[from] IdentityError),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("malformed response: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error(transparent)]
    Signal(#[from] ControlSignal),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<WireError> for RequestError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Encode(e) => RequestError::Encode(e),
            WireError::Decode(e) => RequestError::Decode(e),
        }
    }
}
