//! Invocation dispatcher: a registered connection that can be called in-process or on a remote peer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tagnet_core::{wire, ConnectionTag, FlagCall, Handler, PeerToken, RemoteError, Reply, Request};

use crate::peer::{PeerProcess, RequestError};
use crate::server;

/// Handle returned by [`PeerProcess::connect`]. Local calls run the handler directly and push the
/// result through the wire codec so they observe exactly what a remote caller would.
#[derive(Clone)]
pub struct Connection {
    tag: ConnectionTag,
    handler: Handler<PeerProcess>,
    peer: Arc<PeerProcess>,
}

impl PeerProcess {
    /// Register `handler` under its default tag and return a callable handle.
    pub fn connect<F>(self: &Arc<Self>, handler: F) -> Connection
    where
        F: Fn(&PeerProcess, &Request) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        self.connect_with(ConnectionTag::of::<F>(), handler)
    }

    /// Register `handler` under an explicit name and return a callable handle.
    pub fn connect_tagged<F>(self: &Arc<Self>, name: &str, handler: F) -> Connection
    where
        F: Fn(&PeerProcess, &Request) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        self.connect_with(ConnectionTag::named(name), handler)
    }

    fn connect_with<F>(self: &Arc<Self>, tag: ConnectionTag, handler: F) -> Connection
    where
        F: Fn(&PeerProcess, &Request) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let registered = handler.clone();
        let tag = self
            .connections()
            .register_tagged(tag, move |peer: &PeerProcess, request: &Request| {
                registered(peer, request)
            });
        Connection {
            tag,
            handler,
            peer: self.clone(),
        }
    }
}

impl Connection {
    pub fn tag(&self) -> &ConnectionTag {
        &self.tag
    }

    pub fn name(&self) -> String {
        self.tag.name()
    }

    /// Run locally when `target` is `None`, else on `target`.
    pub fn invoke(
        &self,
        target: Option<&PeerToken>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RequestError> {
        match target {
            Some(target) => self.call_on(target, args, kwargs),
            None => self.call(args, kwargs),
        }
    }

    /// Run on `target` through its server.
    pub fn call_on(
        &self,
        target: &PeerToken,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RequestError> {
        self.peer.request(target, &self.tag, args, kwargs)
    }

    pub fn call_on_with_timeout(
        &self,
        target: &PeerToken,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        self.peer
            .request_with_timeout(target, &self.tag, args, kwargs, Some(timeout))
    }

    /// Run in-process. Failures surface as [`RequestError::Remote`] and flag replies go through
    /// the local flag handlers, as they would for a remote call.
    pub fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, RequestError> {
        let local = self.peer.id();
        let request = Request::new(self.tag.clone(), args, kwargs).with_peer(local.clone());
        let reply = server::execute(&self.peer, &self.handler, &request).map_err(|traceback| {
            RemoteError {
                peer: local.clone(),
                traceback,
            }
        })?;
        match reply {
            Reply::Value(value) => Ok(wire::round_trip(&local, value)?),
            Reply::Flag(name) => {
                let handler = self.peer.flags().handler(&name).map_err(|e| RemoteError {
                    peer: local.clone(),
                    traceback: e.to_string(),
                })?;
                let call = FlagCall {
                    flag: name,
                    connection: self.tag.clone(),
                    peer: local,
                };
                Ok(handler(self.peer.as_ref(), &call)?)
            }
        }
    }
}
