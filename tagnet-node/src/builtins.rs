//! Connections and flags every peer registers at launch.

use serde_json::{json, Value};
use tagnet_core::flag::{INVALID_CONNECTION, NULL};
use tagnet_core::{ConnectionTag, ControlSignal, FlagCall, FlagError, Reply, Request};

use crate::peer::PeerProcess;

/// Describes the peer: its [`tagnet_core::PeerInfo`].
pub const INFO: &str = "info";
/// Hands its arguments back; a single argument is returned bare.
pub const PASS_THROUGH: &str = "pass_through";
/// Replies with the `NULL` flag.
pub const NULL_CONNECTION: &str = "null";
/// Lists the names of every registered connection.
pub const CONNECTIONS: &str = "connections";

pub(crate) fn install(peer: &PeerProcess) -> Result<(), FlagError> {
    let connections = peer.connections();
    connections.register_tagged(ConnectionTag::named(INFO), info);
    connections.register_tagged(ConnectionTag::named(PASS_THROUGH), pass_through);
    connections.register_tagged(ConnectionTag::named(NULL_CONNECTION), null);
    connections.register_tagged(ConnectionTag::named(CONNECTIONS), registered);

    peer.register_flag(NULL, null_response)?;
    peer.register_flag(INVALID_CONNECTION, invalid_connection)?;
    Ok(())
}

fn info(peer: &PeerProcess, _: &Request) -> anyhow::Result<Reply> {
    Ok(Reply::json(&peer.info())?)
}

fn pass_through(_: &PeerProcess, request: &Request) -> anyhow::Result<Reply> {
    if let [single] = request.args.as_slice() {
        return Ok(single.clone().into());
    }
    Ok(json!([request.args, request.kwargs]).into())
}

fn null(_: &PeerProcess, _: &Request) -> anyhow::Result<Reply> {
    Ok(Reply::flag(NULL))
}

fn registered(peer: &PeerProcess, _: &Request) -> anyhow::Result<Reply> {
    Ok(Reply::json(&peer.connections().names())?)
}

fn null_response(_: &PeerProcess, _: &FlagCall) -> Result<Value, ControlSignal> {
    Ok(Value::Null)
}

fn invalid_connection(peer: &PeerProcess, call: &FlagCall) -> Result<Value, ControlSignal> {
    let target = call
        .peer
        .decode()
        .map(|id| format!("{}@{}", id.host, id.port))
        .unwrap_or_else(|_| call.peer.to_string());
    let mut message = format!(
        "peer {target} does not have the connection you are requesting: {} -> {}",
        call.connection.as_str(),
        call.connection.name()
    );
    if let Some(names) = peer.remote_connections(&call.peer) {
        message.push_str(&format!("; registered connections: {}", names.join(", ")));
    }
    Err(ControlSignal::new(call, message))
}
