//! Threaded request server: the accept loop runs on its own thread and every accepted
//! connection is answered on a fresh OS thread. There is no admission control.

use std::any::Any;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tagnet_core::{flag, wire, Handler, Reply, Request, Response};

use crate::peer::PeerProcess;
use crate::transport;

/// How long a connection thread waits for the rest of a request before giving up on the client.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn spawn(listener: TcpListener, peer: Arc<PeerProcess>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("tagnet-server-{}", peer.identity().port))
        .spawn(move || serve(listener, peer))
}

fn serve(listener: TcpListener, peer: Arc<PeerProcess>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = peer.clone();
                let spawned = thread::Builder::new()
                    .name("tagnet-conn".to_string())
                    .spawn(move || handle_connection(stream, &peer));
                if let Err(e) = spawned {
                    tracing::error!(error = %e, "failed to spawn connection thread");
                }
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}

fn handle_connection(mut stream: TcpStream, peer: &PeerProcess) {
    let remote = stream.peer_addr().ok();
    if let Err(e) = stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT)) {
        tracing::warn!(?remote, error = %e, "failed to set read timeout");
    }
    // Answer as soon as a whole request has arrived; EOF still ends a frame.
    let frame = match transport::read_frame_until(&mut stream, wire::request_complete) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(?remote, error = %e, "failed to read request");
            return;
        }
    };
    let reply = respond(peer, &frame);
    if let Err(e) = transport::write_frame(&mut stream, &reply) {
        tracing::debug!(?remote, error = %e, "failed to write response");
    }
}

/// Response frame for one request frame: a sentinel, an encoded result, or an error payload.
pub(crate) fn respond(peer: &PeerProcess, frame: &[u8]) -> Vec<u8> {
    if frame.is_empty() {
        return sentinel(peer, flag::NULL);
    }
    let request = match wire::decode_request(frame) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, "malformed request frame");
            return error_frame(peer, format!("malformed request frame: {e}"));
        }
    };
    let Some(handler) = peer.connections().lookup(&request.connection) else {
        tracing::debug!(connection = %request.connection, "unknown connection requested");
        return sentinel(peer, flag::INVALID_CONNECTION);
    };
    tracing::debug!(connection = %request.connection, caller = ?request.peer, "executing connection");
    match execute(peer, &handler, &request) {
        Ok(Reply::Value(value)) => {
            match wire::encode_response(&Response::from_value(peer.id(), value)) {
                Ok(frame) => frame,
                Err(e) => error_frame(peer, format!("failed to encode result: {e}")),
            }
        }
        Ok(Reply::Flag(name)) => sentinel(peer, &name),
        Err(traceback) => error_frame(peer, traceback),
    }
}

/// Run a handler. Errors and panics come back as traceback text.
pub(crate) fn execute(
    peer: &PeerProcess,
    handler: &Handler<PeerProcess>,
    request: &Request,
) -> Result<Reply, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(peer, request))) {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(err)) => {
            tracing::error!(connection = %request.connection, error = %err, "connection failed");
            Err(format!("{err:?}"))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(connection = %request.connection, panic = %message, "connection panicked");
            Err(format!("connection {} panicked: {message}", request.connection))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn sentinel(peer: &PeerProcess, name: &str) -> Vec<u8> {
    match peer.flags().token(name) {
        Ok(token) => token.as_bytes().to_vec(),
        Err(e) => error_frame(peer, e.to_string()),
    }
}

fn error_frame(peer: &PeerProcess, traceback: String) -> Vec<u8> {
    match wire::encode_response(&Response::error(peer.id(), traceback)) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode error payload");
            Vec::new()
        }
    }
}
