//! Tagnet protocol core: peer identity, connection and flag registries, wire codec.
//! No socket I/O; the node crate owns the peer process and drives these types.

pub mod flag;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod wire;

pub use flag::{ControlSignal, FlagCall, FlagError, FlagHandler, FlagRegistry, FlagToken};
pub use identity::{IdentityError, PeerId, PeerInfo, PeerToken};
pub use protocol::{ArgumentError, RemoteError, Reply, Request, Response};
pub use registry::{ConnectionRegistry, ConnectionTag, Handler};
pub use wire::{
    decode_request, decode_response, encode_request, encode_response, inspect, request_complete,
    round_trip, FrameDecodeError, FrameEncodeError, Inbound, WireError,
};
