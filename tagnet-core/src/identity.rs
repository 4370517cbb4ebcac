//! Peer identity: the (host, port, group) triple and its transportable token.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Separator between the address and the group in the token text.
const GROUP_SEPARATOR: &str = " -> ";

/// Address of one running peer on the network. Fixed once the peer has bound its port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId {
    pub host: String,
    pub port: u16,
    pub group: String,
}

impl PeerId {
    /// Validating constructor. Hosts may not be empty or contain whitespace; groups may not be empty.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        group: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let host = host.into();
        let group = group.into();
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(IdentityError::Host(host));
        }
        if group.is_empty() {
            return Err(IdentityError::EmptyGroup);
        }
        Ok(Self { host, port, group })
    }

    /// Plain text form: `host:port -> group`.
    pub fn text(&self) -> String {
        format!("{}:{}{}{}", self.host, self.port, GROUP_SEPARATOR, self.group)
    }

    pub fn token(&self) -> PeerToken {
        PeerToken::encode(self)
    }

    fn parse(text: &str) -> Result<Self, IdentityError> {
        let shape = || IdentityError::Shape(text.to_string());
        let (address, group) = text.split_once(GROUP_SEPARATOR).ok_or_else(shape)?;
        let (host, port) = address.rsplit_once(':').ok_or_else(shape)?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(shape());
        }
        let port = port.parse::<u16>().map_err(|_| shape())?;
        Self::new(host, port, group)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Base64 encoding of a [`PeerId`]. Deterministic, so tokens built independently by
/// different processes compare equal and can be used as map keys across the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerToken(String);

impl PeerToken {
    pub fn encode(id: &PeerId) -> Self {
        PeerToken(STANDARD.encode(id.text()))
    }

    /// Decode back into the identity. Fails on bad base64 or a text that is not `host:port -> group`.
    pub fn decode(&self) -> Result<PeerId, IdentityError> {
        let raw = STANDARD.decode(&self.0)?;
        let text = String::from_utf8(raw)?;
        PeerId::parse(&text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerToken {
    fn from(s: String) -> Self {
        PeerToken(s)
    }
}

impl From<&str> for PeerToken {
    fn from(s: &str) -> Self {
        PeerToken(s.to_string())
    }
}

impl fmt::Display for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a peer reports about itself through the built-in `info` connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub group: String,
    pub host: String,
    pub port: u16,
    pub hub: bool,
}

impl PeerInfo {
    pub fn new(id: &PeerId, hub: bool) -> Self {
        Self {
            group: id.group.clone(),
            host: id.host.clone(),
            port: id.port,
            hub,
        }
    }

    pub fn id(&self) -> Result<PeerId, IdentityError> {
        PeerId::new(self.host.clone(), self.port, self.group.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("peer token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("peer token is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("peer token does not match `host:port -> group`: {0:?}")]
    Shape(String),
    #[error("invalid peer host {0:?}")]
    Host(String),
    #[error("peer group must not be empty")]
    EmptyGroup,
}
