//! Flags: out-of-band control tokens a peer sends in place of a response payload.
//!
//! A sentinel is base64 of `!NAME`. Data frames are always base64 of a JSON object
//! (text starting with `{`), so a data frame can never be byte-equal to a sentinel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::identity::PeerToken;
use crate::registry::ConnectionTag;

/// Sent when a request frame was empty, or by handlers that have nothing to return.
pub const NULL: &str = "NULL";
/// Sent when the requested connection is not registered on the responder.
pub const INVALID_CONNECTION: &str = "INVALID_CONNECTION";

const SENTINEL_MARKER: char = '!';

/// Encoded sentinel for one flag name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlagToken(String);

impl FlagToken {
    pub fn for_name(name: &str) -> Self {
        FlagToken(STANDARD.encode(format!("{SENTINEL_MARKER}{name}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for FlagToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a flag handler learns about the call that produced the flag.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagCall {
    pub flag: String,
    pub connection: ConnectionTag,
    pub peer: PeerToken,
}

/// A flag handler refused to turn the flag into a value. Callers match on `flag`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{flag} from peer {peer}: {message}")]
pub struct ControlSignal {
    pub flag: String,
    pub connection: ConnectionTag,
    pub peer: PeerToken,
    pub message: String,
}

impl ControlSignal {
    pub fn new(call: &FlagCall, message: impl Into<String>) -> Self {
        Self {
            flag: call.flag.clone(),
            connection: call.connection.clone(),
            peer: call.peer.clone(),
            message: message.into(),
        }
    }

    pub fn is(&self, flag: &str) -> bool {
        self.flag == flag
    }
}

/// Handler run on the receiving side when a sentinel arrives. `Ok` short-circuits the call with a value.
pub type FlagHandler<C> = Arc<dyn Fn(&C, &FlagCall) -> Result<Value, ControlSignal> + Send + Sync>;

struct FlagEntry<C> {
    token: FlagToken,
    handler: FlagHandler<C>,
}

/// Flag name -> (sentinel, handler).
pub struct FlagRegistry<C> {
    flags: RwLock<HashMap<String, FlagEntry<C>>>,
}

impl<C> FlagRegistry<C> {
    pub fn new() -> Self {
        Self {
            flags: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a flag handler and return its sentinel.
    pub fn register<F>(&self, name: &str, handler: F) -> Result<FlagToken, FlagError>
    where
        F: Fn(&C, &FlagCall) -> Result<Value, ControlSignal> + Send + Sync + 'static,
    {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(FlagError::InvalidName(name.to_string()));
        }
        let token = FlagToken::for_name(name);
        let entry = FlagEntry {
            token: token.clone(),
            handler: Arc::new(handler),
        };
        let mut flags = self.flags.write().unwrap_or_else(PoisonError::into_inner);
        if flags.insert(name.to_string(), entry).is_some() {
            tracing::debug!(flag = name, "flag handler replaced");
        }
        Ok(token)
    }

    /// Sentinel of a registered flag.
    pub fn token(&self, name: &str) -> Result<FlagToken, FlagError> {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|e| e.token.clone())
            .ok_or_else(|| FlagError::Unknown(name.to_string()))
    }

    pub fn handler(&self, name: &str) -> Result<FlagHandler<C>, FlagError> {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|e| e.handler.clone())
            .ok_or_else(|| FlagError::Unknown(name.to_string()))
    }

    /// The flag whose sentinel is exactly `bytes`, if any.
    pub fn matching(&self, bytes: &[u8]) -> Option<(String, FlagHandler<C>)> {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, e)| e.token.as_bytes() == bytes)
            .map(|(name, e)| (name.clone(), e.handler.clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

impl<C> Default for FlagRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlagError {
    #[error("flag {0:?} is not registered")]
    Unknown(String),
    #[error("invalid flag name {0:?}")]
    InvalidName(String),
}
