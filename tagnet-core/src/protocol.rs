//! Tagnet wire messages: request and response frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::PeerToken;
use crate::registry::ConnectionTag;

/// A call to a registered connection. Arguments must be JSON-representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub connection: ConnectionTag,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Token of the calling peer, if it has one.
    #[serde(default)]
    pub peer: Option<PeerToken>,
}

impl Request {
    pub fn new(connection: ConnectionTag, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            connection,
            args,
            kwargs,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: PeerToken) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Positional argument `index`, deserialized into `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, ArgumentError> {
        let value = self.args.get(index).ok_or(ArgumentError::Missing(index))?;
        serde_json::from_value(value.clone()).map_err(|source| ArgumentError::Invalid {
            name: index.to_string(),
            source,
        })
    }

    /// Keyword argument `name`, or `None` when the caller did not pass it.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ArgumentError> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|source| ArgumentError::Invalid {
                    name: name.to_string(),
                    source,
                }),
        }
    }
}

/// Response payloads. The `payload` field is the discriminant; decoding rejects unknown kinds.
/// Mapping results travel as `value`; every other result is wrapped as `raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "snake_case")]
pub enum Response {
    Value {
        value: Map<String, Value>,
        peer: PeerToken,
    },
    Raw {
        raw: Value,
        peer: PeerToken,
    },
    Error {
        traceback: String,
        peer: PeerToken,
    },
}

impl Response {
    pub fn from_value(peer: PeerToken, value: Value) -> Self {
        match value {
            Value::Object(value) => Response::Value { value, peer },
            raw => Response::Raw { raw, peer },
        }
    }

    pub fn error(peer: PeerToken, traceback: impl Into<String>) -> Self {
        Response::Error {
            traceback: traceback.into(),
            peer,
        }
    }

    /// The responding peer.
    pub fn peer(&self) -> &PeerToken {
        match self {
            Response::Value { peer, .. } | Response::Raw { peer, .. } | Response::Error { peer, .. } => {
                peer
            }
        }
    }

    /// Unwrap to the carried value; error payloads become [`RemoteError`].
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            Response::Value { value, .. } => Ok(Value::Object(value)),
            Response::Raw { raw, .. } => Ok(raw),
            Response::Error { traceback, peer } => Err(RemoteError { peer, traceback }),
        }
    }
}

/// What a connection handler hands back: a value, or the name of a flag to send instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Value),
    Flag(String),
}

impl Reply {
    pub fn flag(name: impl Into<String>) -> Self {
        Reply::Flag(name.into())
    }

    /// Serialize any value into a reply.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Reply::Value)
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

/// A handler failed on the responding peer. `traceback` is the remote failure text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("remote peer {peer} failed:\n{traceback}")]
pub struct RemoteError {
    pub peer: PeerToken,
    pub traceback: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ArgumentError {
    #[error("missing positional argument {0}")]
    Missing(usize),
    #[error("argument {name} has the wrong type: {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer() -> PeerToken {
        PeerToken::from("cGVlcg==")
    }

    #[test]
    fn typed_arguments() {
        let mut kwargs = Map::new();
        kwargs.insert("suffix".into(), json!(" Version 1"));
        let req = Request::new(ConnectionTag::named("echo"), vec![json!(42), json!("x")], kwargs);
        assert_eq!(req.arg::<u32>(0).unwrap(), 42);
        assert_eq!(req.arg::<String>(1).unwrap(), "x");
        assert!(matches!(req.arg::<u32>(2), Err(ArgumentError::Missing(2))));
        assert!(matches!(
            req.arg::<u32>(1),
            Err(ArgumentError::Invalid { .. })
        ));
        assert_eq!(
            req.kwarg::<String>("suffix").unwrap().as_deref(),
            Some(" Version 1")
        );
        assert_eq!(req.kwarg::<String>("absent").unwrap(), None);
    }

    #[test]
    fn mappings_are_not_wrapped() {
        let resp = Response::from_value(peer(), json!({"a": 1}));
        assert!(matches!(resp, Response::Value { .. }));
        assert_eq!(resp.into_result().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn scalars_and_sequences_are_wrapped() {
        for v in [json!(42), json!("text"), json!([1, 2, 3]), Value::Null, json!(true)] {
            let resp = Response::from_value(peer(), v.clone());
            assert!(matches!(resp, Response::Raw { .. }));
            assert_eq!(resp.into_result().unwrap(), v);
        }
    }

    #[test]
    fn error_payload_shape() {
        let resp = Response::error(peer(), "boom");
        let text = serde_json::to_value(&resp).unwrap();
        assert_eq!(text["payload"], "error");
        assert_eq!(text["traceback"], "boom");
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.traceback, "boom");
        assert_eq!(err.peer, peer());
    }

    #[test]
    fn unknown_discriminant_rejected() {
        let bad = json!({"payload": "ping", "peer": "cGVlcg=="});
        assert!(serde_json::from_value::<Response>(bad).is_err());
        let missing = json!({"raw": 1, "peer": "cGVlcg=="});
        assert!(serde_json::from_value::<Response>(missing).is_err());
    }
}
