//! Connection registry: callables addressable by remote peers under a tag.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::protocol::{Reply, Request};

/// Transportable name of a registered callable: base64 of the connection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionTag(String);

impl ConnectionTag {
    /// Tag for an explicit connection name.
    pub fn named(name: &str) -> Self {
        ConnectionTag(STANDARD.encode(name))
    }

    /// Default tag of a callable: its fully qualified type path (e.g. `my_app::echo`).
    /// Two closures defined in the same function share a path and therefore collide.
    pub fn of<F: ?Sized>() -> Self {
        Self::named(std::any::type_name::<F>())
    }

    /// Human-readable connection name. Falls back to the raw tag when it is not valid base64 text.
    pub fn name(&self) -> String {
        STANDARD
            .decode(&self.0)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .unwrap_or_else(|| self.0.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionTag {
    /// Wrap an already encoded tag.
    fn from(tag: String) -> Self {
        ConnectionTag(tag)
    }
}

impl fmt::Display for ConnectionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A registered callable. `C` is the context the owner passes in (the local peer).
pub type Handler<C> = Arc<dyn Fn(&C, &Request) -> anyhow::Result<Reply> + Send + Sync>;

struct Entry<C> {
    handler: Handler<C>,
    callable: TypeId,
}

/// Tag -> callable map. Entries live as long as the registry; the last registration under a tag wins.
pub struct ConnectionRegistry<C> {
    entries: RwLock<HashMap<ConnectionTag, Entry<C>>>,
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register under the callable's default tag.
    pub fn register<F>(&self, handler: F) -> ConnectionTag
    where
        F: Fn(&C, &Request) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        self.register_tagged(ConnectionTag::of::<F>(), handler)
    }

    /// Register under `name` when given, else under the default tag.
    pub fn register_as<F>(&self, name: Option<&str>, handler: F) -> ConnectionTag
    where
        F: Fn(&C, &Request) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        let tag = match name {
            Some(name) => ConnectionTag::named(name),
            None => ConnectionTag::of::<F>(),
        };
        self.register_tagged(tag, handler)
    }

    /// Register under an explicit tag. Replacing a different callable logs a warning;
    /// registering the same callable again is a no-op apart from swapping in the new value.
    pub fn register_tagged<F>(&self, tag: ConnectionTag, handler: F) -> ConnectionTag
    where
        F: Fn(&C, &Request) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        let callable = TypeId::of::<F>();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let previous = entries.insert(
            tag.clone(),
            Entry {
                handler: Arc::new(handler),
                callable,
            },
        );
        match previous {
            Some(old) if old.callable != callable => {
                tracing::warn!(
                    connection = %tag,
                    "connection re-registered, previous handler replaced"
                );
            }
            Some(_) => {}
            None => tracing::debug!(connection = %tag, "connection registered"),
        }
        tag
    }

    pub fn lookup(&self, tag: &ConnectionTag) -> Option<Handler<C>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .map(|e| e.handler.clone())
    }

    pub fn contains(&self, tag: &ConnectionTag) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tag)
    }

    /// Readable names of all registered connections, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(ConnectionTag::name)
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn echo(_: &(), req: &Request) -> anyhow::Result<Reply> {
        Ok(req.arg::<serde_json::Value>(0)?.into())
    }

    fn shout(_: &(), req: &Request) -> anyhow::Result<Reply> {
        let s: String = req.arg(0)?;
        Ok(json!(s.to_uppercase()).into())
    }

    fn call(reg: &ConnectionRegistry<()>, tag: &ConnectionTag, arg: serde_json::Value) -> Reply {
        let req = Request::new(tag.clone(), vec![arg], Map::new());
        (reg.lookup(tag).unwrap())(&(), &req).unwrap()
    }

    #[test]
    fn default_tag_is_qualified_name() {
        let reg = ConnectionRegistry::new();
        let tag = reg.register(echo);
        assert!(tag.name().ends_with("registry::tests::echo"), "{}", tag.name());
        assert_eq!(call(&reg, &tag, json!(42)), Reply::Value(json!(42)));
    }

    #[test]
    fn explicit_tag() {
        let reg = ConnectionRegistry::new();
        let tag = reg.register_as(Some("myTaggedFunction"), shout);
        assert_eq!(tag, ConnectionTag::named("myTaggedFunction"));
        assert_eq!(tag.name(), "myTaggedFunction");
        assert_eq!(tag.as_str(), "bXlUYWdnZWRGdW5jdGlvbg==");
        assert!(reg.contains(&tag));
    }

    #[test]
    fn same_callable_same_tag_is_idempotent() {
        let reg = ConnectionRegistry::new();
        let a = reg.register_as(Some("echo"), echo);
        let b = reg.register_as(Some("echo"), echo);
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn last_registration_wins() {
        let reg = ConnectionRegistry::new();
        let tag = reg.register_as(Some("f"), echo);
        reg.register_as(Some("f"), shout);
        assert_eq!(reg.len(), 1);
        assert_eq!(call(&reg, &tag, json!("hi")), Reply::Value(json!("HI")));
    }

    #[test]
    fn unknown_tag() {
        let reg: ConnectionRegistry<()> = ConnectionRegistry::new();
        assert!(reg.lookup(&ConnectionTag::named("missing")).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn names_are_readable() {
        let reg = ConnectionRegistry::new();
        reg.register_as(Some("b"), echo);
        reg.register_as(Some("a"), shout);
        assert_eq!(reg.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn raw_tag_name_falls_back() {
        let tag = ConnectionTag::from("%%%".to_string());
        assert_eq!(tag.name(), "%%%");
    }
}
