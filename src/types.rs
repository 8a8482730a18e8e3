//! Core identifiers used throughout the crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a shard (one replica set).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a shard id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Fully-qualified collection name, `<db>.<collection>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace(Arc<str>);

impl Namespace {
    /// Create a namespace.
    pub fn new(ns: impl AsRef<str>) -> Self {
        Self(Arc::from(ns.as_ref()))
    }

    /// The database part (before the first `.`).
    pub fn db(&self) -> &str {
        self.0.split_once('.').map(|(db, _)| db).unwrap_or(&self.0)
    }

    /// The collection part (after the first `.`), empty for a bare db name.
    pub fn collection(&self) -> &str {
        self.0.split_once('.').map(|(_, c)| c).unwrap_or("")
    }

    /// Whether both parts are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.db().is_empty() && !self.collection().is_empty()
    }

    /// Borrow as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Role of a node answering commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Replica-set primary of a storage shard.
    Primary,
    /// Replica-set secondary of a storage shard.
    Secondary,
    /// Query-routing tier; owns no data.
    Router,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Secondary => write!(f, "secondary"),
            NodeRole::Router => write!(f, "router"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_parts() {
        let ns = Namespace::new("foo.bar.baz");
        assert_eq!(ns.db(), "foo");
        assert_eq!(ns.collection(), "bar.baz");
        assert!(ns.is_valid());
        assert!(!Namespace::new("foo").is_valid());
    }
}
