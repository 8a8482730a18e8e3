//! Operation log entries and their positions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::keys::{Document, Value};
use crate::types::Namespace;

/// Position of a write in the replica set's operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OpTime {
    pub term: u64,
    pub index: u64,
}

impl OpTime {
    /// Position before any write.
    pub const ZERO: OpTime = OpTime { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.term, self.index)
    }
}

/// A replicated write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert or replace the document with the same `_id`.
    Upsert(Document),
    /// Remove the document with this `_id`.
    Delete(Value),
}

/// One entry of the operation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op_time: OpTime,
    pub ns: Namespace,
    pub kind: OpKind,
}
