//! Shard key model.
//!
//! Documents are flat field maps. A [`ShardKeyPattern`] extracts an ordered
//! [`ShardKey`] from each document; chunk ownership is expressed as half-open
//! [`ChunkRange`]s over that key space.

pub mod pattern;
pub mod range;
pub mod value;

pub use pattern::{hash_value, KeyField, KeyKind, ShardKey, ShardKeyPattern};
pub use range::ChunkRange;
pub use value::{Document, Value, ID_FIELD};
