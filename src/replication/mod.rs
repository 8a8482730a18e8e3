//! Replica-set write path and the majority-acknowledgement gate.
//!
//! Every destructive write on a shard goes through [`ReplicaSet`]: it is
//! applied on the primary, appended to the oplog and then, where the caller
//! needs durability, gated on [`ReplicaSet::wait_for_majority`].

pub mod oplog;
pub mod replica_set;
pub mod storage;

pub use oplog::{OpKind, OpTime, OplogEntry};
pub use replica_set::{ReplicaMember, ReplicaSet};
pub use storage::Storage;
