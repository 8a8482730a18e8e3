//! Chunk ownership, live chunk migration and orphan cleanup for a
//! range-sharded document store.
//!
//! Documents of a sharded collection are partitioned by shard key into
//! chunks, and every chunk is owned by exactly one shard. This crate provides:
//!
//! - **Metadata store**: each shard's cached, versioned view of which chunks
//!   it owns and which ranges it is receiving
//! - **Chunk migration**: the six-step donor and five-step recipient protocol
//!   that moves a chunk between shards while writes continue
//! - **Orphan cleanup**: `cleanupOrphaned`, which deletes documents a shard
//!   stores but neither owns nor is receiving
//! - **Replication gate**: deletions wait for majority acknowledgement
//!
//! # Example
//!
//! ```rust,no_run
//! use shardline::keys::ShardKeyPattern;
//! use shardline::{doc, InProcessNetwork, DistLockManager, InMemoryConfigService, ShardConfig, ShardNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> shardline::Result<()> {
//!     let config = Arc::new(InMemoryConfigService::new());
//!     let locks = DistLockManager::new();
//!     let network = InProcessNetwork::new();
//!     let shard = ShardNode::new(ShardConfig::new("shard0000"), config.clone(), locks, network);
//!
//!     let ns: shardline::Namespace = "foo.bar".into();
//!     config.shard_collection(&ns, ShardKeyPattern::ascending(&["_id"])?, shard.shard_id())?;
//!     shard.metadata().reload(&ns).await?;
//!     shard.insert(&ns, doc! { "_id" => 1 })?;
//!
//!     // Loop until the whole key space has been visited.
//!     let mut from = None;
//!     loop {
//!         let outcome = shard.cleanup_orphaned(&ns, from.as_ref(), false).await?;
//!         match outcome.stopped_at_key {
//!             Some(key) => from = Some(ShardKeyPattern::ascending(&["_id"])?.key_to_document(&key)),
//!             None => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!            commands (admin db)              routed reads/writes
//!                  │                                 │
//!                  ▼                                 ▼
//! ┌──────────────────────────────┐        ┌──────────────────────┐
//! │          ShardNode           │        │      RouterNode      │
//! │ DonorCoordinator             │◀──rpc─▶│ (no shard commands)  │
//! │ RecipientReceiver            │        └──────────────────────┘
//! │ OrphanCleaner ─ RangeDeleter │
//! └──────────────────────────────┘
//!        │                 │
//!        ▼                 ▼
//! ┌──────────────┐  ┌─────────────┐      ┌──────────────────────┐
//! │MetadataStore │  │ ReplicaSet  │      │   DistLockManager    │
//! │ (snapshots)  │  │ (majority)  │      │ (one per namespace)  │
//! └──────────────┘  └─────────────┘      └──────────────────────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │ConfigService │
//! └──────────────┘
//! ```
//!
//! # Ownership model
//!
//! - **Committed chunks** partition the key space; the config service is the
//!   authority and shards hold possibly stale snapshots
//! - **Pending ranges** are reserved on a recipient while it receives a chunk
//!   and are never treated as orphaned
//! - **Orphans** are documents outside every owned or pending range; they
//!   are invisible to routed reads and removed by `cleanupOrphaned`

pub mod command;
pub mod config;
pub mod error;
pub mod failpoint;
pub mod keys;
pub mod metadata;
pub mod metrics;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod sharding;
pub mod testing;
pub mod types;

pub use command::{Command, CommandDispatcher, CommandReply, ReplyBody, RouterNode, ShardVersionInfo};
pub use config::{CleanupConfig, MigrationConfig, ReplicationConfig, ShardConfig};
pub use error::{Error, ErrorCode, Result};
pub use failpoint::{FailpointMode, FailpointRegistry};
pub use metadata::{ChunkVersion, CollectionMetadata, ConfigService, InMemoryConfigService, MetadataStore};
pub use node::ShardNode;
pub use rpc::InProcessNetwork;
pub use sharding::{CleanupOutcome, DistLockManager, MoveChunkRequest};
pub use types::{Namespace, NodeRole, ShardId};
