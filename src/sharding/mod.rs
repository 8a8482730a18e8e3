//! Chunk migration and orphan cleanup.
//!
//! A migration moves one chunk from a donor shard to a recipient shard:
//!
//! ```text
//!  donor                                recipient
//!  1 started (lock)
//!  2 cloned ownership view
//!  3 recipient started  ── _recvChunkStart ──▶ 1 started (range pending)
//!                       ◀── _migrateClone ──── 2 cloning
//!                                              3 cloned
//!                       ◀── _transferMods ──── 4 transferred mods
//!  4 mods drained       ── _recvChunkStatus ─▶
//!  5 committed          ── _recvChunkCommit ─▶ 5 done
//!  6 post-move delete
//! ```
//!
//! Both sides publish their step to the node's [`ActiveOps`] table and run a
//! [`StepHook`] after each step, which is where the hang failpoints pause.

use std::sync::Arc;

mod active_ops;
mod cleanup;
mod donor;
mod lock;
mod range_deleter;
mod recipient;
mod session;
mod steps;

pub use active_ops::{ActiveOp, ActiveOpHandle, ActiveOps};
pub use cleanup::{CleanupOutcome, OrphanCleaner};
pub use donor::{DonorCoordinator, MoveChunkRequest};
pub use lock::{DistLockGuard, DistLockManager, LockInfo};
pub use range_deleter::{DeleteBudget, DeleteOutcome, RangeDeleter};
pub use recipient::RecipientReceiver;
pub use session::{DonorState, MigrationSession, RecipientState};
pub use steps::{DonorStep, FailpointStepHook, NoopStepHook, RecipientStep, StepHook};

use crate::config::MigrationConfig;
use crate::metadata::MetadataStore;
use crate::metrics::ShardingMetrics;
use crate::replication::ReplicaSet;
use crate::rpc::ShardNetwork;
use crate::types::ShardId;

/// `ActiveOp::desc` of a donor migration.
pub const MOVE_CHUNK_DESC: &str = "moveChunk";

/// `ActiveOp::desc` of a recipient receive.
pub const MIGRATE_THREAD_DESC: &str = "migrateThread";

/// Services of one shard node shared by both migration sides.
pub struct MigrationContext {
    pub shard_id: ShardId,
    pub config: MigrationConfig,
    pub metadata: Arc<MetadataStore>,
    pub replica_set: Arc<ReplicaSet>,
    pub deleter: Arc<RangeDeleter>,
    pub network: Arc<dyn ShardNetwork>,
    pub locks: Arc<DistLockManager>,
    pub active_ops: Arc<ActiveOps>,
    pub hook: Arc<dyn StepHook>,
    pub metrics: Arc<ShardingMetrics>,
}
