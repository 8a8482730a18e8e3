//! The authoritative chunk table.
//!
//! Shards cache what they learn from a [`ConfigService`] in their
//! [`MetadataStore`](super::MetadataStore); a migration becomes durable only
//! once [`ConfigService::commit_migration`] records the new owner.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::chunk::{validate_partition, Chunk, ChunkVersion};
use crate::error::{Error, Result};
use crate::keys::{ChunkRange, ShardKey, ShardKeyPattern};
use crate::types::{Namespace, ShardId};

/// Full routing table of one sharded collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRouting {
    pub ns: Namespace,
    pub key_pattern: ShardKeyPattern,
    pub epoch: Uuid,
    pub chunks: Vec<Chunk>,
}

impl CollectionRouting {
    /// Highest chunk version.
    pub fn coll_version(&self) -> ChunkVersion {
        self.chunks
            .iter()
            .fold(ChunkVersion::zero(self.epoch), |v, c| v.max_in_epoch(c.version))
    }

    /// The chunk with exactly these bounds.
    pub fn chunk_with_bounds(&self, range: &ChunkRange) -> Option<&Chunk> {
        self.chunks.iter().find(|c| &c.range == range)
    }
}

/// Source of truth for chunk ownership.
#[async_trait]
pub trait ConfigService: Send + Sync {
    /// Routing table of `ns`, or `None` if it is not sharded.
    async fn collection(&self, ns: &Namespace) -> Result<Option<CollectionRouting>>;

    /// Record that the chunk `range` moved from `from` to `to`. Returns the
    /// moved chunk's new version.
    async fn commit_migration(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        from: &ShardId,
        to: &ShardId,
    ) -> Result<ChunkVersion>;
}

/// Config service holding routing tables in memory.
pub struct InMemoryConfigService {
    collections: RwLock<HashMap<Namespace, CollectionRouting>>,
    reachable: AtomicBool,
}

impl Default for InMemoryConfigService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConfigService {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulate the service going down or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        tracing::info!(reachable, "config service reachability changed");
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ConfigUnreachable(
                "config servers are not reachable".to_string(),
            ))
        }
    }

    /// Shard `ns` with a single chunk covering the key space, owned by
    /// `primary`. Returns the new epoch.
    pub fn shard_collection(
        &self,
        ns: &Namespace,
        key_pattern: ShardKeyPattern,
        primary: &ShardId,
    ) -> Result<Uuid> {
        if !ns.is_valid() {
            return Err(Error::InvalidArgument(format!("invalid namespace '{}'", ns)));
        }
        let mut collections = self.collections.write();
        if collections.contains_key(ns) {
            return Err(Error::InvalidArgument(format!("{} is already sharded", ns)));
        }
        let epoch = Uuid::new_v4();
        let range = ChunkRange::new(key_pattern.global_min(), key_pattern.global_max())?;
        let chunk = Chunk::new(range, primary.clone(), ChunkVersion::new(1, 0, epoch));
        collections.insert(
            ns.clone(),
            CollectionRouting {
                ns: ns.clone(),
                key_pattern,
                epoch,
                chunks: vec![chunk],
            },
        );
        tracing::info!(ns = %ns, %epoch, primary = %primary, "collection sharded");
        Ok(epoch)
    }

    /// Split the chunk containing `at` so that `at` starts a new chunk.
    pub fn split_chunk(&self, ns: &Namespace, at: ShardKey) -> Result<()> {
        let mut collections = self.collections.write();
        let routing = collections
            .get_mut(ns)
            .ok_or_else(|| Error::Unsharded(ns.clone()))?;
        let coll_version = routing.coll_version();
        let idx = routing
            .chunks
            .iter()
            .position(|c| c.range.contains(&at))
            .ok_or_else(|| Error::InvalidArgument(format!("no chunk contains split point {}", at)))?;
        let chunk = routing.chunks[idx].clone();
        if chunk.range.min() == &at {
            return Err(Error::InvalidArgument(format!(
                "split point {} is already a chunk boundary",
                at
            )));
        }

        let left = Chunk::new(
            ChunkRange::new(chunk.range.min().clone(), at.clone())?,
            chunk.owner.clone(),
            ChunkVersion::new(coll_version.major, coll_version.minor + 1, routing.epoch),
        );
        let right = Chunk::new(
            ChunkRange::new(at, chunk.range.max().clone())?,
            chunk.owner,
            ChunkVersion::new(coll_version.major, coll_version.minor + 2, routing.epoch),
        );
        tracing::debug!(ns = %ns, left = %left.range, right = %right.range, "chunk split");
        routing.chunks[idx] = right;
        routing.chunks.insert(idx, left);
        validate_partition(&routing.key_pattern, &routing.chunks)
    }

    /// Drop the routing table of `ns`.
    pub fn drop_collection(&self, ns: &Namespace) {
        self.collections.write().remove(ns);
    }

    /// Current routing table, bypassing the reachability switch.
    pub fn routing(&self, ns: &Namespace) -> Option<CollectionRouting> {
        self.collections.read().get(ns).cloned()
    }
}

#[async_trait]
impl ConfigService for InMemoryConfigService {
    async fn collection(&self, ns: &Namespace) -> Result<Option<CollectionRouting>> {
        self.check_reachable()?;
        Ok(self.collections.read().get(ns).cloned())
    }

    async fn commit_migration(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        from: &ShardId,
        to: &ShardId,
    ) -> Result<ChunkVersion> {
        self.check_reachable()?;
        let mut collections = self.collections.write();
        let routing = collections
            .get_mut(ns)
            .ok_or_else(|| Error::Unsharded(ns.clone()))?;

        let idx = routing
            .chunks
            .iter()
            .position(|c| &c.range == range)
            .ok_or_else(|| Error::CommitFailed(format!("no chunk {} in {}", range, ns)))?;
        if &routing.chunks[idx].owner == to {
            return Ok(routing.chunks[idx].version);
        }
        if &routing.chunks[idx].owner != from {
            return Err(Error::CommitFailed(format!(
                "chunk {} of {} is owned by {}, not {}",
                range, ns, routing.chunks[idx].owner, from
            )));
        }

        let major = routing.coll_version().major + 1;
        let migrated = ChunkVersion::new(major, 0, routing.epoch);
        routing.chunks[idx].owner = to.clone();
        routing.chunks[idx].version = migrated;

        // The donor's lowest remaining chunk carries the donor's new version.
        if let Some(donor_chunk) = routing
            .chunks
            .iter_mut()
            .filter(|c| &c.owner == from)
            .min_by(|a, b| a.range.min().cmp(b.range.min()))
        {
            donor_chunk.version = ChunkVersion::new(major, 1, routing.epoch);
        }

        tracing::info!(ns = %ns, range = %range, from = %from, to = %to, version = %migrated, "migration committed");
        Ok(migrated)
    }
}
