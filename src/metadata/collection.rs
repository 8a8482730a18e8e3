//! Immutable per-collection ownership snapshot.

use std::collections::BTreeMap;
use uuid::Uuid;

use super::chunk::{validate_partition, Chunk, ChunkVersion};
use super::config_service::CollectionRouting;
use crate::error::{Error, Result};
use crate::keys::{ChunkRange, ShardKey, ShardKeyPattern};
use crate::types::{Namespace, ShardId};

/// What one shard knows about one sharded collection.
///
/// Snapshots are never mutated; every change produces a new snapshot through
/// one of the `clone_*` methods, and readers hold an `Arc` for the duration of
/// an operation.
#[derive(Debug, Clone)]
pub struct CollectionMetadata {
    ns: Namespace,
    shard_id: ShardId,
    key_pattern: ShardKeyPattern,
    coll_version: ChunkVersion,
    shard_version: ChunkVersion,
    /// Chunks owned by this shard, keyed by min.
    chunks: BTreeMap<ShardKey, Chunk>,
    /// Ranges being received by this shard, keyed by min.
    pending: BTreeMap<ShardKey, ChunkRange>,
}

impl CollectionMetadata {
    /// Build the snapshot for `shard_id` from the authoritative chunk table.
    pub fn from_routing(shard_id: &ShardId, routing: &CollectionRouting) -> Result<Self> {
        validate_partition(&routing.key_pattern, &routing.chunks)?;

        let mut coll_version = ChunkVersion::zero(routing.epoch);
        let mut chunks = BTreeMap::new();
        for chunk in &routing.chunks {
            if chunk.version.epoch != routing.epoch {
                return Err(Error::Internal(format!(
                    "chunk {} of {} has epoch {} but the collection epoch is {}",
                    chunk.range, routing.ns, chunk.version.epoch, routing.epoch
                )));
            }
            coll_version = coll_version.max_in_epoch(chunk.version);
            if &chunk.owner == shard_id {
                chunks.insert(chunk.range.min().clone(), chunk.clone());
            }
        }

        let mut metadata = Self {
            ns: routing.ns.clone(),
            shard_id: shard_id.clone(),
            key_pattern: routing.key_pattern.clone(),
            coll_version,
            shard_version: ChunkVersion::zero(routing.epoch),
            chunks,
            pending: BTreeMap::new(),
        };
        metadata.recompute_shard_version();
        Ok(metadata)
    }

    fn recompute_shard_version(&mut self) {
        let epoch = self.epoch();
        self.shard_version = self
            .chunks
            .values()
            .fold(ChunkVersion::zero(epoch), |v, c| v.max_in_epoch(c.version));
    }

    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn key_pattern(&self) -> &ShardKeyPattern {
        &self.key_pattern
    }

    pub fn epoch(&self) -> Uuid {
        self.coll_version.epoch
    }

    /// Highest chunk version of the collection across all shards.
    pub fn coll_version(&self) -> ChunkVersion {
        self.coll_version
    }

    /// Highest chunk version owned by this shard, `0|0` if none.
    pub fn shard_version(&self) -> ChunkVersion {
        self.shard_version
    }

    /// Chunks owned by this shard in key order.
    pub fn owned_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Pending ranges in key order.
    pub fn pending_ranges(&self) -> impl Iterator<Item = &ChunkRange> {
        self.pending.values()
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// The owned chunk containing `key`.
    pub fn chunk_containing(&self, key: &ShardKey) -> Option<&Chunk> {
        self.chunks
            .range(..=key.clone())
            .next_back()
            .map(|(_, c)| c)
            .filter(|c| c.range.contains(key))
    }

    /// The owned chunk with exactly these bounds.
    pub fn chunk_with_bounds(&self, range: &ChunkRange) -> Option<&Chunk> {
        self.chunks
            .get(range.min())
            .filter(|c| c.range.max() == range.max())
    }

    /// Whether `key` lies in a chunk owned by this shard.
    pub fn key_belongs_to_me(&self, key: &ShardKey) -> bool {
        self.chunk_containing(key).is_some()
    }

    /// Whether `key` lies in a pending range.
    pub fn key_is_pending(&self, key: &ShardKey) -> bool {
        self.pending
            .range(..=key.clone())
            .next_back()
            .map(|(_, r)| r.contains(key))
            .unwrap_or(false)
    }

    /// Whether `key` is owned or pending; keys that are neither are orphans.
    pub fn is_owned_or_pending(&self, key: &ShardKey) -> bool {
        self.key_belongs_to_me(key) || self.key_is_pending(key)
    }

    /// Whether any owned chunk overlaps `range`.
    pub fn overlaps_owned(&self, range: &ChunkRange) -> bool {
        self.chunks.values().any(|c| c.range.overlaps(range))
    }

    /// Whether every key of `range` is in an owned chunk.
    pub fn owns_range(&self, range: &ChunkRange) -> bool {
        let mut cursor = range.min().clone();
        for chunk in self.chunks.values() {
            if chunk.range.max() <= &cursor {
                continue;
            }
            if chunk.range.min() > &cursor {
                return false;
            }
            cursor = chunk.range.max().clone();
            if &cursor >= range.max() {
                return true;
            }
        }
        false
    }

    /// Owned and pending ranges merged into one key-ordered list.
    fn taken_ranges(&self) -> Vec<&ChunkRange> {
        let mut taken: Vec<&ChunkRange> = self
            .chunks
            .values()
            .map(|c| &c.range)
            .chain(self.pending.values())
            .collect();
        taken.sort_by(|a, b| a.min().cmp(b.min()));
        taken
    }

    /// The next orphan range: the first gap between owned and pending ranges
    /// that contains or follows `from`. The returned gap is complete, so its
    /// lower bound may precede `from`.
    pub fn next_orphan_range(&self, from: &ShardKey) -> Option<ChunkRange> {
        let global_min = self.key_pattern.global_min();
        let global_max = self.key_pattern.global_max();
        let taken = self.taken_ranges();

        let mut cursor = from.clone();
        loop {
            if cursor >= global_max {
                return None;
            }
            if let Some(r) = taken.iter().find(|r| r.contains(&cursor)) {
                cursor = r.max().clone();
                continue;
            }
            let gap_min = taken
                .iter()
                .filter(|r| r.max() <= &cursor)
                .map(|r| r.max())
                .max()
                .cloned()
                .unwrap_or_else(|| global_min.clone());
            let gap_max = taken
                .iter()
                .find(|r| r.min() > &cursor)
                .map(|r| r.min().clone())
                .unwrap_or_else(|| global_max.clone());
            return ChunkRange::new(gap_min, gap_max).ok();
        }
    }

    /// Snapshot with `range` added as pending. Overlapping pending ranges are
    /// replaced. Fails if `range` overlaps an owned chunk.
    pub fn clone_plus_pending(&self, range: &ChunkRange) -> Result<Self> {
        if let Some(owned) = self.chunks.values().find(|c| c.range.overlaps(range)) {
            return Err(Error::InvalidArgument(format!(
                "cannot add pending range {} to {}: it overlaps owned chunk {}",
                range, self.ns, owned.range
            )));
        }
        let mut next = self.clone();
        next.pending.retain(|_, p| !p.overlaps(range));
        next.pending.insert(range.min().clone(), range.clone());
        Ok(next)
    }

    /// Snapshot with the pending `range` removed. Unknown ranges are ignored.
    pub fn clone_minus_pending(&self, range: &ChunkRange) -> Self {
        let mut next = self.clone();
        if next.pending.get(range.min()) == Some(range) {
            next.pending.remove(range.min());
        }
        next
    }

    /// Snapshot with `range` owned by this shard at `version`. Pending ranges
    /// overlapping it are dropped.
    pub fn clone_plus_chunk(&self, range: &ChunkRange, version: ChunkVersion) -> Result<Self> {
        self.check_epoch(version)?;
        if let Some(owned) = self.chunks.values().find(|c| c.range.overlaps(range)) {
            return Err(Error::InvalidArgument(format!(
                "cannot add chunk {} to {}: it overlaps owned chunk {}",
                range, self.ns, owned.range
            )));
        }
        let mut next = self.clone();
        next.pending.retain(|_, p| !p.overlaps(range));
        next.chunks.insert(
            range.min().clone(),
            Chunk::new(range.clone(), self.shard_id.clone(), version),
        );
        next.coll_version = next.coll_version.max_in_epoch(version);
        next.recompute_shard_version();
        Ok(next)
    }

    /// Snapshot without the owned chunk `range`, after it moved away at
    /// `version`. The lowest remaining chunk is bumped to `version.major|1`.
    pub fn clone_minus_chunk(&self, range: &ChunkRange, version: ChunkVersion) -> Result<Self> {
        self.check_epoch(version)?;
        if self.chunk_with_bounds(range).is_none() {
            return Err(Error::InvalidArgument(format!(
                "cannot remove chunk {} from {}: not owned by {}",
                range, self.ns, self.shard_id
            )));
        }
        let mut next = self.clone();
        next.chunks.remove(range.min());
        next.coll_version = next.coll_version.max_in_epoch(version);
        if let Some(first) = next.chunks.values_mut().next() {
            first.version = ChunkVersion::new(version.major, 1, version.epoch);
            next.coll_version = next.coll_version.max_in_epoch(first.version);
        }
        next.recompute_shard_version();
        Ok(next)
    }

    fn check_epoch(&self, version: ChunkVersion) -> Result<()> {
        if version.epoch != self.epoch() {
            return Err(Error::StaleShardVersion {
                ns: self.ns.clone(),
                reason: format!(
                    "version {} is from a different epoch than {}",
                    version,
                    self.epoch()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Value;

    fn key(v: i64) -> ShardKey {
        ShardKey::single(v)
    }

    fn range(min: Value, max: Value) -> ChunkRange {
        ChunkRange::new(ShardKey::new(vec![min]), ShardKey::new(vec![max])).unwrap()
    }

    /// s0 owns [MinKey, 0) and [10, 20); s1 owns the rest.
    fn metadata() -> CollectionMetadata {
        let epoch = Uuid::new_v4();
        let routing = CollectionRouting {
            ns: Namespace::new("foo.bar"),
            key_pattern: ShardKeyPattern::ascending(&["_id"]).unwrap(),
            epoch,
            chunks: vec![
                Chunk::new(range(Value::MinKey, Value::Int(0)), "s0".into(), ChunkVersion::new(1, 0, epoch)),
                Chunk::new(range(Value::Int(0), Value::Int(10)), "s1".into(), ChunkVersion::new(2, 0, epoch)),
                Chunk::new(range(Value::Int(10), Value::Int(20)), "s0".into(), ChunkVersion::new(1, 1, epoch)),
                Chunk::new(range(Value::Int(20), Value::MaxKey), "s1".into(), ChunkVersion::new(2, 1, epoch)),
            ],
        };
        CollectionMetadata::from_routing(&ShardId::new("s0"), &routing).unwrap()
    }

    #[test]
    fn test_versions_from_routing() {
        let md = metadata();
        assert_eq!((md.coll_version().major, md.coll_version().minor), (2, 1));
        assert_eq!((md.shard_version().major, md.shard_version().minor), (1, 1));
        assert_eq!(md.num_chunks(), 2);
    }

    #[test]
    fn test_ownership_lookup() {
        let md = metadata();
        assert!(md.key_belongs_to_me(&key(-5)));
        assert!(!md.key_belongs_to_me(&key(5)));
        assert!(md.key_belongs_to_me(&key(10)));
        assert!(!md.key_belongs_to_me(&key(20)));
    }

    #[test]
    fn test_next_orphan_range_walks_gaps() {
        let md = metadata();
        let min = md.key_pattern().global_min();

        let first = md.next_orphan_range(&min).unwrap();
        assert_eq!(first, range(Value::Int(0), Value::Int(10)));

        // From inside a gap, the whole gap is returned.
        assert_eq!(md.next_orphan_range(&key(5)).unwrap(), first);

        let second = md.next_orphan_range(first.max()).unwrap();
        assert_eq!(second, range(Value::Int(20), Value::MaxKey));

        assert!(md.next_orphan_range(second.max()).is_none());
    }

    #[test]
    fn test_pending_closes_gap() {
        let md = metadata()
            .clone_plus_pending(&range(Value::Int(0), Value::Int(10)))
            .unwrap();
        assert!(md.key_is_pending(&key(3)));
        assert!(md.is_owned_or_pending(&key(3)));
        assert_eq!(
            md.next_orphan_range(&md.key_pattern().global_min()).unwrap(),
            range(Value::Int(20), Value::MaxKey)
        );

        let md = md.clone_minus_pending(&range(Value::Int(0), Value::Int(10)));
        assert!(!md.key_is_pending(&key(3)));
    }

    #[test]
    fn test_pending_rejects_owned_overlap() {
        let md = metadata();
        assert!(md.clone_plus_pending(&range(Value::Int(15), Value::Int(25))).is_err());
    }

    #[test]
    fn test_chunk_moves_in_and_out() {
        let md = metadata();
        let epoch = md.epoch();
        let incoming = range(Value::Int(0), Value::Int(10));
        let md = md
            .clone_plus_pending(&incoming)
            .unwrap()
            .clone_plus_chunk(&incoming, ChunkVersion::new(3, 0, epoch))
            .unwrap();
        assert_eq!(md.num_pending(), 0);
        assert!(md.owns_range(&range(Value::MinKey, Value::Int(20))));
        assert_eq!(md.shard_version().major, 3);

        let md = md
            .clone_minus_chunk(&range(Value::MinKey, Value::Int(0)), ChunkVersion::new(4, 0, epoch))
            .unwrap()
            .clone_minus_chunk(&incoming, ChunkVersion::new(5, 0, epoch))
            .unwrap()
            .clone_minus_chunk(&range(Value::Int(10), Value::Int(20)), ChunkVersion::new(6, 0, epoch))
            .unwrap();
        assert_eq!(md.num_chunks(), 0);
        assert!(md.shard_version().is_zero());
        assert_eq!(md.shard_version().epoch, epoch);
        assert_eq!(md.coll_version().major, 6);
    }

    #[test]
    fn test_remove_unowned_chunk_fails() {
        let md = metadata();
        let epoch = md.epoch();
        assert!(md
            .clone_minus_chunk(&range(Value::Int(0), Value::Int(10)), ChunkVersion::new(3, 0, epoch))
            .is_err());
        assert!(md
            .clone_plus_chunk(&range(Value::Int(0), Value::Int(10)), ChunkVersion::new(3, 0, Uuid::new_v4()))
            .is_err());
    }
}
