//! Chunks and chunk versions.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::keys::{ChunkRange, ShardKeyPattern};
use crate::types::ShardId;

/// Version of a chunk or of a whole collection.
///
/// Versions are ordered by `(major, minor)` within one epoch. Versions from
/// different epochs are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub major: u32,
    pub minor: u32,
    pub epoch: Uuid,
}

impl ChunkVersion {
    pub fn new(major: u32, minor: u32, epoch: Uuid) -> Self {
        Self {
            major,
            minor,
            epoch,
        }
    }

    /// `0|0` in the given epoch; the version of a shard that owns nothing.
    pub fn zero(epoch: Uuid) -> Self {
        Self::new(0, 0, epoch)
    }

    pub fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0
    }

    /// Compare within one epoch.
    pub fn cmp_in_epoch(&self, other: &ChunkVersion) -> Option<Ordering> {
        (self.epoch == other.epoch).then(|| (self.major, self.minor).cmp(&(other.major, other.minor)))
    }

    /// The larger of two versions of the same epoch.
    pub fn max_in_epoch(self, other: ChunkVersion) -> ChunkVersion {
        match self.cmp_in_epoch(&other) {
            Some(Ordering::Less) => other,
            _ => self,
        }
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

/// A committed chunk: a key range owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub range: ChunkRange,
    pub owner: ShardId,
    pub version: ChunkVersion,
}

impl Chunk {
    pub fn new(range: ChunkRange, owner: ShardId, version: ChunkVersion) -> Self {
        Self {
            range,
            owner,
            version,
        }
    }
}

/// Check that `chunks` partition the whole key space of `pattern` with no gaps
/// or overlaps.
pub fn validate_partition(pattern: &ShardKeyPattern, chunks: &[Chunk]) -> Result<()> {
    let mut sorted: Vec<&Chunk> = chunks.iter().collect();
    sorted.sort_by(|a, b| a.range.min().cmp(b.range.min()));

    let mut expected_min = pattern.global_min();
    for chunk in sorted {
        if chunk.range.min() != &expected_min {
            return Err(Error::Internal(format!(
                "chunk {} does not start at {}: chunks must cover the key space without gaps or overlaps",
                chunk.range, expected_min
            )));
        }
        expected_min = chunk.range.max().clone();
    }
    if expected_min != pattern.global_max() {
        return Err(Error::Internal(format!(
            "chunks end at {} instead of the global maximum",
            expected_min
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ShardKey, Value};

    fn chunk(min: Value, max: Value, owner: &str) -> Chunk {
        Chunk::new(
            ChunkRange::new(ShardKey::new(vec![min]), ShardKey::new(vec![max])).unwrap(),
            ShardId::new(owner),
            ChunkVersion::new(1, 0, Uuid::nil()),
        )
    }

    #[test]
    fn test_partition_ok() {
        let pattern = ShardKeyPattern::ascending(&["_id"]).unwrap();
        let chunks = vec![
            chunk(Value::Int(0), Value::MaxKey, "s1"),
            chunk(Value::MinKey, Value::Int(0), "s0"),
        ];
        validate_partition(&pattern, &chunks).unwrap();
    }

    #[test]
    fn test_partition_gap_or_overlap() {
        let pattern = ShardKeyPattern::ascending(&["_id"]).unwrap();
        let gap = vec![
            chunk(Value::MinKey, Value::Int(0), "s0"),
            chunk(Value::Int(1), Value::MaxKey, "s1"),
        ];
        assert!(validate_partition(&pattern, &gap).is_err());

        let overlap = vec![
            chunk(Value::MinKey, Value::Int(5), "s0"),
            chunk(Value::Int(1), Value::MaxKey, "s1"),
        ];
        assert!(validate_partition(&pattern, &overlap).is_err());

        let short = vec![chunk(Value::MinKey, Value::Int(5), "s0")];
        assert!(validate_partition(&pattern, &short).is_err());
    }

    #[test]
    fn test_version_ordering_within_epoch() {
        let epoch = Uuid::new_v4();
        let v1 = ChunkVersion::new(1, 3, epoch);
        let v2 = ChunkVersion::new(2, 0, epoch);
        assert_eq!(v1.cmp_in_epoch(&v2), Some(Ordering::Less));
        assert_eq!(v1.max_in_epoch(v2), v2);
        assert_eq!(v1.cmp_in_epoch(&ChunkVersion::new(2, 0, Uuid::new_v4())), None);
    }
}
