//! Half-open shard key ranges.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::pattern::ShardKey;
use crate::error::{Error, Result};

/// A half-open key range `[min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    min: ShardKey,
    max: ShardKey,
}

impl ChunkRange {
    /// Create a range. Fails unless `min < max` and both bounds have the same arity.
    pub fn new(min: ShardKey, max: ShardKey) -> Result<Self> {
        if min.len() != max.len() {
            return Err(Error::InvalidArgument(format!(
                "range bounds {} and {} have different field counts",
                min, max
            )));
        }
        if min >= max {
            return Err(Error::InvalidArgument(format!(
                "range min {} must be less than max {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Inclusive lower bound.
    pub fn min(&self) -> &ShardKey {
        &self.min
    }

    /// Exclusive upper bound.
    pub fn max(&self) -> &ShardKey {
        &self.max
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &ShardKey) -> bool {
        &self.min <= key && key < &self.max
    }

    /// Whether the two ranges share any key.
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Whether `other` lies entirely inside this range.
    pub fn covers(&self, other: &ChunkRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(ShardKey::single(min), ShardKey::single(max)).unwrap()
    }

    #[test]
    fn test_half_open_bounds() {
        let r = range(0, 10);
        assert!(r.contains(&ShardKey::single(0)));
        assert!(r.contains(&ShardKey::single(9)));
        assert!(!r.contains(&ShardKey::single(10)));
    }

    #[test]
    fn test_overlap_and_cover() {
        assert!(range(0, 10).overlaps(&range(5, 15)));
        assert!(!range(0, 10).overlaps(&range(10, 20)));
        assert!(range(0, 10).covers(&range(2, 10)));
        assert!(!range(0, 10).covers(&range(2, 11)));
    }

    #[test]
    fn test_bound_accessors() {
        let r = range(3, 7);
        let (min, max): (&ShardKey, &ShardKey) = (r.min(), r.max());
        assert_eq!(min, &ShardKey::single(3));
        assert_eq!(max, &ShardKey::single(7));
        assert_eq!(r.to_string(), format!("[{}, {})", min, max));
    }

    #[test]
    fn test_rejects_empty_or_inverted() {
        assert!(ChunkRange::new(ShardKey::single(5), ShardKey::single(5)).is_err());
        assert!(ChunkRange::new(ShardKey::single(6), ShardKey::single(5)).is_err());
    }
}
