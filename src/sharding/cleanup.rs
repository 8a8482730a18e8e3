//! Orphan cleanup: delete local documents in ranges this shard neither owns
//! nor is receiving.

use std::sync::Arc;

use super::range_deleter::{DeleteBudget, RangeDeleter};
use crate::config::CleanupConfig;
use crate::error::{Error, Result};
use crate::keys::{ChunkRange, Document, ShardKey};
use crate::metadata::MetadataStore;
use crate::metrics::ShardingMetrics;
use crate::types::Namespace;

/// Result of one `cleanupOrphaned` call.
#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    /// Where the next call should start. `None` once the end of the key
    /// space has been reached.
    pub stopped_at_key: Option<ShardKey>,
    /// Documents deleted by this call.
    pub deleted: u64,
    /// The orphan range that was processed, if any.
    pub range: Option<ChunkRange>,
}

/// Reconciles stored documents against the shard's ownership metadata.
///
/// Each call handles at most one orphan range and at most one budget's worth
/// of deletions, so callers loop on `stopped_at_key` until it is `None`.
pub struct OrphanCleaner {
    metadata: Arc<MetadataStore>,
    deleter: Arc<RangeDeleter>,
    config: CleanupConfig,
    metrics: Arc<ShardingMetrics>,
}

impl OrphanCleaner {
    pub fn new(
        metadata: Arc<MetadataStore>,
        deleter: Arc<RangeDeleter>,
        config: CleanupConfig,
        metrics: Arc<ShardingMetrics>,
    ) -> Self {
        Self {
            metadata,
            deleter,
            config,
            metrics,
        }
    }

    /// Delete orphaned documents in the first orphan range at or after
    /// `starting_from_key`.
    pub async fn cleanup_orphaned(
        &self,
        ns: &Namespace,
        starting_from_key: Option<&Document>,
        secondary_throttle: bool,
    ) -> Result<CleanupOutcome> {
        let snapshot = match self.metadata.reload(ns).await {
            Ok(snapshot) => snapshot,
            Err(Error::ConfigUnreachable(reason)) => {
                tracing::warn!(ns = %ns, %reason, "could not refresh metadata, cleaning up with cached metadata");
                self.metadata.get_metadata(ns)
            }
            Err(e) => return Err(e),
        };
        let Some(snapshot) = snapshot else {
            tracing::info!(ns = %ns, "collection is not sharded, nothing to clean up");
            return Ok(CleanupOutcome::default());
        };

        let pattern = snapshot.key_pattern();
        let from = match starting_from_key {
            Some(doc) => pattern.parse_key(doc)?,
            None => pattern.global_min(),
        };

        let Some(orphan_range) = snapshot.next_orphan_range(&from) else {
            tracing::info!(ns = %ns, from = %from, "no orphan ranges remain");
            self.metrics.record_cleanup(0);
            return Ok(CleanupOutcome::default());
        };

        tracing::info!(
            ns = %ns,
            range = %orphan_range,
            shard_version = %snapshot.shard_version(),
            secondary_throttle,
            "deleting orphaned documents"
        );

        let metadata = &self.metadata;
        let outcome = self
            .deleter
            .delete_range(
                ns,
                pattern,
                &orphan_range,
                |key| {
                    // A range reserved after the snapshot was taken is not orphaned either.
                    !snapshot.is_owned_or_pending(key)
                        && metadata
                            .get_metadata(ns)
                            .map_or(true, |latest| !latest.is_owned_or_pending(key))
                },
                DeleteBudget::from(&self.config),
                secondary_throttle,
            )
            .await
            .map_err(|e| {
                tracing::warn!(ns = %ns, range = %orphan_range, error = %e, "orphan cleanup aborted");
                e
            })?;

        let stopped_at_key = if outcome.stopped_early {
            outcome.last_deleted.clone()
        } else if orphan_range.max() == &pattern.global_max() {
            None
        } else {
            Some(orphan_range.max().clone())
        };

        self.metrics.record_cleanup(outcome.deleted);
        tracing::info!(
            ns = %ns,
            range = %orphan_range,
            deleted = outcome.deleted,
            stopped_at_key = ?stopped_at_key.as_ref().map(|k| k.to_string()),
            "orphan cleanup batch finished"
        );

        Ok(CleanupOutcome {
            stopped_at_key,
            deleted: outcome.deleted,
            range: Some(orphan_range),
        })
    }
}
