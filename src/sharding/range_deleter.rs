//! Replicated deletion of the documents in a key range.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CleanupConfig;
use crate::error::Result;
use crate::failpoint::{FailpointRegistry, RANGE_DELETER_WTIMEOUT};
use crate::keys::{ChunkRange, Document, ShardKey, ShardKeyPattern};
use crate::metrics::ShardingMetrics;
use crate::replication::{OpTime, ReplicaSet};
use crate::types::Namespace;

/// Limits on the work done by one deletion pass.
#[derive(Debug, Clone, Copy)]
pub struct DeleteBudget {
    pub max_docs: usize,
    pub max_duration: Duration,
}

impl DeleteBudget {
    /// No limit.
    pub fn unbounded() -> Self {
        Self {
            max_docs: usize::MAX,
            max_duration: Duration::MAX,
        }
    }
}

impl From<&CleanupConfig> for DeleteBudget {
    fn from(config: &CleanupConfig) -> Self {
        Self {
            max_docs: config.max_docs_per_batch.max(1),
            max_duration: config.max_batch_duration,
        }
    }
}

/// Result of one deletion pass.
#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    /// Documents deleted.
    pub deleted: u64,
    /// Shard key of the last deleted document.
    pub last_deleted: Option<ShardKey>,
    /// The budget ran out before the range was fully scanned.
    pub stopped_early: bool,
}

/// Deletes documents through the replica set and gates completion on
/// majority acknowledgement.
///
/// Deletes are applied locally first. If acknowledgement does not arrive in
/// time the pass fails with a replication timeout, and the local deletes stay.
pub struct RangeDeleter {
    replica_set: Arc<ReplicaSet>,
    failpoints: Arc<FailpointRegistry>,
    metrics: Arc<ShardingMetrics>,
}

impl RangeDeleter {
    pub fn new(
        replica_set: Arc<ReplicaSet>,
        failpoints: Arc<FailpointRegistry>,
        metrics: Arc<ShardingMetrics>,
    ) -> Self {
        Self {
            replica_set,
            failpoints,
            metrics,
        }
    }

    /// Acknowledgement timeout for deletions. `rangeDeleterWTimeout` with
    /// `{seconds: N}` overrides the replica set's configured timeout.
    pub fn ack_timeout(&self) -> Duration {
        match self.failpoints.data_i64(RANGE_DELETER_WTIMEOUT, "seconds") {
            Some(secs) if secs >= 0 => Duration::from_secs(secs as u64),
            _ => self.replica_set.config().ack_timeout,
        }
    }

    /// Delete documents in `range` whose shard key passes `should_delete`,
    /// in shard-key order.
    ///
    /// With `throttle`, every delete waits for majority acknowledgement;
    /// otherwise only the last one does.
    pub async fn delete_range<F>(
        &self,
        ns: &Namespace,
        pattern: &ShardKeyPattern,
        range: &ChunkRange,
        should_delete: F,
        budget: DeleteBudget,
        throttle: bool,
    ) -> Result<DeleteOutcome>
    where
        F: Fn(&ShardKey) -> bool,
    {
        let timeout = self.ack_timeout();
        let started = Instant::now();
        let candidates = self.replica_set.primary().scan_range(ns, pattern, range);

        let mut outcome = DeleteOutcome::default();
        let mut unacked: Option<OpTime> = None;
        for (key, doc) in candidates {
            if !should_delete(&key) {
                continue;
            }
            if outcome.deleted > 0
                && (outcome.deleted as usize >= budget.max_docs
                    || started.elapsed() >= budget.max_duration)
            {
                outcome.stopped_early = true;
                break;
            }
            let Some(id) = doc.id() else {
                continue;
            };
            // Ownership can change between the scan and the delete.
            let still_orphaned = |current: &Document| {
                let key = pattern.extract_key(current);
                range.contains(&key) && should_delete(&key)
            };
            let Some(op_time) = self.replica_set.delete_if(ns, id, still_orphaned)? else {
                continue;
            };
            outcome.deleted += 1;
            outcome.last_deleted = Some(key);
            if throttle {
                self.await_ack(op_time, timeout).await?;
            } else {
                unacked = Some(op_time);
            }
        }

        if let Some(op_time) = unacked {
            self.await_ack(op_time, timeout).await?;
        }

        tracing::debug!(
            ns = %ns,
            range = %range,
            deleted = outcome.deleted,
            stopped_early = outcome.stopped_early,
            "range deletion pass finished"
        );
        Ok(outcome)
    }

    async fn await_ack(&self, op_time: OpTime, timeout: Duration) -> Result<()> {
        let result = self.replica_set.wait_for_majority(op_time, timeout).await;
        if result.is_err() {
            self.metrics.replication_timeouts.inc();
        }
        result
    }
}
