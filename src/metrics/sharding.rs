//! Per-node metrics for chunk migration and orphan cleanup.

use std::time::Duration;

use super::{render_prometheus, Counter, Gauge};

/// Metrics for one shard node.
#[derive(Debug)]
pub struct ShardingMetrics {
    /// Donor migrations currently running.
    pub migrations_active: Gauge,
    /// Donor migrations started.
    pub migrations_started: Counter,
    /// Donor migrations that reached the commit point.
    pub migrations_committed: Counter,
    /// Donor migrations aborted before the commit point.
    pub migrations_aborted: Counter,
    /// Duration of the last committed migration.
    pub last_migration_millis: Gauge,
    /// Documents cloned by this node as a recipient.
    pub docs_cloned: Counter,
    /// Buffered modifications applied by this node as a recipient.
    pub mods_applied: Counter,
    /// Documents deleted after a chunk moved away.
    pub post_move_deleted: Counter,
    /// `cleanupOrphaned` calls that completed.
    pub cleanup_batches: Counter,
    /// Orphaned documents deleted.
    pub orphans_deleted: Counter,
    /// Majority-acknowledgement waits that timed out.
    pub replication_timeouts: Counter,
}

impl Default for ShardingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardingMetrics {
    pub fn new() -> Self {
        Self {
            migrations_active: Gauge::new("migrations_active", "Number of running donor migrations"),
            migrations_started: Counter::new("migrations_started", "Total donor migrations started"),
            migrations_committed: Counter::new("migrations_committed", "Total donor migrations committed"),
            migrations_aborted: Counter::new("migrations_aborted", "Total donor migrations aborted"),
            last_migration_millis: Gauge::new("last_migration_millis", "Duration of the last committed migration"),
            docs_cloned: Counter::new("migration_docs_cloned", "Total documents cloned as recipient"),
            mods_applied: Counter::new("migration_mods_applied", "Total transferred modifications applied"),
            post_move_deleted: Counter::new("post_move_docs_deleted", "Total documents deleted after a chunk moved away"),
            cleanup_batches: Counter::new("cleanup_orphaned_batches", "Total cleanupOrphaned calls completed"),
            orphans_deleted: Counter::new("orphans_deleted", "Total orphaned documents deleted"),
            replication_timeouts: Counter::new("replication_timeouts", "Total majority-acknowledgement timeouts"),
        }
    }

    pub fn record_migration_start(&self) {
        self.migrations_started.inc();
        self.migrations_active.inc();
    }

    pub fn record_migration_committed(&self, duration: Duration) {
        self.migrations_committed.inc();
        self.last_migration_millis.set(duration.as_millis() as i64);
    }

    pub fn record_migration_aborted(&self) {
        self.migrations_aborted.inc();
    }

    pub fn record_migration_end(&self) {
        self.migrations_active.dec();
    }

    pub fn record_cleanup(&self, deleted: u64) {
        self.cleanup_batches.inc();
        self.orphans_deleted.inc_by(deleted);
    }

    /// Point-in-time copy of the values.
    pub fn snapshot(&self) -> ShardingMetricsSnapshot {
        ShardingMetricsSnapshot {
            migrations_active: self.migrations_active.get(),
            migrations_started: self.migrations_started.get(),
            migrations_committed: self.migrations_committed.get(),
            migrations_aborted: self.migrations_aborted.get(),
            docs_cloned: self.docs_cloned.get(),
            mods_applied: self.mods_applied.get(),
            post_move_deleted: self.post_move_deleted.get(),
            cleanup_batches: self.cleanup_batches.get(),
            orphans_deleted: self.orphans_deleted.get(),
            replication_timeouts: self.replication_timeouts.get(),
        }
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> String {
        render_prometheus(
            &[
                &self.migrations_started,
                &self.migrations_committed,
                &self.migrations_aborted,
                &self.docs_cloned,
                &self.mods_applied,
                &self.post_move_deleted,
                &self.cleanup_batches,
                &self.orphans_deleted,
                &self.replication_timeouts,
            ],
            &[&self.migrations_active, &self.last_migration_millis],
        )
    }
}

/// Values of [`ShardingMetrics`] at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardingMetricsSnapshot {
    pub migrations_active: i64,
    pub migrations_started: u64,
    pub migrations_committed: u64,
    pub migrations_aborted: u64,
    pub docs_cloned: u64,
    pub mods_applied: u64,
    pub post_move_deleted: u64,
    pub cleanup_batches: u64,
    pub orphans_deleted: u64,
    pub replication_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_lifecycle() {
        let metrics = ShardingMetrics::new();
        metrics.record_migration_start();
        assert_eq!(metrics.snapshot().migrations_active, 1);
        metrics.record_migration_committed(Duration::from_millis(25));
        metrics.record_migration_end();

        let snap = metrics.snapshot();
        assert_eq!(snap.migrations_active, 0);
        assert_eq!(snap.migrations_started, 1);
        assert_eq!(snap.migrations_committed, 1);
        assert_eq!(metrics.last_migration_millis.get(), 25);
    }

    #[test]
    fn test_cleanup_counts() {
        let metrics = ShardingMetrics::new();
        metrics.record_cleanup(3);
        metrics.record_cleanup(0);
        let snap = metrics.snapshot();
        assert_eq!(snap.cleanup_batches, 2);
        assert_eq!(snap.orphans_deleted, 3);
        assert!(metrics.render().contains("orphans_deleted 3"));
    }
}
