//! Configuration types for a shard node.

use crate::types::ShardId;
use std::time::Duration;

/// Main configuration for one shard (replica-set primary plus its secondaries).
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Unique identifier for this shard.
    pub shard_id: ShardId,

    /// Replica-set and write-acknowledgement configuration.
    pub replication: ReplicationConfig,

    /// Chunk migration configuration (donor and recipient).
    pub migration: MigrationConfig,

    /// Orphan cleanup configuration.
    pub cleanup: CleanupConfig,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shard_id: ShardId::new("shard0000"),
            replication: ReplicationConfig::default(),
            migration: MigrationConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl ShardConfig {
    /// Create a configuration for the given shard with production defaults.
    pub fn new(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            ..Default::default()
        }
    }

    /// Configuration with short timeouts, suitable for tests.
    pub fn for_tests(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            replication: ReplicationConfig::for_tests(),
            migration: MigrationConfig::for_tests(),
            cleanup: CleanupConfig::default(),
        }
    }

    /// Set replication configuration.
    pub fn with_replication_config(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Set migration configuration.
    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Set cleanup configuration.
    pub fn with_cleanup_config(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Set the number of replica-set members (primary included).
    pub fn with_members(mut self, members: usize) -> Self {
        self.replication.members = members;
        self
    }

    /// Set the majority-acknowledgement timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.replication.ack_timeout = timeout;
        self
    }
}

/// Replica-set configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Number of members, primary included. Majority is `members / 2 + 1`.
    pub members: usize,

    /// How long destructive writes wait for majority acknowledgement.
    pub ack_timeout: Duration,

    /// How often a secondary's applier polls when idle or stopped.
    pub apply_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            members: 3,
            ack_timeout: Duration::from_secs(3600), // 1 hour
            apply_interval: Duration::from_millis(10),
        }
    }
}

impl ReplicationConfig {
    /// Two members and a one second acknowledgement timeout.
    pub fn for_tests() -> Self {
        Self {
            members: 2,
            ack_timeout: Duration::from_secs(1),
            apply_interval: Duration::from_millis(5),
        }
    }

    /// Number of acknowledgements that form a majority.
    pub fn majority(&self) -> usize {
        self.members / 2 + 1
    }
}

/// Chunk migration configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Documents per clone batch pulled by the recipient.
    pub clone_batch_size: usize,

    /// Interval between donor polls of the recipient's status.
    pub status_poll_interval: Duration,

    /// Maximum time the donor waits for the recipient to catch up.
    pub clone_timeout: Duration,

    /// Maximum time the recipient's commit call waits for `Done`.
    pub commit_timeout: Duration,

    /// Maximum time the recipient polls the config service before promoting
    /// its pending range.
    pub promote_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: 1000,
            status_poll_interval: Duration::from_millis(100),
            clone_timeout: Duration::from_secs(600),
            commit_timeout: Duration::from_secs(30),
            promote_timeout: Duration::from_secs(30),
        }
    }
}

impl MigrationConfig {
    /// Short timeouts and small batches.
    pub fn for_tests() -> Self {
        Self {
            clone_batch_size: 16,
            status_poll_interval: Duration::from_millis(5),
            clone_timeout: Duration::from_secs(10),
            commit_timeout: Duration::from_secs(5),
            promote_timeout: Duration::from_secs(2),
        }
    }

    /// Set the clone batch size.
    pub fn with_clone_batch_size(mut self, size: usize) -> Self {
        self.clone_batch_size = size.max(1);
        self
    }

    /// Set the clone timeout.
    pub fn with_clone_timeout(mut self, timeout: Duration) -> Self {
        self.clone_timeout = timeout;
        self
    }
}

/// Orphan cleanup configuration.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Maximum deletions per `cleanupOrphaned` call.
    pub max_docs_per_batch: usize,

    /// Maximum wall time per `cleanupOrphaned` call.
    pub max_batch_duration: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_docs_per_batch: 10_000,
            max_batch_duration: Duration::from_secs(5),
        }
    }
}

impl CleanupConfig {
    /// Set the per-call deletion budget.
    pub fn with_max_docs_per_batch(mut self, max: usize) -> Self {
        self.max_docs_per_batch = max.max(1);
        self
    }

    /// Set the per-call time budget.
    pub fn with_max_batch_duration(mut self, duration: Duration) -> Self {
        self.max_batch_duration = duration;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority() {
        let mut config = ReplicationConfig::default();
        assert_eq!(config.majority(), 2);
        config.members = 2;
        assert_eq!(config.majority(), 2);
        config.members = 5;
        assert_eq!(config.majority(), 3);
        config.members = 1;
        assert_eq!(config.majority(), 1);
    }

    #[test]
    fn test_timeout_defaults() {
        assert_eq!(
            ShardConfig::new("s0").replication.ack_timeout,
            Duration::from_secs(3600)
        );
        assert_eq!(
            ShardConfig::for_tests("s0").replication.ack_timeout,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_builders() {
        let config = ShardConfig::for_tests("s1")
            .with_members(3)
            .with_cleanup_config(CleanupConfig::default().with_max_docs_per_batch(0));
        assert_eq!(config.shard_id.as_str(), "s1");
        assert_eq!(config.replication.members, 3);
        assert_eq!(config.cleanup.max_docs_per_batch, 1);
    }
}
