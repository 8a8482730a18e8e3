//! Multi-shard test harness and end-to-end scenarios.
//!
//! [`TestCluster`] wires a config service, the migration lock table, an
//! in-process network, a router and N shard nodes with two-member replica
//! sets and shortened timeouts.
//!
//! ```text
//!   ┌────────────┐      ┌────────────────────┐
//!   │ RouterNode │─────▶│ InMemoryConfigSvc  │◀──────┐
//!   └─────┬──────┘      └────────────────────┘       │ reload / commit
//!         │                                          │
//!         ▼                                          │
//!   ┌───────────┐   InProcessNetwork   ┌───────────┐ │
//!   │ shard0000 │◀────────────────────▶│ shard0001 │─┘
//!   └───────────┘                      └───────────┘
//!         └──────── DistLockManager ─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = TestCluster::new(2);
//! let ns = Namespace::new("foo.bar");
//! cluster.shard_collection(&ns, ShardKeyPattern::ascending(&["_id"])?).await?;
//! cluster.split(&ns, ShardKey::single(0)).await?;
//! cluster.shard(0).move_chunk(MoveChunkRequest::with_bounds(ns.clone(), range, "shard0001")).await?;
//! ```

mod utils;

mod migration_tests;

pub use utils::{wait_for_result, wait_until};

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::command::RouterNode;
use crate::config::ShardConfig;
use crate::error::Result;
use crate::keys::{ChunkRange, Document, ShardKey, ShardKeyPattern, Value};
use crate::metadata::InMemoryConfigService;
use crate::node::ShardNode;
use crate::rpc::InProcessNetwork;
use crate::sharding::{DistLockManager, MoveChunkRequest};
use crate::types::{Namespace, ShardId};

/// Name of the `i`th shard, e.g. `shard0001`.
pub fn shard_name(i: usize) -> ShardId {
    ShardId::new(format!("shard{:04}", i))
}

/// `[min, max)` over a single-field shard key.
pub fn key_range(min: impl Into<Value>, max: impl Into<Value>) -> ChunkRange {
    match ChunkRange::new(ShardKey::single(min), ShardKey::single(max)) {
        Ok(range) => range,
        Err(e) => panic!("bad test range: {}", e),
    }
}

/// A cluster of shard nodes for integration testing.
pub struct TestCluster {
    /// Authoritative chunk tables.
    pub config: Arc<InMemoryConfigService>,
    pub locks: Arc<DistLockManager>,
    pub network: Arc<InProcessNetwork>,
    pub shards: Vec<Arc<ShardNode>>,
    pub router: Arc<RouterNode>,
    /// When the test started.
    pub started_at: Instant,
}

impl TestCluster {
    /// Create a cluster with `shard_count` shards and test timeouts.
    pub fn new(shard_count: usize) -> Self {
        Self::with_config(shard_count, |config| config)
    }

    /// Create a cluster, adjusting each shard's test config with `tweak`.
    pub fn with_config(shard_count: usize, tweak: impl Fn(ShardConfig) -> ShardConfig) -> Self {
        let config = Arc::new(InMemoryConfigService::new());
        let locks = DistLockManager::new();
        let network = InProcessNetwork::new();
        let router = Arc::new(RouterNode::new(config.clone(), shard_name(0)));

        let shards: Vec<Arc<ShardNode>> = (0..shard_count)
            .map(|i| {
                let node = ShardNode::new(
                    tweak(ShardConfig::for_tests(shard_name(i))),
                    config.clone(),
                    locks.clone(),
                    network.clone(),
                );
                router.add_shard(node.clone());
                node
            })
            .collect();

        Self {
            config,
            locks,
            network,
            shards,
            router,
            started_at: Instant::now(),
        }
    }

    pub fn shard(&self, i: usize) -> &Arc<ShardNode> {
        &self.shards[i]
    }

    /// Shard `ns` with every chunk on shard 0 and refresh all shards.
    pub async fn shard_collection(&self, ns: &Namespace, pattern: ShardKeyPattern) -> Result<()> {
        self.config.shard_collection(ns, pattern, &shard_name(0))?;
        self.reload_all(ns).await
    }

    /// Split the chunk containing `at` and refresh all shards.
    pub async fn split(&self, ns: &Namespace, at: ShardKey) -> Result<()> {
        self.config.split_chunk(ns, at)?;
        self.reload_all(ns).await
    }

    pub async fn reload_all(&self, ns: &Namespace) -> Result<()> {
        for shard in &self.shards {
            shard.metadata().reload(ns).await?;
        }
        Ok(())
    }

    /// Move `range` from shard `from` to shard `to`, waiting for the
    /// post-move delete.
    pub async fn move_chunk(&self, ns: &Namespace, range: ChunkRange, from: usize, to: usize) -> Result<()> {
        self.shard(from)
            .move_chunk(MoveChunkRequest::with_bounds(ns.clone(), range, shard_name(to)).wait_for_delete(true))
            .await
    }

    /// Insert through the router.
    pub async fn insert_many(&self, ns: &Namespace, docs: impl IntoIterator<Item = Document>) -> Result<()> {
        for doc in docs {
            self.router.insert(ns, doc).await?;
        }
        Ok(())
    }

    /// Run `cleanupOrphaned` on shard `i` until it reports no `stopped_at_key`.
    /// Returns the number of calls and the total deleted.
    pub async fn cleanup_fully(&self, ns: &Namespace, i: usize) -> Result<(usize, u64)> {
        let shard = self.shard(i);
        let mut from: Option<Document> = None;
        let mut calls = 0;
        let mut deleted = 0;
        loop {
            let outcome = shard.cleanup_orphaned(ns, from.as_ref(), false).await?;
            calls += 1;
            deleted += outcome.deleted;
            match (outcome.stopped_at_key, shard.collection_metadata(ns)) {
                (Some(key), Some(md)) => from = Some(md.key_pattern().key_to_document(&key)),
                _ => return Ok((calls, deleted)),
            }
        }
    }

    /// Get elapsed time since the test started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
