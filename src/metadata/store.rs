//! Per-shard cache of collection ownership.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::chunk::ChunkVersion;
use super::collection::CollectionMetadata;
use super::config_service::ConfigService;
use crate::error::{Error, Result};
use crate::keys::ChunkRange;
use crate::types::{Namespace, ShardId};

/// Local, possibly stale, view of chunk ownership for one shard.
///
/// Readers take an `Arc<CollectionMetadata>` snapshot and keep it for the
/// whole operation. Writers for one namespace are serialized and replace the
/// snapshot wholesale.
pub struct MetadataStore {
    shard_id: ShardId,
    config_service: Arc<dyn ConfigService>,
    cache: RwLock<HashMap<Namespace, Arc<CollectionMetadata>>>,
    ns_locks: DashMap<Namespace, Arc<AsyncMutex<()>>>,
    reloads: AtomicU64,
}

impl MetadataStore {
    pub fn new(shard_id: ShardId, config_service: Arc<dyn ConfigService>) -> Self {
        Self {
            shard_id,
            config_service,
            cache: RwLock::new(HashMap::new()),
            ns_locks: DashMap::new(),
            reloads: AtomicU64::new(0),
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// The authoritative collaborator this store reloads from.
    pub fn config_service(&self) -> &Arc<dyn ConfigService> {
        &self.config_service
    }

    /// Cached snapshot for `ns`, `None` if unsharded or never loaded.
    pub fn get_metadata(&self, ns: &Namespace) -> Option<Arc<CollectionMetadata>> {
        self.cache.read().get(ns).cloned()
    }

    /// Number of successful reloads.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    async fn lock_ns(&self, ns: &Namespace) -> OwnedMutexGuard<()> {
        let lock = self
            .ns_locks
            .entry(ns.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn install(&self, ns: &Namespace, metadata: CollectionMetadata) -> Arc<CollectionMetadata> {
        let metadata = Arc::new(metadata);
        self.cache.write().insert(ns.clone(), metadata.clone());
        metadata
    }

    /// Refresh `ns` from the config service.
    ///
    /// On failure the cached snapshot is left in place. Pending ranges survive
    /// the refresh unless the epoch changed or the range is now owned.
    pub async fn reload(&self, ns: &Namespace) -> Result<Option<Arc<CollectionMetadata>>> {
        let _guard = self.lock_ns(ns).await;

        let routing = match self.config_service.collection(ns).await {
            Ok(routing) => routing,
            Err(e) => {
                tracing::warn!(shard = %self.shard_id, ns = %ns, error = %e, "metadata reload failed");
                return Err(e);
            }
        };
        self.reloads.fetch_add(1, Ordering::Relaxed);

        let Some(routing) = routing else {
            if self.cache.write().remove(ns).is_some() {
                tracing::info!(shard = %self.shard_id, ns = %ns, "collection no longer sharded, dropping metadata");
            }
            return Ok(None);
        };

        let mut fresh = CollectionMetadata::from_routing(&self.shard_id, &routing)?;
        if let Some(old) = self.get_metadata(ns) {
            if old.epoch() != fresh.epoch() {
                tracing::info!(
                    shard = %self.shard_id,
                    ns = %ns,
                    old_epoch = %old.epoch(),
                    new_epoch = %fresh.epoch(),
                    pending = old.num_pending(),
                    "collection epoch changed, discarding pending ranges"
                );
            } else {
                for range in old.pending_ranges() {
                    if fresh.owns_range(range) {
                        tracing::info!(shard = %self.shard_id, ns = %ns, range = %range, "pending range promoted to owned chunk");
                    } else if fresh.overlaps_owned(range) {
                        tracing::warn!(shard = %self.shard_id, ns = %ns, range = %range, "dropping pending range that overlaps owned chunks");
                    } else {
                        fresh = fresh.clone_plus_pending(range)?;
                    }
                }
            }
        }

        tracing::debug!(
            shard = %self.shard_id,
            ns = %ns,
            shard_version = %fresh.shard_version(),
            coll_version = %fresh.coll_version(),
            chunks = fresh.num_chunks(),
            pending = fresh.num_pending(),
            "metadata reloaded"
        );
        Ok(Some(self.install(ns, fresh)))
    }

    /// Reserve `range` as pending. Idempotent.
    pub async fn reserve_range(&self, ns: &Namespace, range: &ChunkRange) -> Result<()> {
        let _guard = self.lock_ns(ns).await;
        let current = self
            .get_metadata(ns)
            .ok_or_else(|| Error::Unsharded(ns.clone()))?;
        if current.pending_ranges().any(|p| p == range) {
            return Ok(());
        }
        let next = current.clone_plus_pending(range)?;
        self.install(ns, next);
        tracing::info!(shard = %self.shard_id, ns = %ns, range = %range, "reserved pending range");
        Ok(())
    }

    /// Forget the pending `range`. No-op if it is absent.
    pub async fn discard_range(&self, ns: &Namespace, range: &ChunkRange) -> Result<()> {
        let _guard = self.lock_ns(ns).await;
        let Some(current) = self.get_metadata(ns) else {
            return Ok(());
        };
        if !current.pending_ranges().any(|p| p == range) {
            return Ok(());
        }
        self.install(ns, current.clone_minus_pending(range));
        tracing::info!(shard = %self.shard_id, ns = %ns, range = %range, "discarded pending range");
        Ok(())
    }

    /// Apply a committed ownership change of `range` to `new_owner` at
    /// `new_version`.
    pub async fn promote_range(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        new_owner: &ShardId,
        new_version: ChunkVersion,
    ) -> Result<Arc<CollectionMetadata>> {
        let _guard = self.lock_ns(ns).await;
        let current = self
            .get_metadata(ns)
            .ok_or_else(|| Error::Unsharded(ns.clone()))?;

        let next = if new_owner == &self.shard_id {
            if current.chunk_with_bounds(range).is_some() {
                return Ok(current);
            }
            current.clone_plus_chunk(range, new_version)?
        } else {
            if current.chunk_with_bounds(range).is_none() {
                return Ok(current);
            }
            current.clone_minus_chunk(range, new_version)?
        };

        tracing::info!(
            shard = %self.shard_id,
            ns = %ns,
            range = %range,
            owner = %new_owner,
            shard_version = %next.shard_version(),
            coll_version = %next.coll_version(),
            "chunk ownership changed"
        );
        Ok(self.install(ns, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ShardKey, ShardKeyPattern, Value};
    use crate::metadata::InMemoryConfigService;

    fn ns() -> Namespace {
        Namespace::new("foo.bar")
    }

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(ShardKey::single(min), ShardKey::single(max)).unwrap()
    }

    fn setup() -> (Arc<InMemoryConfigService>, MetadataStore, MetadataStore) {
        let config = Arc::new(InMemoryConfigService::new());
        config
            .shard_collection(&ns(), ShardKeyPattern::ascending(&["_id"]).unwrap(), &"s0".into())
            .unwrap();
        config.split_chunk(&ns(), ShardKey::single(0)).unwrap();
        config.split_chunk(&ns(), ShardKey::single(10)).unwrap();
        let s0 = MetadataStore::new("s0".into(), config.clone());
        let s1 = MetadataStore::new("s1".into(), config.clone());
        (config, s0, s1)
    }

    #[tokio::test]
    async fn test_reload_and_unsharded() {
        let (config, s0, _) = setup();
        assert!(s0.get_metadata(&ns()).is_none());
        let md = s0.reload(&ns()).await.unwrap().unwrap();
        assert_eq!(md.num_chunks(), 3);

        config.drop_collection(&ns());
        assert!(s0.reload(&ns()).await.unwrap().is_none());
        assert!(s0.get_metadata(&ns()).is_none());
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_cache() {
        let (config, s0, _) = setup();
        s0.reload(&ns()).await.unwrap();
        config.set_reachable(false);
        assert!(matches!(s0.reload(&ns()).await, Err(Error::ConfigUnreachable(_))));
        assert!(s0.get_metadata(&ns()).is_some());
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_and_survives_reload() {
        let (_, _, s1) = setup();
        s1.reload(&ns()).await.unwrap();
        s1.reserve_range(&ns(), &range(0, 10)).await.unwrap();
        s1.reserve_range(&ns(), &range(0, 10)).await.unwrap();
        assert_eq!(s1.get_metadata(&ns()).unwrap().num_pending(), 1);

        let md = s1.reload(&ns()).await.unwrap().unwrap();
        assert_eq!(md.num_pending(), 1);
        assert!(md.key_is_pending(&ShardKey::single(5)));

        s1.discard_range(&ns(), &range(0, 10)).await.unwrap();
        s1.discard_range(&ns(), &range(0, 10)).await.unwrap();
        assert_eq!(s1.get_metadata(&ns()).unwrap().num_pending(), 0);
    }

    #[tokio::test]
    async fn test_reserve_owned_range_fails() {
        let (_, s0, s1) = setup();
        assert!(matches!(
            s1.reserve_range(&ns(), &range(0, 10)).await,
            Err(Error::Unsharded(_))
        ));
        s0.reload(&ns()).await.unwrap();
        assert!(matches!(
            s0.reserve_range(&ns(), &range(0, 10)).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_promotes_pending() {
        let (config, s0, s1) = setup();
        s0.reload(&ns()).await.unwrap();
        s1.reload(&ns()).await.unwrap();
        s1.reserve_range(&ns(), &range(0, 10)).await.unwrap();

        config
            .commit_migration(&ns(), &range(0, 10), &"s0".into(), &"s1".into())
            .await
            .unwrap();

        let md = s1.reload(&ns()).await.unwrap().unwrap();
        assert_eq!(md.num_pending(), 0);
        assert_eq!(md.num_chunks(), 1);
        assert!(md.key_belongs_to_me(&ShardKey::single(5)));
    }

    #[tokio::test]
    async fn test_promote_both_sides() {
        let (config, s0, s1) = setup();
        s0.reload(&ns()).await.unwrap();
        s1.reload(&ns()).await.unwrap();
        s1.reserve_range(&ns(), &range(0, 10)).await.unwrap();

        let version = config
            .commit_migration(&ns(), &range(0, 10), &"s0".into(), &"s1".into())
            .await
            .unwrap();
        let donor = s0
            .promote_range(&ns(), &range(0, 10), &"s1".into(), version)
            .await
            .unwrap();
        let recipient = s1
            .promote_range(&ns(), &range(0, 10), &"s1".into(), version)
            .await
            .unwrap();

        assert!(!donor.key_belongs_to_me(&ShardKey::single(5)));
        assert!(donor.key_belongs_to_me(&ShardKey::single(Value::MinKey)));
        assert_eq!(donor.coll_version(), config.routing(&ns()).unwrap().coll_version());
        assert!(recipient.key_belongs_to_me(&ShardKey::single(5)));
        assert_eq!(recipient.num_pending(), 0);
        assert_eq!(recipient.shard_version(), version);

        // A second promote is a no-op.
        let again = s1
            .promote_range(&ns(), &range(0, 10), &"s1".into(), version)
            .await
            .unwrap();
        assert_eq!(again.shard_version(), version);
    }

    #[tokio::test]
    async fn test_epoch_change_discards_pending() {
        let (config, _, s1) = setup();
        s1.reload(&ns()).await.unwrap();
        s1.reserve_range(&ns(), &range(0, 10)).await.unwrap();

        config.drop_collection(&ns());
        config
            .shard_collection(&ns(), ShardKeyPattern::ascending(&["_id"]).unwrap(), &"s0".into())
            .unwrap();
        let md = s1.reload(&ns()).await.unwrap().unwrap();
        assert_eq!(md.num_pending(), 0);
    }
}
