//! A shard node: the primary of one shard's replica set and everything
//! wired around it.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

use crate::config::ShardConfig;
use crate::error::{Error, Result};
use crate::failpoint::FailpointRegistry;
use crate::keys::{Document, ShardKey, Value};
use crate::metadata::{CollectionMetadata, ConfigService, MetadataStore};
use crate::metrics::ShardingMetrics;
use crate::replication::{OpTime, ReplicaSet};
use crate::rpc::{InProcessNetwork, RpcHandler, ShardRequest, ShardResponse};
use crate::sharding::{
    ActiveOps, CleanupOutcome, DistLockManager, DonorCoordinator, FailpointStepHook,
    MigrationContext, MoveChunkRequest, OrphanCleaner, RangeDeleter, RecipientReceiver,
};
use crate::types::{Namespace, NodeRole, ShardId};

/// One shard of the cluster.
///
/// Must be created inside a tokio runtime: the replica set starts its
/// secondary appliers on construction.
pub struct ShardNode {
    config: ShardConfig,
    role: RwLock<NodeRole>,
    replica_set: Arc<ReplicaSet>,
    metadata: Arc<MetadataStore>,
    failpoints: Arc<FailpointRegistry>,
    active_ops: Arc<ActiveOps>,
    metrics: Arc<ShardingMetrics>,
    donor: Arc<DonorCoordinator>,
    recipient: Arc<RecipientReceiver>,
    cleaner: OrphanCleaner,
}

impl ShardNode {
    /// Build a shard node and register it on `network`.
    pub fn new(
        config: ShardConfig,
        config_service: Arc<dyn ConfigService>,
        locks: Arc<DistLockManager>,
        network: Arc<InProcessNetwork>,
    ) -> Arc<Self> {
        let shard_id = config.shard_id.clone();
        let replica_set = ReplicaSet::new(shard_id.clone(), config.replication.clone());
        let metadata = Arc::new(MetadataStore::new(shard_id.clone(), config_service));
        let failpoints = Arc::new(FailpointRegistry::new());
        let active_ops = ActiveOps::new();
        let metrics = Arc::new(ShardingMetrics::new());
        let deleter = Arc::new(RangeDeleter::new(
            replica_set.clone(),
            failpoints.clone(),
            metrics.clone(),
        ));

        let ctx = Arc::new(MigrationContext {
            shard_id: shard_id.clone(),
            config: config.migration.clone(),
            metadata: metadata.clone(),
            replica_set: replica_set.clone(),
            deleter: deleter.clone(),
            network: network.clone(),
            locks,
            active_ops: active_ops.clone(),
            hook: Arc::new(FailpointStepHook::new(failpoints.clone())),
            metrics: metrics.clone(),
        });
        let cleaner = OrphanCleaner::new(metadata.clone(), deleter, config.cleanup.clone(), metrics.clone());

        let node = Arc::new(Self {
            role: RwLock::new(NodeRole::Primary),
            replica_set,
            metadata,
            failpoints,
            active_ops,
            metrics,
            donor: Arc::new(DonorCoordinator::new(ctx.clone())),
            recipient: Arc::new(RecipientReceiver::new(ctx)),
            cleaner,
            config,
        });
        let handler: Weak<dyn RpcHandler> = Arc::downgrade(&node) as Weak<dyn RpcHandler>;
        network.register(shard_id.clone(), handler);
        tracing::info!(shard = %shard_id, members = node.config.replication.members, "shard node started");
        node
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.config.shard_id
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn role(&self) -> NodeRole {
        *self.role.read()
    }

    /// Step down or up. Commands other than `configureFailPoint` need
    /// [`NodeRole::Primary`].
    pub fn set_role(&self, role: NodeRole) {
        let previous = std::mem::replace(&mut *self.role.write(), role);
        if previous != role {
            tracing::info!(shard = %self.shard_id(), from = %previous, to = %role, "role changed");
        }
    }

    pub fn replica_set(&self) -> &Arc<ReplicaSet> {
        &self.replica_set
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn failpoints(&self) -> &Arc<FailpointRegistry> {
        &self.failpoints
    }

    pub fn active_ops(&self) -> &Arc<ActiveOps> {
        &self.active_ops
    }

    pub fn metrics(&self) -> &Arc<ShardingMetrics> {
        &self.metrics
    }

    pub fn donor(&self) -> &Arc<DonorCoordinator> {
        &self.donor
    }

    pub fn recipient(&self) -> &Arc<RecipientReceiver> {
        &self.recipient
    }

    fn shard_key(&self, ns: &Namespace, doc: &Document) -> Option<ShardKey> {
        self.metadata
            .get_metadata(ns)
            .map(|md| md.key_pattern().extract_key(doc))
    }

    /// Insert or replace a document on this shard, whether or not it owns
    /// the document's key.
    pub fn insert(&self, ns: &Namespace, doc: Document) -> Result<OpTime> {
        self.write_doc(ns, doc, false)
    }

    /// Insert on behalf of a router: the key must belong to this shard.
    pub fn routed_insert(&self, ns: &Namespace, doc: Document) -> Result<OpTime> {
        self.write_doc(ns, doc, true)
    }

    fn write_doc(&self, ns: &Namespace, doc: Document, owned_only: bool) -> Result<OpTime> {
        let id = doc
            .id()
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("document {} has no _id", doc)))?;
        let Some(key) = self.shard_key(ns, &doc) else {
            return self.replica_set.upsert(ns, doc);
        };
        self.donor.guarded_write(ns, &key, &id, false, || {
            if owned_only {
                self.check_owned(ns, &key)?;
            }
            self.replica_set.upsert(ns, doc)
        })
    }

    fn check_owned(&self, ns: &Namespace, key: &ShardKey) -> Result<()> {
        match self.metadata.get_metadata(ns) {
            Some(md) if !md.key_belongs_to_me(key) => Err(Error::StaleShardVersion {
                ns: ns.clone(),
                reason: format!(
                    "{} does not own {} at version {}",
                    self.shard_id(),
                    key,
                    md.shard_version()
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Delete a document by `_id`. Returns `None` if it did not exist.
    pub fn delete(&self, ns: &Namespace, id: &Value) -> Result<Option<OpTime>> {
        let Some(doc) = self.replica_set.primary().get(ns, id) else {
            return Ok(None);
        };
        match self.shard_key(ns, &doc) {
            Some(key) => self
                .donor
                .guarded_write(ns, &key, id, true, || self.replica_set.delete(ns, id)),
            None => self.replica_set.delete(ns, id),
        }
    }

    pub fn get(&self, ns: &Namespace, id: &Value) -> Option<Document> {
        self.replica_set.primary().get(ns, id)
    }

    /// Documents stored locally, owned or not.
    pub fn count(&self, ns: &Namespace) -> usize {
        self.replica_set.primary().count(ns)
    }

    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.replica_set.primary().documents(ns)
    }

    /// Cached ownership metadata of `ns`.
    pub fn collection_metadata(&self, ns: &Namespace) -> Option<Arc<CollectionMetadata>> {
        self.metadata.get_metadata(ns)
    }

    pub async fn move_chunk(&self, request: MoveChunkRequest) -> Result<()> {
        self.donor.move_chunk(request).await
    }

    pub async fn cleanup_orphaned(
        &self,
        ns: &Namespace,
        starting_from_key: Option<&Document>,
        secondary_throttle: bool,
    ) -> Result<CleanupOutcome> {
        self.cleaner
            .cleanup_orphaned(ns, starting_from_key, secondary_throttle)
            .await
    }

    pub(crate) fn require_primary(&self) -> Result<()> {
        match self.role() {
            NodeRole::Primary => Ok(()),
            role => Err(Error::NotPrimary {
                shard: self.shard_id().clone(),
                role: role.to_string(),
            }),
        }
    }
}

#[async_trait]
impl RpcHandler for ShardNode {
    async fn handle_rpc(&self, request: ShardRequest) -> ShardResponse {
        if let Err(e) = self.require_primary() {
            return ShardResponse::from_result::<()>(Err(e), |_| ShardResponse::Ok);
        }
        match request {
            ShardRequest::RecvChunkStart(start) => {
                ShardResponse::from_result(self.recipient.recv_chunk_start(start), |_| ShardResponse::Ok)
            }
            ShardRequest::RecvChunkStatus => ShardResponse::Status(self.recipient.recv_chunk_status()),
            ShardRequest::RecvChunkCommit { session_id } => ShardResponse::from_result(
                self.recipient.recv_chunk_commit(session_id).await,
                ShardResponse::Status,
            ),
            ShardRequest::RecvChunkAbort { session_id } => {
                ShardResponse::from_result(self.recipient.recv_chunk_abort(session_id), |_| ShardResponse::Ok)
            }
            ShardRequest::MigrateClone { session_id, batch_size } => ShardResponse::from_result(
                self.donor.migrate_clone(session_id, batch_size),
                ShardResponse::Docs,
            ),
            ShardRequest::TransferMods { session_id } => {
                ShardResponse::from_result(self.donor.transfer_mods(session_id), ShardResponse::Mods)
            }
        }
    }
}
