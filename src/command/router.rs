//! The query-routing tier. It owns no data and serves no shard commands.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{check_admin_db, Command, CommandDispatcher, CommandReply, ReplyBody};
use crate::error::{Error, Result};
use crate::failpoint::FailpointRegistry;
use crate::keys::Document;
use crate::metadata::{CollectionRouting, ConfigService};
use crate::node::ShardNode;
use crate::types::{Namespace, ShardId};

const STALE_RETRIES: usize = 100;
const STALE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// A router in front of the shards of one cluster.
///
/// Writes go to the owner recorded by the config service; reads return only
/// documents stored on their owning shard, so orphans are never visible.
pub struct RouterNode {
    config_service: Arc<dyn ConfigService>,
    /// Holds unsharded collections.
    primary_shard: ShardId,
    shards: RwLock<BTreeMap<ShardId, Arc<ShardNode>>>,
    failpoints: FailpointRegistry,
}

impl RouterNode {
    pub fn new(config_service: Arc<dyn ConfigService>, primary_shard: impl Into<ShardId>) -> Self {
        Self {
            config_service,
            primary_shard: primary_shard.into(),
            shards: RwLock::new(BTreeMap::new()),
            failpoints: FailpointRegistry::new(),
        }
    }

    pub fn add_shard(&self, node: Arc<ShardNode>) {
        self.shards.write().insert(node.shard_id().clone(), node);
    }

    pub fn failpoints(&self) -> &FailpointRegistry {
        &self.failpoints
    }

    fn shard(&self, id: &ShardId) -> Result<Arc<ShardNode>> {
        self.shards
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(id.clone()))
    }

    async fn routing(&self, ns: &Namespace) -> Result<Option<CollectionRouting>> {
        self.config_service.collection(ns).await
    }

    /// Insert through the owning shard. A write rejected with a stale shard
    /// version refreshes that shard and is retried against fresh routing.
    pub async fn insert(&self, ns: &Namespace, doc: Document) -> Result<ShardId> {
        let mut attempt = 0;
        loop {
            let target = match self.routing(ns).await? {
                Some(routing) => {
                    let key = routing.key_pattern.extract_key(&doc);
                    routing
                        .chunks
                        .iter()
                        .find(|c| c.range.contains(&key))
                        .map(|c| c.owner.clone())
                        .ok_or_else(|| Error::Internal(format!("no chunk of {} contains {}", ns, key)))?
                }
                None => self.primary_shard.clone(),
            };
            let shard = self.shard(&target)?;
            match shard.routed_insert(ns, doc.clone()) {
                Ok(_) => return Ok(target),
                Err(Error::StaleShardVersion { reason, .. }) if attempt < STALE_RETRIES => {
                    attempt += 1;
                    tracing::debug!(ns = %ns, shard = %target, %reason, attempt, "retrying routed insert");
                    if let Err(e) = shard.metadata().reload(ns).await {
                        tracing::debug!(ns = %ns, shard = %target, error = %e, "shard refresh failed");
                    }
                    tokio::time::sleep(STALE_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Documents of `ns` as the cluster owns them.
    pub async fn documents(&self, ns: &Namespace) -> Result<Vec<Document>> {
        let Some(routing) = self.routing(ns).await? else {
            return Ok(self.shard(&self.primary_shard)?.documents(ns));
        };
        let shards: Vec<Arc<ShardNode>> = self.shards.read().values().cloned().collect();
        let mut docs = Vec::new();
        for shard in shards {
            docs.extend(shard.documents(ns).into_iter().filter(|doc| {
                let key = routing.key_pattern.extract_key(doc);
                routing
                    .chunks
                    .iter()
                    .any(|c| c.range.contains(&key) && &c.owner == shard.shard_id())
            }));
        }
        Ok(docs)
    }

    pub async fn count(&self, ns: &Namespace) -> Result<usize> {
        Ok(self.documents(ns).await?.len())
    }
}

#[async_trait]
impl CommandDispatcher for RouterNode {
    async fn run_command(&self, db: &str, command: Command) -> CommandReply {
        let result = match command {
            Command::ConfigureFailPoint { .. } => self.configure_fail_point(db, command),
            other => Err(Error::CommandNotFound(other.name().to_string())),
        };
        CommandReply::from_result(result)
    }
}

impl RouterNode {
    fn configure_fail_point(&self, db: &str, command: Command) -> Result<ReplyBody> {
        check_admin_db(db, &command)?;
        if let Command::ConfigureFailPoint { name, mode, data } = command {
            self.failpoints.configure(&name, mode, data)?;
        }
        Ok(ReplyBody::Empty)
    }
}
