//! Commands served by a shard node.

use async_trait::async_trait;
use uuid::Uuid;

use super::{check_admin_db, Command, CommandDispatcher, CommandReply, ReplyBody, ShardVersionInfo};
use crate::error::Result;
use crate::failpoint::RS_SYNC_APPLY_STOP;
use crate::metadata::ChunkVersion;
use crate::node::ShardNode;
use crate::types::Namespace;

#[async_trait]
impl CommandDispatcher for ShardNode {
    async fn run_command(&self, db: &str, command: Command) -> CommandReply {
        let name = command.name();
        let result = self.dispatch(db, command).await;
        if let Err(e) = &result {
            tracing::debug!(shard = %self.shard_id(), command = name, code = ?e.code(), error = %e, "command failed");
        }
        CommandReply::from_result(result)
    }
}

impl ShardNode {
    async fn dispatch(&self, db: &str, command: Command) -> Result<ReplyBody> {
        check_admin_db(db, &command)?;
        if command.requires_primary() {
            self.require_primary()?;
        }

        match command {
            Command::MoveChunk(request) => {
                self.move_chunk(request).await?;
                Ok(ReplyBody::Empty)
            }
            Command::CleanupOrphaned {
                ns,
                starting_from_key,
                secondary_throttle,
            } => {
                let outcome = self
                    .cleanup_orphaned(&ns, starting_from_key.as_ref(), secondary_throttle)
                    .await?;
                let stopped_at_key = outcome.stopped_at_key.and_then(|key| {
                    self.collection_metadata(&ns)
                        .map(|md| md.key_pattern().key_to_document(&key))
                });
                Ok(ReplyBody::Cleanup { stopped_at_key })
            }
            Command::GetShardVersion { ns, full_metadata } => {
                Ok(ReplyBody::ShardVersion(self.shard_version_info(&ns, full_metadata)))
            }
            Command::RecvChunkStart(request) => {
                self.recipient().recv_chunk_start(request)?;
                Ok(ReplyBody::Empty)
            }
            Command::RecvChunkStatus => Ok(ReplyBody::RecvChunkStatus(self.recipient().recv_chunk_status())),
            Command::RecvChunkCommit { session_id } => Ok(ReplyBody::RecvChunkStatus(
                self.recipient().recv_chunk_commit(session_id).await?,
            )),
            Command::RecvChunkAbort { session_id } => {
                self.recipient().recv_chunk_abort(session_id)?;
                Ok(ReplyBody::Empty)
            }
            Command::ConfigureFailPoint { name, mode, data } => {
                // The oplog applier runs on the secondaries.
                if name == RS_SYNC_APPLY_STOP {
                    for member in self.replica_set().secondaries() {
                        member.failpoints().configure(&name, mode, data.clone())?;
                    }
                } else {
                    self.failpoints().configure(&name, mode, data)?;
                }
                tracing::info!(shard = %self.shard_id(), failpoint = %name, ?mode, "failpoint configured");
                Ok(ReplyBody::Empty)
            }
        }
    }

    /// `getShardVersion` from the cached metadata. An unsharded namespace
    /// reports `0|0` versions.
    pub fn shard_version_info(&self, ns: &Namespace, full_metadata: bool) -> ShardVersionInfo {
        let Some(md) = self.collection_metadata(ns) else {
            let zero = ChunkVersion::zero(Uuid::nil());
            return ShardVersionInfo {
                shard_version: zero,
                coll_version: zero,
                chunks: full_metadata.then(Vec::new),
                pending: full_metadata.then(Vec::new),
            };
        };
        ShardVersionInfo {
            shard_version: md.shard_version(),
            coll_version: md.coll_version(),
            chunks: full_metadata.then(|| md.owned_chunks().map(|c| c.range.clone()).collect()),
            pending: full_metadata.then(|| md.pending_ranges().cloned().collect()),
        }
    }
}
