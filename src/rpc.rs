//! Shard-to-shard RPCs used by chunk migration.
//!
//! The recipient-side entry points (`_recvChunkStart`, `_recvChunkStatus`,
//! `_recvChunkCommit`, `_recvChunkAbort`) are called by the donor; the
//! donor-side entry points (`_migrateClone`, `_transferMods`) are called by
//! the recipient. Every message is bincode-encoded on the way in and out.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::error::{Error, ErrorCode, Result};
use crate::keys::{ChunkRange, Document, ShardKeyPattern, Value};
use crate::sharding::RecipientState;
use crate::types::{Namespace, ShardId};

/// Arguments of `_recvChunkStart`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecvChunkStartRequest {
    pub session_id: Uuid,
    pub ns: Namespace,
    pub range: ChunkRange,
    pub from: ShardId,
    pub key_pattern: ShardKeyPattern,
}

/// Reply of `_recvChunkStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecvChunkStatus {
    pub session_id: Option<Uuid>,
    pub ns: Option<Namespace>,
    pub range: Option<ChunkRange>,
    pub state: RecipientState,
    /// Step number, 1 to 5, or 0 when no receive is running.
    pub step: u8,
    pub cloned: u64,
    pub transferred: u64,
    pub errmsg: Option<String>,
}

impl RecvChunkStatus {
    /// Status of a node that has never received a chunk.
    pub fn idle() -> Self {
        Self {
            session_id: None,
            ns: None,
            range: None,
            state: RecipientState::Ready,
            step: 0,
            cloned: 0,
            transferred: 0,
            errmsg: None,
        }
    }
}

/// Writes buffered by the donor since cloning began.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferMods {
    /// Current versions of inserted or updated documents.
    pub upserts: Vec<Document>,
    /// `_id`s of deleted documents.
    pub deletes: Vec<Value>,
}

impl TransferMods {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }
}

/// A shard-to-shard request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardRequest {
    RecvChunkStart(RecvChunkStartRequest),
    RecvChunkStatus,
    RecvChunkCommit { session_id: Uuid },
    RecvChunkAbort { session_id: Uuid },
    MigrateClone { session_id: Uuid, batch_size: usize },
    TransferMods { session_id: Uuid },
}

impl ShardRequest {
    /// Wire name of the RPC.
    pub fn name(&self) -> &'static str {
        match self {
            ShardRequest::RecvChunkStart(_) => "_recvChunkStart",
            ShardRequest::RecvChunkStatus => "_recvChunkStatus",
            ShardRequest::RecvChunkCommit { .. } => "_recvChunkCommit",
            ShardRequest::RecvChunkAbort { .. } => "_recvChunkAbort",
            ShardRequest::MigrateClone { .. } => "_migrateClone",
            ShardRequest::TransferMods { .. } => "_transferMods",
        }
    }
}

/// Reply to a [`ShardRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardResponse {
    Ok,
    Status(RecvChunkStatus),
    Docs(Vec<Document>),
    Mods(TransferMods),
    Error { code: ErrorCode, message: String },
}

impl ShardResponse {
    /// Encode a handler result as a response.
    pub fn from_result<T>(result: Result<T>, wrap: impl FnOnce(T) -> ShardResponse) -> Self {
        match result {
            Ok(value) => wrap(value),
            Err(e) => ShardResponse::Error {
                code: e.code(),
                message: e.to_string(),
            },
        }
    }
}

/// Serves shard-to-shard requests; implemented by a shard node.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_rpc(&self, request: ShardRequest) -> ShardResponse;
}

/// Client side of shard-to-shard RPCs.
#[async_trait]
pub trait ShardNetwork: Send + Sync {
    async fn call(&self, to: &ShardId, request: ShardRequest) -> Result<ShardResponse>;

    async fn recv_chunk_start(&self, to: &ShardId, request: RecvChunkStartRequest) -> Result<()> {
        match self.call(to, ShardRequest::RecvChunkStart(request)).await? {
            ShardResponse::Ok => Ok(()),
            other => Err(unexpected("_recvChunkStart", other)),
        }
    }

    async fn recv_chunk_status(&self, to: &ShardId) -> Result<RecvChunkStatus> {
        match self.call(to, ShardRequest::RecvChunkStatus).await? {
            ShardResponse::Status(status) => Ok(status),
            other => Err(unexpected("_recvChunkStatus", other)),
        }
    }

    async fn recv_chunk_commit(&self, to: &ShardId, session_id: Uuid) -> Result<RecvChunkStatus> {
        match self.call(to, ShardRequest::RecvChunkCommit { session_id }).await? {
            ShardResponse::Status(status) => Ok(status),
            other => Err(unexpected("_recvChunkCommit", other)),
        }
    }

    async fn recv_chunk_abort(&self, to: &ShardId, session_id: Uuid) -> Result<()> {
        match self.call(to, ShardRequest::RecvChunkAbort { session_id }).await? {
            ShardResponse::Ok => Ok(()),
            other => Err(unexpected("_recvChunkAbort", other)),
        }
    }

    async fn migrate_clone(&self, to: &ShardId, session_id: Uuid, batch_size: usize) -> Result<Vec<Document>> {
        match self
            .call(to, ShardRequest::MigrateClone { session_id, batch_size })
            .await?
        {
            ShardResponse::Docs(docs) => Ok(docs),
            other => Err(unexpected("_migrateClone", other)),
        }
    }

    async fn transfer_mods(&self, to: &ShardId, session_id: Uuid) -> Result<TransferMods> {
        match self.call(to, ShardRequest::TransferMods { session_id }).await? {
            ShardResponse::Mods(mods) => Ok(mods),
            other => Err(unexpected("_transferMods", other)),
        }
    }
}

fn unexpected(rpc: &str, response: ShardResponse) -> Error {
    match response {
        ShardResponse::Error { code, message } => Error::Remote { code, message },
        other => Error::Internal(format!("unexpected reply to {}: {:?}", rpc, other)),
    }
}

/// Serialize a message to bytes.
pub fn to_bytes<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

/// Deserialize a message from bytes.
pub fn from_bytes<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Network connecting the shard nodes of one process.
#[derive(Default)]
pub struct InProcessNetwork {
    handlers: RwLock<HashMap<ShardId, Weak<dyn RpcHandler>>>,
    unreachable: RwLock<HashSet<ShardId>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route requests for `shard` to `handler`.
    pub fn register(&self, shard: ShardId, handler: Weak<dyn RpcHandler>) {
        self.handlers.write().insert(shard, handler);
    }

    /// Make requests to `shard` fail as if it were down.
    pub fn set_unreachable(&self, shard: &ShardId, unreachable: bool) {
        if unreachable {
            self.unreachable.write().insert(shard.clone());
        } else {
            self.unreachable.write().remove(shard);
        }
        tracing::info!(shard = %shard, unreachable, "shard reachability changed");
    }
}

#[async_trait]
impl ShardNetwork for InProcessNetwork {
    async fn call(&self, to: &ShardId, request: ShardRequest) -> Result<ShardResponse> {
        if self.unreachable.read().contains(to) {
            return Err(Error::ShardUnreachable(to.clone()));
        }
        let handler = self
            .handlers
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(to.clone()))?
            .upgrade()
            .ok_or_else(|| Error::ShardUnreachable(to.clone()))?;

        let rpc = request.name();
        let request: ShardRequest = from_bytes(&to_bytes(&request)?)?;
        let response = handler.handle_rpc(request).await;
        let response: ShardResponse = from_bytes(&to_bytes(&response)?)?;
        tracing::trace!(to = %to, rpc, "rpc completed");
        Ok(response)
    }
}
