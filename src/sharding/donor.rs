//! Donor side of chunk migration (`moveChunk`).

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::active_ops::ActiveOpHandle;
use super::range_deleter::DeleteBudget;
use super::session::{DonorState, MigrationSession, RecipientState};
use super::steps::{DonorStep, RecipientStep};
use super::{MigrationContext, MOVE_CHUNK_DESC};
use crate::error::{Error, Result};
use crate::keys::{ChunkRange, Document, ShardKey, ShardKeyPattern, Value};
use crate::metadata::{ChunkVersion, CollectionMetadata};
use crate::rpc::{RecvChunkStartRequest, TransferMods};
use crate::types::{Namespace, ShardId};

/// Arguments of `moveChunk`. Exactly one of `bounds` and `find` selects the
/// chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveChunkRequest {
    pub ns: Namespace,
    /// Exact bounds of the chunk to move.
    pub bounds: Option<ChunkRange>,
    /// A document whose shard key falls inside the chunk to move.
    pub find: Option<Document>,
    pub to: ShardId,
    /// Wait for the post-move delete instead of running it in the background.
    pub wait_for_delete: bool,
}

impl MoveChunkRequest {
    pub fn with_bounds(ns: Namespace, bounds: ChunkRange, to: impl Into<ShardId>) -> Self {
        Self {
            ns,
            bounds: Some(bounds),
            find: None,
            to: to.into(),
            wait_for_delete: false,
        }
    }

    pub fn with_find(ns: Namespace, find: Document, to: impl Into<ShardId>) -> Self {
        Self {
            ns,
            bounds: None,
            find: Some(find),
            to: to.into(),
            wait_for_delete: false,
        }
    }

    pub fn wait_for_delete(mut self, wait: bool) -> Self {
        self.wait_for_delete = wait;
        self
    }
}

#[derive(Default)]
struct CloneState {
    /// `_id`s of the initial snapshot not yet handed to the recipient.
    to_clone: VecDeque<Value>,
    /// `_id`s written since cloning began.
    upserted: BTreeSet<Value>,
    /// `_id`s deleted since cloning began.
    deleted: BTreeSet<Value>,
}

/// Documents of the migrating range as the recipient pulls them.
struct CloneSource {
    session: MigrationSession,
    key_pattern: ShardKeyPattern,
    state: Mutex<CloneState>,
    critical_section: AtomicBool,
}

impl CloneSource {
    fn next_batch(&self, size: usize) -> Vec<Value> {
        let mut state = self.state.lock();
        let n = size.min(state.to_clone.len());
        state.to_clone.drain(..n).collect()
    }

    fn record_write(&self, id: &Value, deleted: bool) {
        let mut state = self.state.lock();
        if deleted {
            state.upserted.remove(id);
            state.deleted.insert(id.clone());
        } else {
            state.deleted.remove(id);
            state.upserted.insert(id.clone());
        }
    }

    fn take_mods(&self) -> (BTreeSet<Value>, BTreeSet<Value>) {
        let mut state = self.state.lock();
        (
            std::mem::take(&mut state.upserted),
            std::mem::take(&mut state.deleted),
        )
    }

    fn in_critical_section(&self) -> bool {
        self.critical_section.load(Ordering::Acquire)
    }
}

/// Drives `moveChunk` on the donor shard and serves the recipient's
/// `_migrateClone` and `_transferMods` pulls.
///
/// At most one migration per namespace runs on a donor. The cluster-wide
/// [`super::DistLockManager`] additionally keeps other shards from migrating
/// the same namespace.
pub struct DonorCoordinator {
    ctx: Arc<MigrationContext>,
    sources: RwLock<HashMap<Namespace, Arc<CloneSource>>>,
}

impl DonorCoordinator {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self {
            ctx,
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Move a chunk to another shard.
    ///
    /// Runs on its own task so a dropped caller does not leave the migration
    /// half done.
    pub async fn move_chunk(self: &Arc<Self>, request: MoveChunkRequest) -> Result<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_move_chunk(request).await })
            .await
            .map_err(|e| Error::Internal(format!("moveChunk task failed: {}", e)))?
    }

    /// Whether a migration of `ns` is running on this shard.
    pub fn is_migrating(&self, ns: &Namespace) -> bool {
        self.sources.read().contains_key(ns)
    }

    async fn run_move_chunk(self: Arc<Self>, request: MoveChunkRequest) -> Result<()> {
        let ns = request.ns.clone();
        let op = self.ctx.active_ops.begin(MOVE_CHUNK_DESC, &ns);
        let started = Instant::now();

        let (key_pattern, range) = self.resolve_chunk(&request).await?;
        if request.to == self.ctx.shard_id {
            return Err(Error::InvalidArgument(format!(
                "chunk {} of {} is already on {}",
                range, ns, request.to
            )));
        }
        let _lock = self.ctx.locks.try_lock(
            &ns,
            self.ctx.shard_id.as_str(),
            &format!("migrating chunk {} to {}", range, request.to),
        )?;
        // A force-unlocked namespace can still have a session running here.
        if self.is_migrating(&ns) {
            return Err(Error::MigrationInProgress(format!(
                "{} is already migrating a chunk of {}",
                self.ctx.shard_id, ns
            )));
        }

        let session = MigrationSession::new(ns.clone(), range, self.ctx.shard_id.clone(), request.to.clone());
        tracing::info!(session = %session, "starting chunk migration");
        self.ctx.metrics.record_migration_start();

        let mut state = DonorState::At(DonorStep::Started);
        self.reach_step(&op, &session, DonorStep::Started, &mut state).await;

        let result = self
            .run_steps(&op, &session, &key_pattern, request.wait_for_delete, &mut state)
            .await;
        self.unregister_source(&session);
        self.ctx.metrics.record_migration_end();

        match &result {
            Ok(()) => {
                tracing::info!(session = %session, elapsed = ?started.elapsed(), "chunk migration finished");
            }
            Err(e) if state.is_abortable() && !matches!(e, Error::CommitFailed(_)) => {
                self.abort(&session, e).await;
                state = DonorState::Aborted;
            }
            Err(e) => {
                tracing::error!(session = %session, step = %state, error = %e, "chunk migration failed after commit point");
                state = DonorState::Failed;
            }
        }
        tracing::debug!(session = %session, state = %state, "donor session ended");
        result
    }

    async fn run_steps(
        &self,
        op: &ActiveOpHandle,
        session: &MigrationSession,
        key_pattern: &ShardKeyPattern,
        wait_for_delete: bool,
        state: &mut DonorState,
    ) -> Result<()> {
        let ns = &session.ns;

        // Step 2: the chunk must still be ours, with the same bounds.
        let metadata = self
            .ctx
            .metadata
            .reload(ns)
            .await?
            .ok_or_else(|| Error::Unsharded(ns.clone()))?;
        if metadata.chunk_with_bounds(&session.range).is_none() {
            return Err(Error::StaleShardVersion {
                ns: ns.clone(),
                reason: format!(
                    "chunk {} is no longer owned by {} at version {}",
                    session.range,
                    self.ctx.shard_id,
                    metadata.shard_version()
                ),
            });
        }
        self.reach_step(op, session, DonorStep::ClonedOwnershipView, state).await;

        // Step 3
        let source = self.register_source(session, key_pattern)?;
        self.ctx
            .network
            .recv_chunk_start(
                &session.recipient,
                RecvChunkStartRequest {
                    session_id: session.id,
                    ns: ns.clone(),
                    range: session.range.clone(),
                    from: self.ctx.shard_id.clone(),
                    key_pattern: key_pattern.clone(),
                },
            )
            .await?;
        self.reach_step(op, session, DonorStep::RecipientStarted, state).await;

        // Step 4
        self.wait_for_recipient_catch_up(session).await?;
        self.enter_critical_section(&source);
        tracing::info!(session = %session, "entered migration critical section");
        self.reach_step(op, session, DonorStep::ModsDrained, state).await;

        // Step 5
        let status = self
            .ctx
            .network
            .recv_chunk_commit(&session.recipient, session.id)
            .await?;
        if status.state != RecipientState::At(RecipientStep::Done) {
            return Err(Error::MigrationAborted(format!(
                "recipient {} did not commit: {}",
                session.recipient,
                status.errmsg.unwrap_or_else(|| status.state.to_string())
            )));
        }
        let version = self.commit_ownership(session).await?;
        self.ctx
            .metadata
            .promote_range(ns, &session.range, &session.recipient, version)
            .await
            .map_err(|e| Error::CommitFailed(format!("could not apply committed move locally: {}", e)))?;
        self.unregister_source(session);
        self.ctx.metrics.record_migration_committed(op.elapsed());
        self.reach_step(op, session, DonorStep::Committed, state).await;

        // Step 6
        self.post_move_delete(session, key_pattern, wait_for_delete).await?;
        self.reach_step(op, session, DonorStep::PostMoveDelete, state).await;
        *state = DonorState::Done;
        Ok(())
    }

    async fn reach_step(
        &self,
        op: &ActiveOpHandle,
        session: &MigrationSession,
        step: DonorStep,
        state: &mut DonorState,
    ) {
        *state = DonorState::At(step);
        op.set_msg(step.progress_message());
        tracing::info!(
            ns = %session.ns,
            session_id = %session.id,
            step = step.number(),
            "moveChunk {}",
            step
        );
        self.ctx.hook.on_donor_step(&session.ns, step).await;
    }

    /// Find the chunk a request names, reloading once if the cached view does
    /// not know it.
    async fn resolve_chunk(&self, request: &MoveChunkRequest) -> Result<(ShardKeyPattern, ChunkRange)> {
        let ns = &request.ns;
        let lookup = |metadata: &CollectionMetadata| -> Result<Option<ChunkRange>> {
            let chunk = match (&request.bounds, &request.find) {
                (Some(_), Some(_)) => {
                    return Err(Error::InvalidArgument(
                        "moveChunk takes either find or bounds, not both".to_string(),
                    ))
                }
                (Some(bounds), None) => metadata.chunk_with_bounds(bounds),
                (None, Some(find)) => metadata.chunk_containing(&metadata.key_pattern().extract_key(find)),
                (None, None) => {
                    return Err(Error::InvalidArgument(
                        "moveChunk requires find or bounds".to_string(),
                    ))
                }
            };
            Ok(chunk.map(|c| c.range.clone()))
        };

        if let Some(metadata) = self.ctx.metadata.get_metadata(ns) {
            if let Some(range) = lookup(&metadata)? {
                return Ok((metadata.key_pattern().clone(), range));
            }
        }
        let metadata = self
            .ctx
            .metadata
            .reload(ns)
            .await?
            .ok_or_else(|| Error::Unsharded(ns.clone()))?;
        match lookup(&metadata)? {
            Some(range) => Ok((metadata.key_pattern().clone(), range)),
            None => Err(Error::InvalidArgument(format!(
                "no chunk of {} matching the request is owned by {}",
                ns, self.ctx.shard_id
            ))),
        }
    }

    fn register_source(&self, session: &MigrationSession, key_pattern: &ShardKeyPattern) -> Result<Arc<CloneSource>> {
        let source = Arc::new(CloneSource {
            session: session.clone(),
            key_pattern: key_pattern.clone(),
            state: Mutex::new(CloneState::default()),
            critical_section: AtomicBool::new(false),
        });
        {
            let mut sources = self.sources.write();
            if sources.contains_key(&session.ns) {
                return Err(Error::MigrationInProgress(format!(
                    "{} is already migrating a chunk of {}",
                    self.ctx.shard_id, session.ns
                )));
            }
            sources.insert(session.ns.clone(), source.clone());
        }

        // Registered before the scan so that no write falls between the two.
        let ids: VecDeque<Value> = self
            .ctx
            .replica_set
            .primary()
            .scan_range(&session.ns, key_pattern, &session.range)
            .into_iter()
            .filter_map(|(_, doc)| doc.id().cloned())
            .collect();
        tracing::debug!(session = %session, docs = ids.len(), "registered clone source");
        source.state.lock().to_clone = ids;
        Ok(source)
    }

    fn unregister_source(&self, session: &MigrationSession) {
        let mut sources = self.sources.write();
        if sources
            .get(&session.ns)
            .map_or(false, |s| s.session.id == session.id)
        {
            sources.remove(&session.ns);
        }
    }

    fn source(&self, session_id: Uuid) -> Result<Arc<CloneSource>> {
        self.sources
            .read()
            .values()
            .find(|s| s.session.id == session_id)
            .cloned()
            .ok_or_else(|| Error::MigrationAborted(format!("no active migration session {}", session_id)))
    }

    async fn wait_for_recipient_catch_up(&self, session: &MigrationSession) -> Result<()> {
        let deadline = Instant::now() + self.ctx.config.clone_timeout;
        loop {
            let status = self.ctx.network.recv_chunk_status(&session.recipient).await?;
            if status.session_id != Some(session.id) {
                return Err(Error::MigrationAborted(format!(
                    "recipient {} is not running session {}",
                    session.recipient, session.id
                )));
            }
            match status.state {
                RecipientState::At(RecipientStep::TransferredMods) => {
                    tracing::debug!(
                        session = %session,
                        cloned = status.cloned,
                        transferred = status.transferred,
                        "recipient caught up"
                    );
                    return Ok(());
                }
                RecipientState::Failed | RecipientState::Aborted | RecipientState::At(RecipientStep::Done) => {
                    return Err(Error::MigrationAborted(format!(
                        "recipient {} is {}: {}",
                        session.recipient,
                        status.state,
                        status.errmsg.unwrap_or_default()
                    )));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "timed out waiting for {} to clone {}",
                    session.recipient, session.range
                )));
            }
            tokio::time::sleep(self.ctx.config.status_poll_interval).await;
        }
    }

    /// Record the move on the config service. If the call errors, the
    /// authority is re-read: a move that already landed counts as committed.
    async fn commit_ownership(&self, session: &MigrationSession) -> Result<ChunkVersion> {
        let config = self.ctx.metadata.config_service();
        let err = match config
            .commit_migration(&session.ns, &session.range, &session.donor, &session.recipient)
            .await
        {
            Ok(version) => return Ok(version),
            Err(e) => e,
        };

        tracing::warn!(session = %session, error = %err, "migration commit failed, checking whether it landed");
        if let Ok(Some(routing)) = config.collection(&session.ns).await {
            if let Some(chunk) = routing.chunk_with_bounds(&session.range) {
                if chunk.owner == session.recipient {
                    return Ok(chunk.version);
                }
            }
        }
        Err(Error::CommitFailed(format!(
            "could not record move of {} to {}: {}",
            session.range, session.recipient, err
        )))
    }

    async fn post_move_delete(
        &self,
        session: &MigrationSession,
        key_pattern: &ShardKeyPattern,
        wait_for_delete: bool,
    ) -> Result<()> {
        let deleter = self.ctx.deleter.clone();
        let metadata = self.ctx.metadata.clone();
        let metrics = self.ctx.metrics.clone();
        let session = session.clone();
        let key_pattern = key_pattern.clone();

        let delete = async move {
            let ns = &session.ns;
            let outcome = deleter
                .delete_range(
                    ns,
                    &key_pattern,
                    &session.range,
                    |key: &ShardKey| {
                        metadata
                            .get_metadata(ns)
                            .map_or(false, |latest| !latest.is_owned_or_pending(key))
                    },
                    DeleteBudget::unbounded(),
                    false,
                )
                .await;
            match &outcome {
                Ok(outcome) => {
                    metrics.post_move_deleted.inc_by(outcome.deleted);
                    tracing::info!(session = %session, deleted = outcome.deleted, "post-move delete finished");
                }
                Err(e) => {
                    tracing::warn!(session = %session, error = %e, "post-move delete failed, orphans left for cleanup");
                }
            }
            outcome.map(|_| ())
        };

        if wait_for_delete {
            delete.await
        } else {
            tokio::spawn(delete);
            Ok(())
        }
    }

    async fn abort(&self, session: &MigrationSession, cause: &Error) {
        tracing::warn!(session = %session, error = %cause, "aborting chunk migration");
        self.ctx.metrics.record_migration_aborted();
        if let Err(e) = self
            .ctx
            .network
            .recv_chunk_abort(&session.recipient, session.id)
            .await
        {
            tracing::warn!(session = %session, error = %e, "could not tell recipient to abort");
        }
    }

    /// `_migrateClone`: the next batch of documents from the initial snapshot.
    /// An empty batch means the snapshot is exhausted.
    pub fn migrate_clone(&self, session_id: Uuid, batch_size: usize) -> Result<Vec<Document>> {
        let source = self.source(session_id)?;
        let storage = self.ctx.replica_set.primary();
        let ns = &source.session.ns;
        let mut docs = Vec::new();
        loop {
            let ids = source.next_batch(batch_size.max(1));
            if ids.is_empty() {
                break;
            }
            // Documents deleted since the snapshot travel as mods.
            docs.extend(
                ids.iter()
                    .filter_map(|id| storage.get(ns, id))
                    .filter(|doc| source.session.range.contains(&source.key_pattern.extract_key(doc))),
            );
            if !docs.is_empty() {
                break;
            }
        }
        Ok(docs)
    }

    /// `_transferMods`: writes to the range since the last call.
    pub fn transfer_mods(&self, session_id: Uuid) -> Result<TransferMods> {
        let source = self.source(session_id)?;
        let storage = self.ctx.replica_set.primary();
        let (upserted, deleted) = source.take_mods();

        let mut mods = TransferMods::default();
        for id in upserted {
            match storage.get(&source.session.ns, &id) {
                Some(doc) => mods.upserts.push(doc),
                None => mods.deletes.push(id),
            }
        }
        mods.deletes.extend(deleted);
        Ok(mods)
    }

    /// Run a local write to `key`, rejecting it while the key's range is in
    /// its critical section and recording it for the recipient otherwise.
    ///
    /// The source table stays read-locked for the whole write, so entering
    /// the critical section waits for writes already in flight.
    pub fn guarded_write<T>(
        &self,
        ns: &Namespace,
        key: &ShardKey,
        id: &Value,
        deleted: bool,
        write: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let sources = self.sources.read();
        let source = sources
            .get(ns)
            .filter(|s| s.session.range.contains(key));
        if let Some(source) = source {
            if source.in_critical_section() {
                return Err(Error::StaleShardVersion {
                    ns: ns.clone(),
                    reason: format!("chunk {} is being migrated", source.session.range),
                });
            }
        }
        let written = write()?;
        if let Some(source) = source {
            source.record_write(id, deleted);
        }
        Ok(written)
    }

    fn enter_critical_section(&self, source: &CloneSource) {
        let _sources = self.sources.write();
        source.critical_section.store(true, Ordering::Release);
    }
}
