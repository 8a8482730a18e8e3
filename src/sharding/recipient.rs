//! Recipient side of chunk migration, the "migrate thread".

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

use super::active_ops::ActiveOpHandle;
use super::range_deleter::DeleteBudget;
use super::session::RecipientState;
use super::steps::RecipientStep;
use super::{MigrationContext, MIGRATE_THREAD_DESC};
use crate::error::{Error, Result};
use crate::replication::OpTime;
use crate::rpc::{RecvChunkStartRequest, RecvChunkStatus, TransferMods};

/// What the donor has asked the receive to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Continue,
    Commit,
    Abort,
}

struct ReceiveSession {
    request: RecvChunkStartRequest,
    state: watch::Sender<RecipientState>,
    signal: watch::Sender<Signal>,
    cloned: AtomicU64,
    transferred: AtomicU64,
    errmsg: Mutex<Option<String>>,
}

impl ReceiveSession {
    fn new(request: RecvChunkStartRequest) -> Self {
        Self {
            request,
            state: watch::channel(RecipientState::Ready).0,
            signal: watch::channel(Signal::Continue).0,
            cloned: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            errmsg: Mutex::new(None),
        }
    }

    fn state(&self) -> RecipientState {
        *self.state.borrow()
    }

    fn signal(&self) -> Signal {
        *self.signal.borrow()
    }

    fn check_abort(&self) -> Result<()> {
        if self.signal() == Signal::Abort {
            return Err(Error::MigrationAborted(format!(
                "receive of {} aborted by donor",
                self.request.range
            )));
        }
        Ok(())
    }

    fn status(&self) -> RecvChunkStatus {
        let state = self.state();
        RecvChunkStatus {
            session_id: Some(self.request.session_id),
            ns: Some(self.request.ns.clone()),
            range: Some(self.request.range.clone()),
            state,
            step: state.step_number(),
            cloned: self.cloned.load(Ordering::Relaxed),
            transferred: self.transferred.load(Ordering::Relaxed),
            errmsg: self.errmsg.lock().clone(),
        }
    }
}

/// Receives chunks from donor shards, one at a time.
pub struct RecipientReceiver {
    ctx: Arc<MigrationContext>,
    current: RwLock<Option<Arc<ReceiveSession>>>,
}

impl RecipientReceiver {
    pub fn new(ctx: Arc<MigrationContext>) -> Self {
        Self {
            ctx,
            current: RwLock::new(None),
        }
    }

    /// `_recvChunkStart`: begin receiving a chunk on a background task.
    pub fn recv_chunk_start(self: &Arc<Self>, request: RecvChunkStartRequest) -> Result<()> {
        let session = {
            let mut current = self.current.write();
            if let Some(active) = current.as_ref() {
                if !active.state().is_terminal() {
                    return Err(Error::MigrationInProgress(format!(
                        "{} is already receiving {} of {} from {}",
                        self.ctx.shard_id, active.request.range, active.request.ns, active.request.from
                    )));
                }
            }
            let session = Arc::new(ReceiveSession::new(request));
            *current = Some(session.clone());
            session
        };

        tracing::info!(
            ns = %session.request.ns,
            range = %session.request.range,
            from = %session.request.from,
            session_id = %session.request.session_id,
            "starting chunk receive"
        );
        let this = self.clone();
        tokio::spawn(async move { this.run(session).await });
        Ok(())
    }

    /// `_recvChunkStatus`
    pub fn recv_chunk_status(&self) -> RecvChunkStatus {
        match self.current.read().as_ref() {
            Some(session) => session.status(),
            None => RecvChunkStatus::idle(),
        }
    }

    /// `_recvChunkCommit`: apply the final writes and wait until the receive
    /// reaches a terminal state.
    pub async fn recv_chunk_commit(&self, session_id: Uuid) -> Result<RecvChunkStatus> {
        let session = self.session(session_id)?;
        session.signal.send_if_modified(|signal| {
            if *signal == Signal::Continue {
                *signal = Signal::Commit;
                true
            } else {
                false
            }
        });

        let mut state = session.state.subscribe();
        let finished = async {
            loop {
                let terminal = state.borrow_and_update().is_terminal();
                if terminal || state.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.ctx.config.commit_timeout, finished)
            .await
            .is_err()
        {
            return Err(Error::Timeout(format!(
                "timed out waiting for receive of {} to commit",
                session.request.range
            )));
        }

        let status = session.status();
        match status.state {
            RecipientState::At(RecipientStep::Done) => Ok(status),
            other => Err(Error::MigrationAborted(format!(
                "receive of {} ended {}: {}",
                session.request.range,
                other,
                status.errmsg.unwrap_or_default()
            ))),
        }
    }

    /// `_recvChunkAbort`. Unknown or finished sessions are ignored.
    pub fn recv_chunk_abort(&self, session_id: Uuid) -> Result<()> {
        if let Ok(session) = self.session(session_id) {
            session.signal.send_replace(Signal::Abort);
            tracing::info!(session_id = %session_id, state = %session.state(), "receive abort requested");
        }
        Ok(())
    }

    fn session(&self, session_id: Uuid) -> Result<Arc<ReceiveSession>> {
        self.current
            .read()
            .as_ref()
            .filter(|s| s.request.session_id == session_id)
            .cloned()
            .ok_or_else(|| Error::MigrationAborted(format!("no chunk receive for session {}", session_id)))
    }

    async fn run(self: Arc<Self>, session: Arc<ReceiveSession>) {
        let op = self.ctx.active_ops.begin(MIGRATE_THREAD_DESC, &session.request.ns);
        let request = &session.request;

        match self.receive(&op, &session).await {
            Ok(()) => {
                tracing::info!(
                    ns = %request.ns,
                    range = %request.range,
                    cloned = session.cloned.load(Ordering::Relaxed),
                    transferred = session.transferred.load(Ordering::Relaxed),
                    elapsed = ?op.elapsed(),
                    "chunk receive finished"
                );
                self.promote(&session).await;
            }
            Err(e) => {
                let state = if session.signal() == Signal::Abort {
                    RecipientState::Aborted
                } else {
                    RecipientState::Failed
                };
                tracing::warn!(ns = %request.ns, range = %request.range, error = %e, state = %state, "chunk receive stopped");
                self.release_range(&session).await;
                *session.errmsg.lock() = Some(e.to_string());
                session.state.send_replace(state);
            }
        }
    }

    async fn receive(&self, op: &ActiveOpHandle, session: &ReceiveSession) -> Result<()> {
        let ctx = &self.ctx;
        let request = &session.request;
        let ns = &request.ns;

        // Step 1: reserve the range and clear leftovers of earlier attempts.
        if let Err(e) = ctx.metadata.reload(ns).await {
            if ctx.metadata.get_metadata(ns).is_none() {
                return Err(e);
            }
            tracing::warn!(ns = %ns, error = %e, "receiving with cached metadata");
        }
        ctx.metadata.reserve_range(ns, &request.range).await?;
        let stale = ctx
            .deleter
            .delete_range(ns, &request.key_pattern, &request.range, |_| true, DeleteBudget::unbounded(), false)
            .await?;
        if stale.deleted > 0 {
            tracing::info!(ns = %ns, range = %request.range, deleted = stale.deleted, "deleted stale documents in incoming range");
        }
        self.reach_step(op, session, RecipientStep::Started).await;
        session.check_abort()?;

        // Step 2
        self.reach_step(op, session, RecipientStep::Cloning).await;
        loop {
            session.check_abort()?;
            let docs = ctx
                .network
                .migrate_clone(&request.from, request.session_id, ctx.config.clone_batch_size)
                .await?;
            if docs.is_empty() {
                break;
            }
            let n = docs.len() as u64;
            for doc in docs {
                ctx.replica_set.upsert(ns, doc)?;
            }
            session.cloned.fetch_add(n, Ordering::Relaxed);
            ctx.metrics.docs_cloned.inc_by(n);
        }

        // Step 3
        self.wait_for_durable().await?;
        self.reach_step(op, session, RecipientStep::Cloned).await;
        session.check_abort()?;

        // Step 4: catch up, then keep draining until the donor decides.
        while self.apply_mods(session).await? > 0 {}
        self.reach_step(op, session, RecipientStep::TransferredMods).await;

        let mut signal = session.signal.subscribe();
        loop {
            let current = *signal.borrow_and_update();
            match current {
                Signal::Commit => break,
                Signal::Abort => return session.check_abort(),
                Signal::Continue => {}
            }
            if self.apply_mods(session).await? == 0 {
                tokio::select! {
                    _ = signal.changed() => {}
                    _ = tokio::time::sleep(ctx.config.status_poll_interval) => {}
                }
            }
        }

        // Step 5
        while self.apply_mods(session).await? > 0 {}
        self.wait_for_durable().await?;
        self.reach_step(op, session, RecipientStep::Done).await;
        Ok(())
    }

    async fn reach_step(&self, op: &ActiveOpHandle, session: &ReceiveSession, step: RecipientStep) {
        session.state.send_replace(RecipientState::At(step));
        op.set_msg(step.progress_message());
        tracing::info!(
            ns = %session.request.ns,
            session_id = %session.request.session_id,
            step = step.number(),
            "migrateThread {}",
            step
        );
        self.ctx.hook.on_recipient_step(&session.request.ns, step).await;
    }

    /// Fetch and apply one batch of donor writes. Returns how many were applied.
    async fn apply_mods(&self, session: &ReceiveSession) -> Result<usize> {
        let ctx = &self.ctx;
        let request = &session.request;
        let TransferMods { upserts, deletes } = ctx
            .network
            .transfer_mods(&request.from, request.session_id)
            .await?;
        let n = upserts.len() + deletes.len();
        for doc in upserts {
            ctx.replica_set.upsert(&request.ns, doc)?;
        }
        for id in deletes {
            ctx.replica_set.delete(&request.ns, &id)?;
        }
        if n > 0 {
            session.transferred.fetch_add(n as u64, Ordering::Relaxed);
            ctx.metrics.mods_applied.inc_by(n as u64);
            tracing::debug!(ns = %request.ns, mods = n, "applied transferred mods");
        }
        Ok(n)
    }

    async fn wait_for_durable(&self) -> Result<()> {
        let last = self.ctx.replica_set.last_op_time();
        if last == OpTime::ZERO {
            return Ok(());
        }
        self.ctx
            .replica_set
            .wait_for_majority(last, self.ctx.replica_set.config().ack_timeout)
            .await
    }

    /// Turn the pending range into an owned chunk once the config service
    /// shows this shard as the owner. If that does not happen in time the
    /// range stays pending for the next reload to resolve.
    async fn promote(&self, session: &ReceiveSession) {
        let ctx = &self.ctx;
        let request = &session.request;
        let deadline = Instant::now() + ctx.config.promote_timeout;
        loop {
            if session.signal() == Signal::Abort {
                tracing::info!(ns = %request.ns, range = %request.range, "receive aborted after commit, releasing range");
                self.release_range(session).await;
                session.state.send_replace(RecipientState::Aborted);
                return;
            }

            if let Ok(Some(routing)) = ctx.metadata.config_service().collection(&request.ns).await {
                if let Some(chunk) = routing.chunk_with_bounds(&request.range) {
                    if chunk.owner == ctx.shard_id {
                        if let Err(e) = ctx
                            .metadata
                            .promote_range(&request.ns, &request.range, &ctx.shard_id, chunk.version)
                            .await
                        {
                            tracing::warn!(ns = %request.ns, range = %request.range, error = %e, "could not promote received range");
                        }
                        return;
                    }
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    ns = %request.ns,
                    range = %request.range,
                    "ownership not committed in time, range stays pending"
                );
                return;
            }
            tokio::time::sleep(ctx.config.status_poll_interval).await;
        }
    }

    async fn release_range(&self, session: &ReceiveSession) {
        let request = &session.request;
        if let Err(e) = self.ctx.metadata.discard_range(&request.ns, &request.range).await {
            tracing::warn!(ns = %request.ns, range = %request.range, error = %e, "could not discard pending range");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, ReplicationConfig};
    use crate::doc;
    use crate::failpoint::FailpointRegistry;
    use crate::keys::{ChunkRange, Document, ShardKey, ShardKeyPattern};
    use crate::metadata::{ConfigService, InMemoryConfigService, MetadataStore};
    use crate::metrics::ShardingMetrics;
    use crate::replication::ReplicaSet;
    use crate::rpc::{ShardNetwork, ShardRequest, ShardResponse};
    use crate::sharding::{ActiveOps, DistLockManager, NoopStepHook, RangeDeleter};
    use crate::types::{Namespace, ShardId};
    use async_trait::async_trait;
    use std::time::Duration;

    fn ns() -> Namespace {
        Namespace::new("foo.bar")
    }

    fn range() -> ChunkRange {
        ChunkRange::new(ShardKey::single(0), ShardKey::single(100)).unwrap()
    }

    /// Donor stand-in that serves a fixed set of documents and mods.
    struct ScriptedDonor {
        docs: Mutex<Vec<Document>>,
        mods: Mutex<Vec<TransferMods>>,
    }

    #[async_trait]
    impl ShardNetwork for ScriptedDonor {
        async fn call(&self, _to: &ShardId, request: ShardRequest) -> Result<ShardResponse> {
            Ok(match request {
                ShardRequest::MigrateClone { batch_size, .. } => {
                    let mut docs = self.docs.lock();
                    let n = batch_size.min(docs.len());
                    ShardResponse::Docs(docs.drain(..n).collect())
                }
                ShardRequest::TransferMods { .. } => {
                    ShardResponse::Mods(self.mods.lock().pop().unwrap_or_default())
                }
                other => panic!("unexpected request {:?}", other),
            })
        }
    }

    async fn setup(donor: ScriptedDonor) -> (Arc<InMemoryConfigService>, Arc<RecipientReceiver>, Arc<MigrationContext>) {
        let config = Arc::new(InMemoryConfigService::new());
        config
            .shard_collection(&ns(), ShardKeyPattern::ascending(&["_id"]).unwrap(), &"s0".into())
            .unwrap();
        config.split_chunk(&ns(), ShardKey::single(0)).unwrap();
        config.split_chunk(&ns(), ShardKey::single(100)).unwrap();

        let replica_set = ReplicaSet::new("s1".into(), ReplicationConfig::for_tests());
        let metrics = Arc::new(ShardingMetrics::new());
        let ctx = Arc::new(MigrationContext {
            shard_id: "s1".into(),
            config: MigrationConfig::for_tests().with_clone_batch_size(2),
            metadata: Arc::new(MetadataStore::new("s1".into(), config.clone())),
            replica_set: replica_set.clone(),
            deleter: Arc::new(RangeDeleter::new(
                replica_set,
                Arc::new(FailpointRegistry::new()),
                metrics.clone(),
            )),
            network: Arc::new(donor),
            locks: DistLockManager::new(),
            active_ops: ActiveOps::new(),
            hook: Arc::new(NoopStepHook),
            metrics,
        });
        (config, Arc::new(RecipientReceiver::new(ctx.clone())), ctx)
    }

    fn start_request() -> RecvChunkStartRequest {
        RecvChunkStartRequest {
            session_id: Uuid::new_v4(),
            ns: ns(),
            range: range(),
            from: "s0".into(),
            key_pattern: ShardKeyPattern::ascending(&["_id"]).unwrap(),
        }
    }

    async fn wait_for_state(receiver: &RecipientReceiver, state: RecipientState) {
        for _ in 0..200 {
            if receiver.recv_chunk_status().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("receiver never reached {}", state);
    }

    #[tokio::test]
    async fn test_receive_clone_mods_and_commit() {
        let donor = ScriptedDonor {
            docs: Mutex::new((1..=5).map(|i| doc! { "_id" => i }).collect()),
            mods: Mutex::new(vec![TransferMods {
                upserts: vec![doc! { "_id" => 50, "late" => true }],
                deletes: vec![2.into()],
            }]),
        };
        let (config, receiver, ctx) = setup(donor).await;
        // A leftover from an earlier aborted receive.
        ctx.replica_set.upsert(&ns(), doc! { "_id" => 99 }).unwrap();

        let request = start_request();
        let session_id = request.session_id;
        receiver.recv_chunk_start(request).unwrap();
        assert!(matches!(
            receiver.recv_chunk_start(start_request()),
            Err(Error::MigrationInProgress(_))
        ));

        wait_for_state(&receiver, RecipientState::At(RecipientStep::TransferredMods)).await;
        let md = ctx.metadata.get_metadata(&ns()).unwrap();
        assert!(md.key_is_pending(&ShardKey::single(3)));
        assert!(ctx.active_ops.has_op_with_msg(MIGRATE_THREAD_DESC, "step 4 of 5"));

        let status = receiver.recv_chunk_commit(session_id).await.unwrap();
        assert_eq!(status.step, 5);
        assert_eq!(status.cloned, 5);
        assert_eq!(status.transferred, 2);

        let storage = ctx.replica_set.primary();
        assert_eq!(storage.count(&ns()), 5);
        assert!(storage.get(&ns(), &2.into()).is_none());
        assert!(storage.get(&ns(), &99.into()).is_none());

        config
            .commit_migration(&ns(), &range(), &"s0".into(), &"s1".into())
            .await
            .unwrap();
        for _ in 0..200 {
            if ctx.metadata.get_metadata(&ns()).unwrap().key_belongs_to_me(&ShardKey::single(3)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("received range was never promoted");
    }

    #[tokio::test]
    async fn test_abort_discards_pending_range() {
        let donor = ScriptedDonor {
            docs: Mutex::new(vec![doc! { "_id" => 1 }]),
            mods: Mutex::new(Vec::new()),
        };
        let (_, receiver, ctx) = setup(donor).await;
        let request = start_request();
        let session_id = request.session_id;
        receiver.recv_chunk_start(request).unwrap();
        wait_for_state(&receiver, RecipientState::At(RecipientStep::TransferredMods)).await;

        receiver.recv_chunk_abort(session_id).unwrap();
        wait_for_state(&receiver, RecipientState::Aborted).await;
        assert_eq!(ctx.metadata.get_metadata(&ns()).unwrap().num_pending(), 0);
        assert!(matches!(
            receiver.recv_chunk_commit(session_id).await,
            Err(Error::MigrationAborted(_))
        ));

        // A new receive may start once the old one is over.
        receiver.recv_chunk_start(start_request()).unwrap();
    }
}
