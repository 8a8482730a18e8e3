//! Replica set with an operation log, background appliers and a
//! majority-acknowledgement gate.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::oplog::{OpKind, OpTime, OplogEntry};
use super::storage::Storage;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::fail_point;
use crate::failpoint::{FailpointRegistry, RS_SYNC_APPLY_STOP};
use crate::keys::{Document, Value};
use crate::types::{Namespace, ShardId};

/// Maximum entries a secondary applies per round.
const APPLY_BATCH_LIMIT: usize = 256;

/// A secondary member: its own storage, applied position and failpoints.
pub struct ReplicaMember {
    name: String,
    storage: Arc<Storage>,
    applied: AtomicU64,
    failpoints: Arc<FailpointRegistry>,
}

impl ReplicaMember {
    fn new(name: String) -> Self {
        Self {
            name,
            storage: Arc::new(Storage::new()),
            applied: AtomicU64::new(0),
            failpoints: Arc::new(FailpointRegistry::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This member's copy of the data.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Index of the last oplog entry applied.
    pub fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Failpoints local to this member (e.g. `rsSyncApplyStop`).
    pub fn failpoints(&self) -> &Arc<FailpointRegistry> {
        &self.failpoints
    }
}

/// Oplog entries not yet applied by every secondary.
#[derive(Default)]
struct Oplog {
    /// Index of the last entry dropped from the front.
    base: u64,
    entries: VecDeque<OplogEntry>,
    last: OpTime,
}

impl Oplog {
    fn next_index(&self) -> u64 {
        self.last.index + 1
    }

    /// Drop entries every member has applied.
    fn compact(&mut self, applied: u64) {
        let applied = applied.min(self.last.index);
        if applied <= self.base {
            return;
        }
        self.entries.drain(..(applied - self.base) as usize);
        self.base = applied;
    }
}

struct Shared {
    oplog: Mutex<Oplog>,
    last_index: watch::Sender<u64>,
    progress: Notify,
    members: Vec<Arc<ReplicaMember>>,
}

impl Shared {
    fn entries_after(&self, index: u64) -> Vec<OplogEntry> {
        let oplog = self.oplog.lock();
        let start = index.saturating_sub(oplog.base) as usize;
        oplog
            .entries
            .iter()
            .skip(start)
            .take(APPLY_BATCH_LIMIT)
            .cloned()
            .collect()
    }

    /// Lowest index applied by every secondary.
    fn applied_by_all(&self) -> u64 {
        self.members
            .iter()
            .map(|m| m.applied_index())
            .min()
            .unwrap_or(u64::MAX)
    }

    fn compact(&self) {
        let applied = self.applied_by_all();
        self.oplog.lock().compact(applied);
    }
}

/// A shard's replica set as seen from its primary.
///
/// Writes are applied to the primary's storage and appended to the oplog in
/// one step; secondaries apply the oplog on background tasks. Must be created
/// inside a tokio runtime.
pub struct ReplicaSet {
    shard_id: ShardId,
    term: u64,
    config: ReplicationConfig,
    primary: Arc<Storage>,
    secondaries: Vec<Arc<ReplicaMember>>,
    shared: Arc<Shared>,
    appliers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicaSet {
    /// Create a replica set of `config.members` members and start the
    /// secondaries' appliers.
    pub fn new(shard_id: ShardId, config: ReplicationConfig) -> Arc<Self> {
        let (last_index, _) = watch::channel(0);
        let secondaries: Vec<Arc<ReplicaMember>> = (1..config.members.max(1))
            .map(|i| Arc::new(ReplicaMember::new(format!("{}/{}", shard_id, i))))
            .collect();
        let shared = Arc::new(Shared {
            oplog: Mutex::new(Oplog::default()),
            last_index,
            progress: Notify::new(),
            members: secondaries.clone(),
        });

        let appliers = secondaries
            .iter()
            .map(|member| {
                tokio::spawn(run_applier(
                    shared.clone(),
                    member.clone(),
                    config.apply_interval,
                ))
            })
            .collect();

        tracing::debug!(shard = %shard_id, members = config.members, "replica set started");

        Arc::new(Self {
            shard_id,
            term: 1,
            config,
            primary: Arc::new(Storage::new()),
            secondaries,
            shared,
            appliers: Mutex::new(appliers),
        })
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// The primary's storage. Reads go here; writes go through the set.
    pub fn primary(&self) -> &Arc<Storage> {
        &self.primary
    }

    pub fn secondaries(&self) -> &[Arc<ReplicaMember>] {
        &self.secondaries
    }

    /// Insert or replace a document.
    pub fn upsert(&self, ns: &Namespace, doc: Document) -> Result<OpTime> {
        if doc.id().is_none() {
            return Err(Error::InvalidArgument(format!("document {} has no _id", doc)));
        }
        let mut oplog = self.shared.oplog.lock();
        self.append(&mut oplog, ns, OpKind::Upsert(doc))
    }

    /// Delete a document. Returns `None` (and logs nothing) if it is absent.
    pub fn delete(&self, ns: &Namespace, id: &Value) -> Result<Option<OpTime>> {
        self.delete_if(ns, id, |_| true)
    }

    /// Delete a document if `predicate` accepts its current version.
    ///
    /// The predicate runs under the oplog lock, so no write to the same
    /// document can land between the check and the delete.
    pub fn delete_if<P>(&self, ns: &Namespace, id: &Value, predicate: P) -> Result<Option<OpTime>>
    where
        P: FnOnce(&Document) -> bool,
    {
        let mut oplog = self.shared.oplog.lock();
        match self.primary.get(ns, id) {
            Some(current) if predicate(&current) => self
                .append(&mut oplog, ns, OpKind::Delete(id.clone()))
                .map(Some),
            _ => Ok(None),
        }
    }

    fn append(&self, oplog: &mut Oplog, ns: &Namespace, kind: OpKind) -> Result<OpTime> {
        let op_time = OpTime::new(self.term, oplog.next_index());
        let entry = OplogEntry {
            op_time,
            ns: ns.clone(),
            kind,
        };
        self.primary.apply(&entry)?;
        oplog.entries.push_back(entry);
        oplog.last = op_time;
        if self.secondaries.is_empty() {
            oplog.compact(op_time.index);
        }
        self.shared.last_index.send_replace(op_time.index);
        Ok(op_time)
    }

    /// Position of the latest write.
    pub fn last_op_time(&self) -> OpTime {
        self.shared.oplog.lock().last
    }

    /// Entries kept for secondaries that have not applied them yet.
    pub fn retained_entries(&self) -> usize {
        self.shared.oplog.lock().entries.len()
    }

    /// Members (primary included) that have applied `op_time`.
    pub fn acked_count(&self, op_time: OpTime) -> usize {
        1 + self
            .secondaries
            .iter()
            .filter(|m| m.applied_index() >= op_time.index)
            .count()
    }

    /// Wait until a majority of members have applied `op_time`.
    pub async fn wait_for_majority(&self, op_time: OpTime, timeout: Duration) -> Result<()> {
        self.wait_for_acks(op_time, self.config.majority(), timeout).await
    }

    /// Wait until every member has applied `op_time`.
    pub async fn wait_for_all(&self, op_time: OpTime, timeout: Duration) -> Result<()> {
        self.wait_for_acks(op_time, 1 + self.secondaries.len(), timeout)
            .await
    }

    async fn wait_for_acks(&self, op_time: OpTime, required: usize, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.acked_count(op_time) >= required {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let acked = self.acked_count(op_time);
                if acked >= required {
                    return Ok(());
                }
                tracing::warn!(
                    shard = %self.shard_id,
                    %op_time,
                    acked,
                    required,
                    ?timeout,
                    "waiting for replication timed out"
                );
                return Err(Error::ReplicationTimeout {
                    waited: timeout,
                    op_time,
                    acked,
                    required,
                });
            }
        }
    }
}

impl Drop for ReplicaSet {
    fn drop(&mut self) {
        for handle in self.appliers.lock().drain(..) {
            handle.abort();
        }
    }
}

async fn run_applier(shared: Arc<Shared>, member: Arc<ReplicaMember>, interval: Duration) {
    let mut last_index = shared.last_index.subscribe();
    loop {
        if fail_point!(member.failpoints, RS_SYNC_APPLY_STOP) {
            tokio::time::sleep(interval).await;
            continue;
        }

        let batch = shared.entries_after(member.applied_index());
        if batch.is_empty() {
            tokio::select! {
                changed = last_index.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
            continue;
        }

        for entry in &batch {
            if let Err(e) = member.storage.apply(entry) {
                tracing::error!(member = %member.name, op_time = %entry.op_time, error = %e, "failed to apply oplog entry");
            }
            member.applied.store(entry.op_time.index, Ordering::SeqCst);
        }
        tracing::trace!(member = %member.name, applied = member.applied_index(), "applied oplog batch");
        shared.compact();
        shared.progress.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::testing::wait_until;

    fn ns() -> Namespace {
        Namespace::new("foo.bar")
    }

    #[tokio::test]
    async fn test_majority_ack_after_apply() {
        let set = ReplicaSet::new(ShardId::new("s0"), ReplicationConfig::for_tests());
        let op = set.upsert(&ns(), doc! { "_id" => 1 }).unwrap();
        set.wait_for_majority(op, Duration::from_secs(5)).await.unwrap();
        assert_eq!(set.secondaries()[0].storage().count(&ns()), 1);
    }

    #[tokio::test]
    async fn test_stopped_secondary_times_out() {
        let set = ReplicaSet::new(ShardId::new("s0"), ReplicationConfig::for_tests());
        set.secondaries()[0].failpoints().enable(RS_SYNC_APPLY_STOP).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let op = set.upsert(&ns(), doc! { "_id" => 1 }).unwrap();
        let err = set
            .wait_for_majority(op, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(set.primary().count(&ns()), 1);

        set.secondaries()[0].failpoints().disable(RS_SYNC_APPLY_STOP);
        set.wait_for_all(op, Duration::from_secs(5)).await.unwrap();
        assert_eq!(set.secondaries()[0].storage().count(&ns()), 1);
    }

    #[tokio::test]
    async fn test_delete_of_missing_doc_is_not_logged() {
        let set = ReplicaSet::new(ShardId::new("s0"), ReplicationConfig::for_tests());
        assert!(set.delete(&ns(), &Value::Int(7)).unwrap().is_none());
        assert_eq!(set.last_op_time(), OpTime::ZERO);

        set.upsert(&ns(), doc! { "_id" => 7 }).unwrap();
        let op = set.delete(&ns(), &Value::Int(7)).unwrap().unwrap();
        assert_eq!(op, OpTime::new(1, 2));
    }

    #[tokio::test]
    async fn test_delete_if_checks_current_version() {
        let set = ReplicaSet::new(ShardId::new("s0"), ReplicationConfig::for_tests());
        set.upsert(&ns(), doc! { "_id" => 1, "x" => 1 }).unwrap();
        set.upsert(&ns(), doc! { "_id" => 1, "x" => 2 }).unwrap();

        let stale = |d: &Document| d.get("x") == Some(&Value::Int(1));
        assert!(set.delete_if(&ns(), &Value::Int(1), stale).unwrap().is_none());
        assert_eq!(set.primary().count(&ns()), 1);
        assert_eq!(set.last_op_time(), OpTime::new(1, 2));

        let op = set
            .delete_if(&ns(), &Value::Int(1), |d| d.get("x") == Some(&Value::Int(2)))
            .unwrap();
        assert_eq!(op, Some(OpTime::new(1, 3)));
        assert_eq!(set.primary().count(&ns()), 0);
    }

    #[tokio::test]
    async fn test_oplog_keeps_only_unapplied_entries() {
        let set = ReplicaSet::new(ShardId::new("s0"), ReplicationConfig::for_tests());
        let mut op = OpTime::ZERO;
        for id in 0..10 {
            op = set.upsert(&ns(), doc! { "_id" => id }).unwrap();
        }
        set.wait_for_all(op, Duration::from_secs(5)).await.unwrap();
        assert!(wait_until(|| set.retained_entries() == 0, Duration::from_secs(5)).await);
        assert_eq!(set.last_op_time(), OpTime::new(1, 10));

        set.secondaries()[0].failpoints().enable(RS_SYNC_APPLY_STOP).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for id in 10..15 {
            op = set.upsert(&ns(), doc! { "_id" => id }).unwrap();
        }
        assert_eq!(op, OpTime::new(1, 15));
        assert!(wait_until(|| set.retained_entries() == 5, Duration::from_secs(5)).await);

        set.secondaries()[0].failpoints().disable(RS_SYNC_APPLY_STOP);
        set.wait_for_all(op, Duration::from_secs(5)).await.unwrap();
        assert_eq!(set.secondaries()[0].storage().count(&ns()), 15);
        assert!(wait_until(|| set.retained_entries() == 0, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_single_member_set_acks_immediately() {
        let config = ReplicationConfig {
            members: 1,
            ..ReplicationConfig::for_tests()
        };
        let set = ReplicaSet::new(ShardId::new("s0"), config);
        let op = set.upsert(&ns(), doc! { "_id" => 1 }).unwrap();
        set.wait_for_majority(op, Duration::from_millis(1)).await.unwrap();
    }
}
