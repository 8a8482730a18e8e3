//! Table of in-progress operations, the shard's equivalent of `currentOp`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::Namespace;

/// One entry of the table.
#[derive(Debug, Clone)]
pub struct ActiveOp {
    pub op_id: Uuid,
    /// Kind of operation, e.g. `moveChunk` or `migrateThread`.
    pub desc: &'static str,
    pub ns: Namespace,
    /// Latest progress message, e.g. `step 3 of 6`.
    pub msg: String,
    pub started_at: Instant,
}

/// In-progress operations of one shard node.
#[derive(Debug, Default)]
pub struct ActiveOps {
    ops: RwLock<HashMap<Uuid, ActiveOp>>,
}

impl ActiveOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an operation. It stays listed until the handle is dropped.
    pub fn begin(self: &Arc<Self>, desc: &'static str, ns: &Namespace) -> ActiveOpHandle {
        let op_id = Uuid::new_v4();
        self.ops.write().insert(
            op_id,
            ActiveOp {
                op_id,
                desc,
                ns: ns.clone(),
                msg: String::new(),
                started_at: Instant::now(),
            },
        );
        ActiveOpHandle {
            table: self.clone(),
            op_id,
            started_at: Instant::now(),
        }
    }

    /// All operations, oldest first.
    pub fn list(&self) -> Vec<ActiveOp> {
        let mut ops: Vec<ActiveOp> = self.ops.read().values().cloned().collect();
        ops.sort_by_key(|op| op.started_at);
        ops
    }

    /// Whether an operation of kind `desc` currently shows `msg`.
    pub fn has_op_with_msg(&self, desc: &str, msg: &str) -> bool {
        self.ops
            .read()
            .values()
            .any(|op| op.desc == desc && op.msg == msg)
    }

    /// Poll until an operation of kind `desc` shows `msg`.
    pub async fn wait_for_msg(&self, desc: &str, msg: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.has_op_with_msg(desc, msg) {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "timed out waiting for {} to reach '{}'",
                    desc, msg
                )));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }
}

/// Keeps an operation listed and lets its owner update the progress message.
#[derive(Debug)]
pub struct ActiveOpHandle {
    table: Arc<ActiveOps>,
    op_id: Uuid,
    started_at: Instant,
}

impl ActiveOpHandle {
    pub fn op_id(&self) -> Uuid {
        self.op_id
    }

    /// Time since the operation began.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn set_msg(&self, msg: impl Into<String>) {
        if let Some(op) = self.table.ops.write().get_mut(&self.op_id) {
            op.msg = msg.into();
        }
    }
}

impl Drop for ActiveOpHandle {
    fn drop(&mut self) {
        self.table.ops.write().remove(&self.op_id);
    }
}
