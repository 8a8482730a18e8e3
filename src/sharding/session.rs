//! Migration sessions and per-side states.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::steps::{DonorStep, RecipientStep};
use crate::keys::ChunkRange;
use crate::types::{Namespace, ShardId};

/// State of the donor side of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonorState {
    /// Working through a step.
    At(DonorStep),
    /// Ownership moved and the post-move delete finished or was handed off.
    Done,
    /// Stopped before the commit point; nothing changed.
    Aborted,
    /// Failed at or after the commit point; ownership is not rolled back.
    Failed,
}

impl DonorState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DonorState::Done | DonorState::Aborted | DonorState::Failed)
    }

    /// Whether a failure in this state can still be undone.
    pub fn is_abortable(&self) -> bool {
        matches!(self, DonorState::At(step) if *step < DonorStep::Committed)
    }
}

impl fmt::Display for DonorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DonorState::At(step) => write!(f, "{}", step),
            DonorState::Done => write!(f, "done"),
            DonorState::Aborted => write!(f, "aborted"),
            DonorState::Failed => write!(f, "failed"),
        }
    }
}

/// State of the recipient side of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientState {
    /// No receive has started.
    Ready,
    /// Working through a step. `At(Done)` means the commit was handled.
    At(RecipientStep),
    /// The donor aborted the receive; the pending range was discarded.
    Aborted,
    /// The receive failed locally; the pending range was discarded.
    Failed,
}

impl RecipientState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecipientState::At(RecipientStep::Done) | RecipientState::Aborted | RecipientState::Failed
        )
    }

    /// Whether a new receive may start.
    pub fn is_idle(&self) -> bool {
        matches!(self, RecipientState::Ready) || self.is_terminal()
    }

    /// Step number reported in status replies, 0 when idle or failed.
    pub fn step_number(&self) -> u8 {
        match self {
            RecipientState::At(step) => step.number(),
            _ => 0,
        }
    }
}

impl fmt::Display for RecipientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientState::Ready => write!(f, "ready"),
            RecipientState::At(step) => write!(f, "{}", step),
            RecipientState::Aborted => write!(f, "aborted"),
            RecipientState::Failed => write!(f, "failed"),
        }
    }
}

/// One chunk migration between two shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSession {
    pub id: Uuid,
    pub ns: Namespace,
    pub range: ChunkRange,
    pub donor: ShardId,
    pub recipient: ShardId,
}

impl MigrationSession {
    pub fn new(ns: Namespace, range: ChunkRange, donor: ShardId, recipient: ShardId) -> Self {
        Self {
            id: Uuid::new_v4(),
            ns,
            range,
            donor,
            recipient,
        }
    }
}

impl fmt::Display for MigrationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {} ({})",
            self.ns, self.range, self.donor, self.recipient, self.id
        )
    }
}
