//! Numbered migration steps and the hook invoked on every step transition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::fail_point_pause;
use crate::failpoint::{FailpointRegistry, DONOR_HANG_PREFIX, RECIPIENT_HANG_PREFIX};
use crate::types::Namespace;

/// The six donor steps of `moveChunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DonorStep {
    /// Range validated and migration lock taken.
    Started,
    /// Local metadata reloaded and the range confirmed.
    ClonedOwnershipView,
    /// Recipient told to start receiving.
    RecipientStarted,
    /// Recipient caught up; critical section entered.
    ModsDrained,
    /// Recipient acked commit and the authority recorded the new owner.
    Committed,
    /// Moved documents being deleted locally.
    PostMoveDelete,
}

impl DonorStep {
    pub const TOTAL: u8 = 6;

    pub fn number(&self) -> u8 {
        match self {
            DonorStep::Started => 1,
            DonorStep::ClonedOwnershipView => 2,
            DonorStep::RecipientStarted => 3,
            DonorStep::ModsDrained => 4,
            DonorStep::Committed => 5,
            DonorStep::PostMoveDelete => 6,
        }
    }

    /// Name of the failpoint that pauses the donor right after this step.
    pub fn hang_failpoint(&self) -> String {
        format!("{}{}", DONOR_HANG_PREFIX, self.number())
    }

    /// Progress message published while at this step.
    pub fn progress_message(&self) -> String {
        format!("step {} of {}", self.number(), Self::TOTAL)
    }
}

impl fmt::Display for DonorStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DonorStep::Started => write!(f, "started"),
            DonorStep::ClonedOwnershipView => write!(f, "cloned_ownership_view"),
            DonorStep::RecipientStarted => write!(f, "recipient_started"),
            DonorStep::ModsDrained => write!(f, "mods_drained"),
            DonorStep::Committed => write!(f, "committed"),
            DonorStep::PostMoveDelete => write!(f, "post_move_delete"),
        }
    }
}

/// The five recipient steps of a chunk receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecipientStep {
    /// Range reserved as pending.
    Started,
    /// Bulk copy from the donor in progress.
    Cloning,
    /// Bulk copy finished.
    Cloned,
    /// Buffered donor writes applied; steady state.
    TransferredMods,
    /// Commit signal handled.
    Done,
}

impl RecipientStep {
    pub const TOTAL: u8 = 5;

    pub fn number(&self) -> u8 {
        match self {
            RecipientStep::Started => 1,
            RecipientStep::Cloning => 2,
            RecipientStep::Cloned => 3,
            RecipientStep::TransferredMods => 4,
            RecipientStep::Done => 5,
        }
    }

    /// Name of the failpoint that pauses the recipient right after this step.
    pub fn hang_failpoint(&self) -> String {
        format!("{}{}", RECIPIENT_HANG_PREFIX, self.number())
    }

    pub fn progress_message(&self) -> String {
        format!("step {} of {}", self.number(), Self::TOTAL)
    }
}

impl fmt::Display for RecipientStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientStep::Started => write!(f, "started"),
            RecipientStep::Cloning => write!(f, "cloning"),
            RecipientStep::Cloned => write!(f, "cloned"),
            RecipientStep::TransferredMods => write!(f, "transferred_mods"),
            RecipientStep::Done => write!(f, "done"),
        }
    }
}

/// Called by the coordinators right after each step is reached.
///
/// Migration correctness never depends on the hook; it exists so tests can
/// hold a coordinator at a known step.
#[async_trait]
pub trait StepHook: Send + Sync {
    async fn on_donor_step(&self, ns: &Namespace, step: DonorStep);

    async fn on_recipient_step(&self, ns: &Namespace, step: RecipientStep);
}

/// Hook that does nothing.
pub struct NoopStepHook;

#[async_trait]
impl StepHook for NoopStepHook {
    async fn on_donor_step(&self, _ns: &Namespace, _step: DonorStep) {}

    async fn on_recipient_step(&self, _ns: &Namespace, _step: RecipientStep) {}
}

/// Hook that pauses while the step's hang failpoint is set.
pub struct FailpointStepHook {
    registry: Arc<FailpointRegistry>,
}

impl FailpointStepHook {
    pub fn new(registry: Arc<FailpointRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl StepHook for FailpointStepHook {
    async fn on_donor_step(&self, _ns: &Namespace, step: DonorStep) {
        fail_point_pause!(self.registry, &step.hang_failpoint());
    }

    async fn on_recipient_step(&self, _ns: &Namespace, step: RecipientStep) {
        fail_point_pause!(self.registry, &step.hang_failpoint());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failpoint;
    use std::time::Duration;

    #[test]
    fn test_step_names_are_known_failpoints() {
        for step in [
            DonorStep::Started,
            DonorStep::ClonedOwnershipView,
            DonorStep::RecipientStarted,
            DonorStep::ModsDrained,
            DonorStep::Committed,
            DonorStep::PostMoveDelete,
        ] {
            assert!(failpoint::is_known(&step.hang_failpoint()));
        }
        assert_eq!(DonorStep::ModsDrained.progress_message(), "step 4 of 6");
        assert_eq!(RecipientStep::Cloned.hang_failpoint(), "migrateThreadHangAtStep3");
        assert_eq!(RecipientStep::Done.progress_message(), "step 5 of 5");
    }

    #[tokio::test]
    async fn test_failpoint_hook_pauses_at_step() {
        let registry = Arc::new(FailpointRegistry::new());
        registry.enable("moveChunkHangAtStep2").unwrap();
        let hook = Arc::new(FailpointStepHook::new(registry.clone()));

        let h = hook.clone();
        let task = tokio::spawn(async move {
            h.on_donor_step(&Namespace::new("foo.bar"), DonorStep::Started).await;
            h.on_donor_step(&Namespace::new("foo.bar"), DonorStep::ClonedOwnershipView).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        registry.disable("moveChunkHangAtStep2");
        task.await.unwrap();
    }
}
