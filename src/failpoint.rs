//! Named failpoints for deterministic step control in tests.
//!
//! A failpoint is a named switch checked at a specific point in the code.
//! Switches are set through the `configureFailPoint` command or directly on
//! a [`FailpointRegistry`]. Checks compile to a constant `false` unless the
//! crate is built for tests or with the `failpoints` feature.
//!
//! ```rust,ignore
//! let registry = FailpointRegistry::new();
//! registry.configure("moveChunkHangAtStep3", FailpointMode::AlwaysOn, Document::new())?;
//!
//! // inside the donor coordinator
//! registry.pause_while_active("moveChunkHangAtStep3").await;
//! ```

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::keys::{Document, Value};

/// Halts a secondary's oplog applier while set.
pub const RS_SYNC_APPLY_STOP: &str = "rsSyncApplyStop";

/// Overrides the replication wait used by range deletions. Data: `{seconds: N}`.
pub const RANGE_DELETER_WTIMEOUT: &str = "rangeDeleterWTimeout";

/// Prefix of the donor step hang failpoints, `moveChunkHangAtStep1..6`.
pub const DONOR_HANG_PREFIX: &str = "moveChunkHangAtStep";

/// Prefix of the recipient step hang failpoints, `migrateThreadHangAtStep1..5`.
pub const RECIPIENT_HANG_PREFIX: &str = "migrateThreadHangAtStep";

/// How often a paused task re-checks its failpoint.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Every failpoint name the crate checks. Configuring anything else fails.
static KNOWN_FAILPOINTS: Lazy<HashSet<String>> = Lazy::new(|| {
    let mut names = HashSet::new();
    names.insert(RS_SYNC_APPLY_STOP.to_string());
    names.insert(RANGE_DELETER_WTIMEOUT.to_string());
    for step in 1..=6 {
        names.insert(format!("{}{}", DONOR_HANG_PREFIX, step));
    }
    for step in 1..=5 {
        names.insert(format!("{}{}", RECIPIENT_HANG_PREFIX, step));
    }
    names
});

/// Whether `name` is a failpoint this crate knows about.
pub fn is_known(name: &str) -> bool {
    KNOWN_FAILPOINTS.contains(name)
}

/// Activation mode of a failpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailpointMode {
    /// Trigger on every check.
    AlwaysOn,
    /// Switched off.
    Off,
    /// Trigger on the next `n` checks, then switch off.
    Times(u64),
}

struct FailpointState {
    always: bool,
    remaining: AtomicU64,
    data: Document,
    hit_count: AtomicU64,
    triggered_count: AtomicU64,
}

impl FailpointState {
    fn try_trigger(&self) -> bool {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        let triggered = self.always
            || self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if triggered {
            self.triggered_count.fetch_add(1, Ordering::Relaxed);
        }
        triggered
    }

    fn is_active(&self) -> bool {
        self.always || self.remaining.load(Ordering::SeqCst) > 0
    }
}

/// Registry of failpoints for one process (one shard node or replica member).
pub struct FailpointRegistry {
    failpoints: RwLock<HashMap<String, Arc<FailpointState>>>,
    enabled: AtomicBool,
    total_hits: AtomicU64,
}

impl Default for FailpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FailpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            failpoints: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(cfg!(feature = "failpoints") || cfg!(test)),
            total_hits: AtomicU64::new(0),
        }
    }

    /// Set a failpoint's mode and data. `Off` removes it.
    pub fn configure(&self, name: &str, mode: FailpointMode, data: Document) -> Result<()> {
        if !is_known(name) {
            return Err(Error::InvalidArgument(format!("failpoint not found: {}", name)));
        }
        let (always, remaining) = match mode {
            FailpointMode::Off => {
                self.failpoints.write().remove(name);
                tracing::debug!(failpoint = name, "failpoint disabled");
                return Ok(());
            }
            FailpointMode::AlwaysOn => (true, 0),
            FailpointMode::Times(n) => (false, n),
        };
        let state = Arc::new(FailpointState {
            always,
            remaining: AtomicU64::new(remaining),
            data,
            hit_count: AtomicU64::new(0),
            triggered_count: AtomicU64::new(0),
        });
        self.failpoints.write().insert(name.to_string(), state);
        tracing::debug!(failpoint = name, ?mode, "failpoint configured");
        Ok(())
    }

    /// Switch a failpoint on permanently.
    pub fn enable(&self, name: &str) -> Result<()> {
        self.configure(name, FailpointMode::AlwaysOn, Document::new())
    }

    /// Switch a failpoint off.
    pub fn disable(&self, name: &str) {
        self.failpoints.write().remove(name);
    }

    /// Switch every failpoint off.
    pub fn disable_all(&self) {
        self.failpoints.write().clear();
    }

    /// Globally enable or disable checks.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn state(&self, name: &str) -> Option<Arc<FailpointState>> {
        if !self.enabled.load(Ordering::Relaxed) {
            return None;
        }
        self.failpoints.read().get(name).cloned()
    }

    /// Evaluate a failpoint. Returns `true` if it triggered; a `Times` failpoint
    /// uses up one trigger.
    pub fn check(&self, name: &str) -> bool {
        match self.state(name) {
            Some(state) => {
                self.total_hits.fetch_add(1, Ordering::Relaxed);
                state.try_trigger()
            }
            None => false,
        }
    }

    /// Whether the failpoint would trigger, without consuming it.
    pub fn is_active(&self, name: &str) -> bool {
        self.state(name).map(|s| s.is_active()).unwrap_or(false)
    }

    /// Data attached to an active failpoint.
    pub fn data(&self, name: &str) -> Option<Document> {
        self.state(name)
            .filter(|s| s.is_active())
            .map(|s| s.data.clone())
    }

    /// Integer field of an active failpoint's data.
    pub fn data_i64(&self, name: &str, field: &str) -> Option<i64> {
        self.data(name)
            .and_then(|d| d.get(field).and_then(Value::as_i64))
    }

    /// Block the calling task while the failpoint keeps triggering.
    ///
    /// Returns `true` if the task paused at all.
    pub async fn pause_while_active(&self, name: &str) -> bool {
        let mut paused = false;
        while self.check(name) {
            if !paused {
                tracing::info!(failpoint = name, "paused at failpoint");
                paused = true;
            }
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
        if paused {
            tracing::info!(failpoint = name, "resumed from failpoint");
        }
        paused
    }

    /// Statistics for a configured failpoint.
    pub fn stats(&self, name: &str) -> Option<FailpointStats> {
        self.failpoints.read().get(name).map(|state| FailpointStats {
            hit_count: state.hit_count.load(Ordering::Relaxed),
            triggered_count: state.triggered_count.load(Ordering::Relaxed),
        })
    }

    /// Total checks that found a configured failpoint.
    pub fn total_hits(&self) -> u64 {
        self.total_hits.load(Ordering::Relaxed)
    }

    /// Names of configured failpoints.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.failpoints.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Statistics for a failpoint.
#[derive(Debug, Clone)]
pub struct FailpointStats {
    /// Number of times the failpoint was evaluated.
    pub hit_count: u64,

    /// Number of evaluations that triggered.
    pub triggered_count: u64,
}

/// Evaluate a failpoint, compiling to `false` outside test and `failpoints` builds.
///
/// ```rust,ignore
/// if fail_point!(registry, RS_SYNC_APPLY_STOP) {
///     continue;
/// }
/// ```
#[macro_export]
macro_rules! fail_point {
    ($registry:expr, $name:expr) => {
        (cfg!(feature = "failpoints") || cfg!(test)) && $registry.check($name)
    };
}

/// Pause while a failpoint is active, compiling to nothing outside test and
/// `failpoints` builds.
#[macro_export]
macro_rules! fail_point_pause {
    ($registry:expr, $name:expr) => {
        if cfg!(feature = "failpoints") || cfg!(test) {
            $registry.pause_while_active($name).await;
        }
    };
}
