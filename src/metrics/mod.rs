//! Metrics for migration and orphan cleanup observability.
//!
//! Prometheus-style counters and gauges grouped into one
//! [`ShardingMetrics`] bundle per shard node.
//!
//! ```rust,ignore
//! let metrics = ShardingMetrics::new();
//! metrics.record_migration_start();
//! metrics.record_migration_committed(Duration::from_millis(40));
//! assert_eq!(metrics.snapshot().migrations_committed, 1);
//! ```

mod sharding;

pub use sharding::{ShardingMetrics, ShardingMetricsSnapshot};

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Render metrics in the Prometheus text exposition format.
pub fn render_prometheus(counters: &[&Counter], gauges: &[&Gauge]) -> String {
    let mut out = String::new();
    for c in counters {
        out.push_str(&format!(
            "# HELP {0} {1}\n# TYPE {0} counter\n{0} {2}\n",
            c.name(),
            c.help(),
            c.get()
        ));
    }
    for g in gauges {
        out.push_str(&format!(
            "# HELP {0} {1}\n# TYPE {0} gauge\n{0} {2}\n",
            g.name(),
            g.help(),
            g.get()
        ));
    }
    out
}
