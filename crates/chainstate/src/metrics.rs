//! Block connection metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectMetrics {
    spend_us: AtomicU64,
    script_us: AtomicU64,
    commit_us: AtomicU64,
    blocks: AtomicU64,
    reorgs: AtomicU64,
    orphans_resolved: AtomicU64,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectMetricsSnapshot {
    pub spend_us: u64,
    pub script_us: u64,
    pub commit_us: u64,
    pub blocks: u64,
    pub reorgs: u64,
    pub orphans_resolved: u64,
}

impl ConnectMetrics {
    pub fn record_spend(&self, elapsed: Duration) {
        self.spend_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_script(&self, elapsed: Duration) {
        self.script_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_commit(&self, elapsed: Duration) {
        self.commit_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reorg(&self) {
        self.reorgs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orphan_resolved(&self) {
        self.orphans_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectMetricsSnapshot {
        ConnectMetricsSnapshot {
            spend_us: self.spend_us.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            commit_us: self.commit_us.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            reorgs: self.reorgs.load(Ordering::Relaxed),
            orphans_resolved: self.orphans_resolved.load(Ordering::Relaxed),
        }
    }
}
