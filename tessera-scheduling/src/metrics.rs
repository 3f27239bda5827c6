//! Scheduling counters and gauges.
//!
//! Counters are plain atomics bumped from any component; gauges
//! (`queue_depth`, `free_slots`) are computed from the live components when a
//! snapshot is taken, so they can never drift from the truth.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::band::Band;

/// Monotonic counters for one scheduling session.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub subtasks_submitted: AtomicU64,
    pub subtasks_succeeded: AtomicU64,
    pub subtasks_failed: AtomicU64,
    pub subtasks_cancelled: AtomicU64,
    pub subtasks_rescheduled: AtomicU64,
    pub subtasks_speculated: AtomicU64,
    pub cluster_unavailable: AtomicU64,
}

impl SchedulerMetrics {
    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            subtasks_submitted: self.subtasks_submitted.load(Ordering::Relaxed),
            subtasks_succeeded: self.subtasks_succeeded.load(Ordering::Relaxed),
            subtasks_failed: self.subtasks_failed.load(Ordering::Relaxed),
            subtasks_cancelled: self.subtasks_cancelled.load(Ordering::Relaxed),
            subtasks_rescheduled: self.subtasks_rescheduled.load(Ordering::Relaxed),
            subtasks_speculated: self.subtasks_speculated.load(Ordering::Relaxed),
            cluster_unavailable: self.cluster_unavailable.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub subtasks_submitted: u64,
    pub subtasks_succeeded: u64,
    pub subtasks_failed: u64,
    pub subtasks_cancelled: u64,
    pub subtasks_rescheduled: u64,
    pub subtasks_speculated: u64,
    pub cluster_unavailable: u64,
}

/// Counters plus per-band gauges, as exported to observability consumers.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: CounterSnapshot,
    pub queue_depth: HashMap<Band, usize>,
    pub free_slots: HashMap<Band, usize>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
