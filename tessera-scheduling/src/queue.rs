//! Per-band backpressure queues.
//!
//! Assigned subtasks wait here until their band has a free slot.  Entries are
//! ordered by `(priority, submit_sequence)`: higher priority first, and FIFO
//! among equal priorities via a session-wide monotone sequence number.
//!
//! Removal is lazy: `remove` only drops the id from the live set and the
//! heap entry is skipped when it surfaces, which keeps cancellation O(1).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::band::Band;
use crate::resource::GlobalResourceManager;
use crate::subtask::Priority;

// ── Queue entry ───────────────────────────────────────────────────────────────

/// One queued subtask reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub subtask_id: String,
    pub priority: Priority,
    /// Session-wide submit sequence; preserved across queue migrations so
    /// FIFO-within-priority survives rebalancing.
    pub seq: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: highest priority first, then earliest sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ── BandQueue ─────────────────────────────────────────────────────────────────

/// Priority queue of subtasks assigned to one band.
#[derive(Debug, Default)]
pub struct BandQueue {
    heap: BinaryHeap<QueueEntry>,
    /// Ids still live in this queue; heap entries outside this set are
    /// tombstones.
    live: HashSet<String>,
}

impl BandQueue {
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, subtask_id: &str) -> bool {
        self.live.contains(subtask_id)
    }

    fn push(&mut self, entry: QueueEntry) {
        self.live.insert(entry.subtask_id.clone());
        self.heap.push(entry);
    }

    /// Drop `subtask_id` from the queue.  Returns `false` if it was not here.
    fn remove(&mut self, subtask_id: &str) -> bool {
        self.live.remove(subtask_id)
    }

    fn purge_tombstones(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.live.contains(&top.subtask_id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Pop the top entry iff a slot on `band` can be reserved for it.
    ///
    /// The slot is held by the caller when `Some` is returned.
    fn pop_if_acquirable(
        &mut self,
        band: &Band,
        resources: &GlobalResourceManager,
    ) -> Option<QueueEntry> {
        self.purge_tombstones();
        self.heap.peek()?;
        if !resources.acquire(band, 1) {
            return None;
        }
        // peek succeeded above, so the heap is non-empty
        let entry = self.heap.pop()?;
        self.live.remove(&entry.subtask_id);
        Some(entry)
    }

    /// Take the `n` lowest-priority live entries (the ones that would run
    /// last), leaving the rest in place.
    fn drain_n(&mut self, n: usize) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .heap
            .drain()
            .filter(|e| self.live.contains(&e.subtask_id))
            .collect();
        // ascending: lowest priority (latest seq) first
        entries.sort();

        let n = n.min(entries.len());
        let drained: Vec<QueueEntry> = entries.drain(..n).collect();
        for e in &drained {
            self.live.remove(&e.subtask_id);
        }
        self.heap = entries.into();
        drained
    }

    /// Remove every live entry, highest priority first.
    fn drain_all(&mut self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .heap
            .drain()
            .filter(|e| self.live.contains(&e.subtask_id))
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        self.live.clear();
        entries
    }
}

// ── Session queue set ─────────────────────────────────────────────────────────

/// All band queues of one session, plus the shared submit sequence and the
/// kick used to wake the submit loop ahead of its next tick.
pub struct SubtaskQueueing {
    queues: Mutex<HashMap<Band, BandQueue>>,
    seq: AtomicU64,
    kick: Arc<Notify>,
}

impl Default for SubtaskQueueing {
    fn default() -> Self {
        Self::new()
    }
}

impl SubtaskQueueing {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            kick: Arc::new(Notify::new()),
        }
    }

    /// The notifier the submit loop waits on between ticks.
    pub fn kick_handle(&self) -> Arc<Notify> {
        self.kick.clone()
    }

    /// Wake the submit loop ahead of its next timer tick.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    pub fn add_band(&self, band: Band) {
        self.queues.lock().entry(band).or_default();
    }

    /// Drop `band`'s queue, returning its live entries highest priority
    /// first so the caller can re-feed them to the assigner.
    pub fn remove_band(&self, band: &Band) -> Vec<QueueEntry> {
        let mut queues = self.queues.lock();
        match queues.remove(band) {
            Some(mut q) => q.drain_all(),
            None => Vec::new(),
        }
    }

    /// Enqueue a subtask on `band`.  Returns `false` when the band has no
    /// queue (it left the cluster since assignment); the caller reassigns.
    pub fn push(&self, band: &Band, subtask_id: String, priority: Priority) -> bool {
        let was_empty;
        {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(band) else {
                return false;
            };
            was_empty = queue.is_empty();
            let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
            queue.push(QueueEntry {
                subtask_id,
                priority,
                seq,
            });
        }
        if was_empty {
            self.kick.notify_one();
        }
        true
    }

    /// Pop the best entry of `band` if a slot can be reserved.
    pub fn pop_if_acquirable(
        &self,
        band: &Band,
        resources: &GlobalResourceManager,
    ) -> Option<QueueEntry> {
        self.queues
            .lock()
            .get_mut(band)?
            .pop_if_acquirable(band, resources)
    }

    /// Best-effort removal of one queued subtask.
    pub fn remove(&self, band: &Band, subtask_id: &str) -> bool {
        self.queues
            .lock()
            .get_mut(band)
            .map(|q| q.remove(subtask_id))
            .unwrap_or(false)
    }

    /// Live depth per band (including empty queues).
    pub fn depths(&self) -> HashMap<Band, usize> {
        self.queues
            .lock()
            .iter()
            .map(|(band, q)| (band.clone(), q.len()))
            .collect()
    }

    /// Bands that currently have a queue.
    pub fn bands(&self) -> Vec<Band> {
        self.queues.lock().keys().cloned().collect()
    }

    /// Apply a rebalance plan: negative deltas shed their lowest-priority
    /// entries, positive deltas receive them.  Entries keep their original
    /// sequence numbers, so FIFO-within-priority is preserved on the new
    /// band.  Returns every applied move as `(subtask_id, from, to)`.
    pub fn migrate(&self, moves: &HashMap<Band, i64>) -> Vec<(String, Band, Band)> {
        let mut queues = self.queues.lock();

        // receiving bands may be brand new
        for (band, delta) in moves {
            if *delta > 0 {
                queues.entry(band.clone()).or_default();
            }
        }

        // shed from donors, lowest priority first
        let mut pool: Vec<(Band, QueueEntry)> = Vec::new();
        let mut donors: Vec<(&Band, usize)> = moves
            .iter()
            .filter(|(_, delta)| **delta < 0)
            .map(|(band, delta)| (band, (-*delta) as usize))
            .collect();
        donors.sort_by(|a, b| a.0.cmp(b.0));
        for (band, count) in donors {
            if let Some(queue) = queues.get_mut(band) {
                for entry in queue.drain_n(count) {
                    pool.push((band.clone(), entry));
                }
            }
        }
        // hand the best entries over first
        pool.sort_by(|a, b| b.1.cmp(&a.1));

        let mut receivers: Vec<(Band, usize)> = moves
            .iter()
            .filter(|(_, delta)| **delta > 0)
            .map(|(band, delta)| (band.clone(), *delta as usize))
            .collect();
        receivers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut applied = Vec::new();
        let mut pool = pool.into_iter();
        'outer: for (to, quota) in receivers {
            for _ in 0..quota {
                let Some((from, entry)) = pool.next() else {
                    break 'outer;
                };
                let id = entry.subtask_id.clone();
                if let Some(queue) = queues.get_mut(&to) {
                    queue.push(entry);
                    applied.push((id, from, to.clone()));
                }
            }
        }

        // zero-sum plans leave nothing behind; anything left goes home
        for (from, entry) in pool {
            debug!(band = %from, subtask_id = %entry.subtask_id, "migration quota exhausted; entry stays");
            if let Some(queue) = queues.get_mut(&from) {
                queue.push(entry);
            }
        }

        if !applied.is_empty() {
            self.kick.notify_one();
        }
        applied
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn band(n: &str) -> Band {
        Band::new("w:1234", n)
    }

    fn queueing_with_band(name: &str, capacity: usize) -> (SubtaskQueueing, GlobalResourceManager) {
        let queues = SubtaskQueueing::new();
        queues.add_band(band(name));
        let resources = GlobalResourceManager::new();
        resources.register_band(band(name), capacity);
        (queues, resources)
    }

    #[test]
    fn pops_highest_priority_first() {
        let (queues, resources) = queueing_with_band("numa-0", 8);
        queues.push(&band("numa-0"), "low".into(), Priority::new(0, 0, 0));
        queues.push(&band("numa-0"), "high".into(), Priority::new(2, 0, 0));
        queues.push(&band("numa-0"), "mid".into(), Priority::new(1, 0, 0));

        let order: Vec<String> = std::iter::from_fn(|| {
            queues
                .pop_if_acquirable(&band("numa-0"), &resources)
                .map(|e| e.subtask_id)
        })
        .collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[test]
    fn fifo_among_equal_priorities() {
        let (queues, resources) = queueing_with_band("numa-0", 8);
        for id in ["first", "second", "third"] {
            queues.push(&band("numa-0"), id.into(), Priority::new(1, 1, 1));
        }

        let order: Vec<String> = std::iter::from_fn(|| {
            queues
                .pop_if_acquirable(&band("numa-0"), &resources)
                .map(|e| e.subtask_id)
        })
        .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn pop_stops_when_no_slot_is_free() {
        let (queues, resources) = queueing_with_band("numa-0", 1);
        queues.push(&band("numa-0"), "a".into(), Priority::default());
        queues.push(&band("numa-0"), "b".into(), Priority::default());

        assert!(queues.pop_if_acquirable(&band("numa-0"), &resources).is_some());
        // slot pool is exhausted; the queue must hold the rest back
        assert!(queues.pop_if_acquirable(&band("numa-0"), &resources).is_none());
        assert_eq!(queues.depths()[&band("numa-0")], 1);

        resources.release(&band("numa-0"), 1);
        assert!(queues.pop_if_acquirable(&band("numa-0"), &resources).is_some());
    }

    #[test]
    fn removed_entry_is_never_popped() {
        let (queues, resources) = queueing_with_band("numa-0", 8);
        queues.push(&band("numa-0"), "keep".into(), Priority::new(0, 0, 0));
        queues.push(&band("numa-0"), "drop".into(), Priority::new(9, 0, 0));

        assert!(queues.remove(&band("numa-0"), "drop"));
        assert!(!queues.remove(&band("numa-0"), "drop"));

        let popped = queues
            .pop_if_acquirable(&band("numa-0"), &resources)
            .unwrap();
        assert_eq!(popped.subtask_id, "keep");
        assert!(queues.pop_if_acquirable(&band("numa-0"), &resources).is_none());
    }

    #[test]
    fn push_to_unknown_band_is_rejected() {
        let queues = SubtaskQueueing::new();
        assert!(!queues.push(&band("numa-7"), "x".into(), Priority::default()));
    }

    #[test]
    fn migrate_moves_lowest_priority_entries_and_keeps_order() {
        let queues = SubtaskQueueing::new();
        queues.add_band(band("numa-0"));
        for (id, layer) in [("p3", 3), ("p2", 2), ("p1", 1), ("p0", 0)] {
            queues.push(&band("numa-0"), id.into(), Priority::new(layer, 0, 0));
        }

        let mut moves = HashMap::new();
        moves.insert(band("numa-0"), -2);
        moves.insert(band("numa-1"), 2);
        let applied = queues.migrate(&moves);

        // the two lowest-priority entries moved
        let moved: HashSet<String> = applied.iter().map(|(id, _, _)| id.clone()).collect();
        assert_eq!(moved, HashSet::from(["p0".to_string(), "p1".to_string()]));
        for (_, from, to) in &applied {
            assert_eq!(from, &band("numa-0"));
            assert_eq!(to, &band("numa-1"));
        }

        let depths = queues.depths();
        assert_eq!(depths[&band("numa-0")], 2);
        assert_eq!(depths[&band("numa-1")], 2);

        // the receiver pops in priority order
        let resources = GlobalResourceManager::new();
        resources.register_band(band("numa-1"), 4);
        let order: Vec<String> = std::iter::from_fn(|| {
            queues
                .pop_if_acquirable(&band("numa-1"), &resources)
                .map(|e| e.subtask_id)
        })
        .collect();
        assert_eq!(order, vec!["p1", "p0"]);
    }

    #[test]
    fn remove_band_returns_live_entries_best_first() {
        let queues = SubtaskQueueing::new();
        queues.add_band(band("numa-0"));
        queues.push(&band("numa-0"), "a".into(), Priority::new(1, 0, 0));
        queues.push(&band("numa-0"), "b".into(), Priority::new(5, 0, 0));
        queues.push(&band("numa-0"), "gone".into(), Priority::new(9, 0, 0));
        queues.remove(&band("numa-0"), "gone");

        let drained: Vec<String> = queues
            .remove_band(&band("numa-0"))
            .into_iter()
            .map(|e| e.subtask_id)
            .collect();
        assert_eq!(drained, vec!["b", "a"]);
        assert!(queues.depths().is_empty());
    }

    #[test]
    fn drain_respects_sequence_within_priority() {
        let queues = SubtaskQueueing::new();
        queues.add_band(band("numa-0"));
        for id in ["early", "late"] {
            queues.push(&band("numa-0"), id.into(), Priority::new(1, 0, 0));
        }

        let mut moves = HashMap::new();
        moves.insert(band("numa-0"), -1);
        moves.insert(band("numa-1"), 1);
        let applied = queues.migrate(&moves);

        // FIFO: the later entry is the lower one, so it is shed first
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, "late");
    }
}
