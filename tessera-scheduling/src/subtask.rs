/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Subtask data structures.
//!
//! A subtask is the smallest schedulable unit: a small DAG of chunk operators
//! plus scheduling metadata.  The scheduling core never executes operators;
//! it only inspects the structural fields declared here to decide *where* and
//! *when* a subtask runs.
//!
//! # Ownership model
//! `Subtask` is immutable once submitted.  The manager wraps each one in an
//! `Arc` so dispatch tasks, speculation and the assigner can share it without
//! copies; all mutable lifecycle state lives in the manager, not here.

use std::fmt;

use crate::band::Band;
use crate::error::SchedulingError;

/// Opaque identity of an output data partition.  Globally unique per session.
pub type ChunkKey = String;

// ── Chunk graph ───────────────────────────────────────────────────────────────

/// Operator kind of a chunk-graph node, scheduled by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOp {
    /// A compute operator; produces a chunk on the band the subtask runs on.
    Compute,
    /// Point-to-point input: read one chunk from wherever it resides.
    ///
    /// `broadcaster` marks chunks replicated to many consumers; their size
    /// must not attract successors to a single band.
    Fetch { broadcaster: bool },
    /// Scattered shuffle input; the source data has no meaningful locality.
    FetchShuffle,
}

/// One node of a subtask's chunk graph.
#[derive(Debug, Clone)]
pub struct ChunkNode {
    pub key: ChunkKey,
    pub op: ChunkOp,
    /// `true` if the operator needs a GPU band.
    pub gpu: bool,
    /// `true` for source nodes (no predecessors inside this subtask).
    pub indep: bool,
}

/// A small DAG of chunk operators.
///
/// Only the structural fields the scheduler consumes are modelled: the node
/// list, source iteration and the GPU marker scan.
#[derive(Debug, Clone, Default)]
pub struct ChunkGraph {
    nodes: Vec<ChunkNode>,
}

impl ChunkGraph {
    pub fn new(nodes: Vec<ChunkNode>) -> Self {
        Self { nodes }
    }

    /// All nodes, in insertion order.
    pub fn nodes(&self) -> &[ChunkNode] {
        &self.nodes
    }

    /// Source nodes: inputs to this subtask.
    pub fn iter_indep(&self) -> impl Iterator<Item = &ChunkNode> {
        self.nodes.iter().filter(|n| n.indep)
    }

    /// `true` if any operator in the graph requires a GPU band.
    pub fn uses_gpu(&self) -> bool {
        self.nodes.iter().any(|n| n.gpu)
    }
}

// ── Priority ──────────────────────────────────────────────────────────────────

/// Scheduling priority of a subtask.
///
/// Compared lexicographically over `(layer, depth, tiebreak)`; a *higher*
/// priority runs earlier.  `layer` is the position of the subtask's stage in
/// the session graph, `depth` its distance from the leaves, `tiebreak` an
/// arbitrary producer-chosen discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Priority {
    pub layer: i64,
    pub depth: i64,
    pub tiebreak: i64,
}

impl Priority {
    pub fn new(layer: i64, depth: i64, tiebreak: i64) -> Self {
        Self {
            layer,
            depth,
            tiebreak,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.layer, self.depth, self.tiebreak)
    }
}

// ── Subtask ───────────────────────────────────────────────────────────────────

/// The smallest schedulable unit of a session computation.
#[derive(Debug, Clone, Default)]
pub struct Subtask {
    /// Unique within the session.
    pub subtask_id: String,
    pub session_id: String,
    pub priority: Priority,
    pub chunk_graph: ChunkGraph,
    /// Pre-assigned target bands.  Empty means the assigner is free to choose.
    pub expect_bands: Vec<Band>,
    /// When `true`, `expect_bands` is a hard constraint: the subtask fails
    /// rather than being relocated elsewhere.
    pub bands_specified: bool,
    /// Some operators have side effects and must not run twice.
    pub retryable: bool,
}

impl Subtask {
    pub fn new(
        subtask_id: impl Into<String>,
        session_id: impl Into<String>,
        priority: Priority,
        chunk_graph: ChunkGraph,
    ) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            session_id: session_id.into(),
            priority,
            chunk_graph,
            expect_bands: Vec::new(),
            bands_specified: false,
            retryable: true,
        }
    }
}

// ── Lifecycle state ───────────────────────────────────────────────────────────

/// Lifecycle state of a subtask inside the manager.
///
/// ```text
/// Pending → Assigned → Queued → Submitted → Running → Succeeded
///    ↑                                         │    ↘ Failed
///    └───────────── reschedule ────────────────┘      Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskState {
    Pending,
    Assigned,
    Queued,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SubtaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubtaskState::Succeeded | SubtaskState::Failed | SubtaskState::Cancelled
        )
    }
}

impl fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubtaskState::Pending => "pending",
            SubtaskState::Assigned => "assigned",
            SubtaskState::Queued => "queued",
            SubtaskState::Submitted => "submitted",
            SubtaskState::Running => "running",
            SubtaskState::Succeeded => "succeeded",
            SubtaskState::Failed => "failed",
            SubtaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

/// Terminal outcome of a subtask, delivered to `wait()` callers.
#[derive(Debug, Clone)]
pub struct SubtaskReport {
    pub subtask_id: String,
    pub state: SubtaskState,
    /// The band the final attempt ran on, if any attempt was dispatched.
    pub band: Option<Band>,
    /// Failure cause; `None` for `Succeeded` and plain cancellation.
    pub error: Option<SchedulingError>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(key: &str, gpu: bool) -> ChunkNode {
        ChunkNode {
            key: key.to_string(),
            op: ChunkOp::Fetch { broadcaster: false },
            gpu,
            indep: true,
        }
    }

    fn compute(key: &str, gpu: bool) -> ChunkNode {
        ChunkNode {
            key: key.to_string(),
            op: ChunkOp::Compute,
            gpu,
            indep: false,
        }
    }

    #[test]
    fn priority_orders_lexicographically() {
        // higher layer first, then depth, then tiebreak
        assert!(Priority::new(2, 0, 0) > Priority::new(1, 9, 9));
        assert!(Priority::new(1, 3, 0) > Priority::new(1, 2, 9));
        assert!(Priority::new(1, 1, 5) > Priority::new(1, 1, 4));
        assert_eq!(Priority::new(1, 1, 1), Priority::new(1, 1, 1));
    }

    #[test]
    fn iter_indep_yields_only_sources() {
        let graph = ChunkGraph::new(vec![fetch("a", false), fetch("b", false), compute("c", false)]);
        let keys: Vec<_> = graph.iter_indep().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn uses_gpu_scans_the_whole_graph() {
        let cpu_graph = ChunkGraph::new(vec![fetch("a", false), compute("c", false)]);
        assert!(!cpu_graph.uses_gpu());

        // a single GPU operator anywhere makes the subtask a GPU subtask
        let gpu_graph = ChunkGraph::new(vec![fetch("a", false), compute("c", true)]);
        assert!(gpu_graph.uses_gpu());
    }

    #[test]
    fn terminal_states() {
        assert!(SubtaskState::Succeeded.is_terminal());
        assert!(SubtaskState::Failed.is_terminal());
        assert!(SubtaskState::Cancelled.is_terminal());
        assert!(!SubtaskState::Running.is_terminal());
        assert!(!SubtaskState::Queued.is_terminal());
    }
}
