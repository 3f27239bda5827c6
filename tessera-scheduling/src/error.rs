/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the scheduling core.
//!
//! Every variant carries enough data to emit a fully-qualified `tracing`
//! event and to be matched programmatically by callers; subtask failures are
//! isolated, so most variants end up inside a [`SubtaskReport`] rather than
//! aborting a whole call.
//!
//! [`SubtaskReport`]: crate::subtask::SubtaskReport

use thiserror::Error;

use crate::band::{Band, DeviceClass};

/// Convenience alias used throughout the crate.
pub type SchedulingResult<T> = Result<T, SchedulingError>;

/// Failures surfaced by the scheduling core.
#[derive(Debug, Clone, Error)]
pub enum SchedulingError {
    /// No band of the required device class exists in the cluster at all.
    #[error("no {0} bands registered in the cluster")]
    NoMatchingSlots(DeviceClass),

    /// Every candidate band is excluded, or a hard band constraint cannot be
    /// met.
    #[error("no bands available: {detail}")]
    NoAvailableBand { detail: String },

    /// The metadata service has no record for a chunk key.  Not retryable:
    /// the producer submitted a graph referencing a chunk that was never
    /// registered.
    #[error("no metadata recorded for chunk '{key}'")]
    ChunkMetaMissing { key: String },

    /// The band owning a dispatched subtask left the ready set, or its
    /// dispatch RPC timed out.
    #[error("band {band} was lost while the subtask was dispatched")]
    BandLost { band: Band },

    /// The worker reported a failure that is safe to retry elsewhere.
    #[error("worker reported a transient failure: {detail}")]
    WorkerTransient { detail: String },

    /// The worker reported a failure that must not be retried.
    #[error("worker reported a permanent failure: {detail}")]
    WorkerPermanent { detail: String },

    /// The reschedule budget is spent; the last attempt's cause is attached.
    #[error("subtask '{subtask_id}' exhausted its {budget} reschedules: {cause}")]
    RescheduleExhausted {
        subtask_id: String,
        budget: u32,
        #[source]
        cause: Box<SchedulingError>,
    },

    /// The cluster service could not be reached.  Internal: the band watcher
    /// retains its last snapshot and backs off, it never propagates this to
    /// consumers.
    #[error("cluster service unavailable: {detail}")]
    ClusterUnavailable { detail: String },

    /// The subtask id is unknown to this session's manager.
    #[error("unknown subtask '{subtask_id}'")]
    SubtaskNotFound { subtask_id: String },

    /// Invariant breakage inside the core.
    #[error("internal scheduling error: {0}")]
    Internal(String),
}

impl SchedulingError {
    /// `true` for failures that may succeed on another band.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulingError::BandLost { .. } | SchedulingError::WorkerTransient { .. }
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
