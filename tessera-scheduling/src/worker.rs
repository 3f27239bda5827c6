/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The consumed surface of the worker-side execution runtime.
//!
//! Dispatch is split in two: `run_subtask` resolves when the worker has
//! *accepted* the subtask (the manager treats a slow acknowledgement as a
//! lost band), and the completion outcome arrives later through
//! `SubtaskManager::on_worker_report`.  Cancellation is best-effort; a worker
//! may still report an outcome for a subtask that was cancelled in flight.

use std::sync::Arc;

use async_trait::async_trait;

use crate::band::Band;
use crate::error::SchedulingResult;
use crate::subtask::Subtask;

/// Completion outcome reported by a worker for one dispatched attempt.
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    Succeeded,
    Errored {
        /// `false` marks failures that would recur on any band.
        retryable: bool,
        message: String,
    },
}

#[async_trait]
pub trait WorkerApi: Send + Sync + 'static {
    /// Dispatch `subtask` to `band`.  Resolves once the worker accepted it.
    async fn run_subtask(&self, subtask: Arc<Subtask>, band: Band) -> SchedulingResult<()>;

    /// Ask the worker to abort a previously dispatched subtask.
    async fn cancel_subtask(&self, subtask_id: &str, band: Band) -> SchedulingResult<()>;
}
