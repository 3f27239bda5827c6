/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Tessera scheduling – per-session subtask scheduling core.
//!
//! The engine decomposes user computations into a graph of subtasks; workers
//! expose compute *bands* (CPU NUMA domains or GPU devices).  This crate
//! decides which band each subtask runs on and when it is released to
//! execute, handling band churn, locality, load balance and failure-induced
//! rescheduling.  Data readers, chunk metadata storage and the worker
//! execution runtime are collaborators injected behind traits.
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── band/subtask    – core identifiers and data types
//! ├── config/         – YAML scheduling configuration
//! ├── error           – typed scheduling errors
//! ├── cluster/        – live-band projection (snapshot + watch)
//! ├── meta            – batched chunk metadata lookup
//! ├── worker          – worker runtime surface
//! ├── assigner/       – band assignment and queue rebalancing
//! ├── resource        – per-band slot accounting
//! ├── queue           – per-band backpressure queues
//! ├── manager/        – subtask lifecycle FSM + speculation
//! ├── autoscale       – backlog / idle signal derivation
//! ├── metrics         – counters and gauges
//! └── service         – per-session wiring and public surface
//! ```

pub mod assigner;
pub mod autoscale;
pub mod band;
pub mod cluster;
pub mod config;
pub mod error;
pub mod manager;
pub mod meta;
pub mod metrics;
pub mod queue;
pub mod resource;
pub mod service;
pub mod subtask;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
