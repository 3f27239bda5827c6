/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Band identity and worker resource types.
//!
//! A *band* is a schedulable execution domain exposed by a worker: one CPU
//! NUMA domain or one GPU device.  Bands are the unit the whole scheduling
//! core operates on: the assigner picks bands, the queues are per band, and
//! slot accounting is per band.
//!
//! # Ordering
//! `Band` derives `Ord` over `(address, name)`, so any sorted collection of
//! bands iterates in a stable, deterministic order regardless of which worker
//! reported first.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Device class ──────────────────────────────────────────────────────────────

/// The device class of a band, derived from its name prefix.
///
/// Worker bands are named `numa-<n>` for CPU NUMA domains and `gpu-<n>` for
/// GPU devices.  Names with any other prefix are treated as CPU bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceClass {
    /// CPU NUMA domain (`numa-*`).
    Numa,
    /// GPU device (`gpu-*`).
    Gpu,
}

impl DeviceClass {
    /// Derive the class from a band name.
    pub fn from_band_name(name: &str) -> Self {
        if name.starts_with("gpu") {
            DeviceClass::Gpu
        } else {
            DeviceClass::Numa
        }
    }

    /// The band-name prefix for this class.
    pub fn prefix(self) -> &'static str {
        match self {
            DeviceClass::Numa => "numa",
            DeviceClass::Gpu => "gpu",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Numa => write!(f, "cpu"),
            DeviceClass::Gpu => write!(f, "gpu"),
        }
    }
}

// ── Band ──────────────────────────────────────────────────────────────────────

/// Identity of one schedulable execution domain on a worker.
///
/// `address` is the worker endpoint (`host:port`); `name` identifies the
/// domain within the worker (`numa-0`, `gpu-1`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Band {
    pub address: String,
    pub name: String,
}

impl Band {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    /// Device class derived from the band name prefix.
    pub fn device_class(&self) -> DeviceClass {
        DeviceClass::from_band_name(&self.name)
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.name)
    }
}

// ── Resource ──────────────────────────────────────────────────────────────────

/// Resources a band contributes to the cluster.
///
/// Values are monotonic within one band lifetime; a shrinking band is
/// reported as a band restart by the cluster service.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Resource {
    pub num_cpus: f64,
    pub num_gpus: f64,
    pub mem_bytes: u64,
}

impl Resource {
    pub fn cpu(num_cpus: f64, mem_bytes: u64) -> Self {
        Self {
            num_cpus,
            num_gpus: 0.0,
            mem_bytes,
        }
    }

    pub fn gpu(num_gpus: f64, mem_bytes: u64) -> Self {
        Self {
            num_cpus: 0.0,
            num_gpus,
            mem_bytes,
        }
    }

    /// Number of subtask slots this resource provides for a band of the given
    /// class.  Fractional capacities round down.
    pub fn slot_capacity(&self, class: DeviceClass) -> usize {
        let raw = match class {
            DeviceClass::Numa => self.num_cpus,
            DeviceClass::Gpu => self.num_gpus,
        };
        if raw.is_sign_negative() {
            0
        } else {
            raw.floor() as usize
        }
    }
}

// ── NodeStatus ────────────────────────────────────────────────────────────────

/// Lifecycle status of a worker node as reported by the cluster service.
///
/// Only `Ready` nodes expose schedulable bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Starting,
    Ready,
    Stopping,
    Stopped,
}

impl NodeStatus {
    /// `true` only for `Ready`; all other statuses drain their bands.
    pub fn is_schedulable(self) -> bool {
        matches!(self, NodeStatus::Ready)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
