//! In-memory collaborator doubles shared by the unit tests.
//!
//! One implementation per consumed surface: a controllable cluster service,
//! a static metadata service and a recording worker runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::band::{Band, NodeStatus, Resource};
use crate::cluster::{BandStream, BandsSnapshot, ClusterApi, NodeRole};
use crate::error::{SchedulingError, SchedulingResult};
use crate::meta::{ChunkMeta, MetaApi};
use crate::subtask::{ChunkKey, Subtask};
use crate::worker::WorkerApi;

/// How long the polling helpers wait before a test is declared hung.
const WAIT_ROUNDS: usize = 5_000;

// ── MockCluster ───────────────────────────────────────────────────────────────

/// Cluster service double: bands are set by the test, every change bumps the
/// version, and the whole service can be toggled unavailable.
pub(crate) struct MockCluster {
    version: AtomicU64,
    unavailable: AtomicBool,
    bands_tx: watch::Sender<BandsSnapshot>,
    down_tx: watch::Sender<bool>,
}

impl MockCluster {
    pub fn new() -> Self {
        let (bands_tx, _) = watch::channel(BandsSnapshot::default());
        let (down_tx, _) = watch::channel(false);
        Self {
            version: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            bands_tx,
            down_tx,
        }
    }

    pub fn set_bands(&self, bands: Vec<(Band, Resource)>) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = BandsSnapshot {
            version,
            bands: bands.into_iter().collect(),
        };
        let _ = self.bands_tx.send(snapshot);
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
        let _ = self.down_tx.send(down);
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_all_bands(
        &self,
        _role: NodeRole,
        _statuses: &[NodeStatus],
    ) -> SchedulingResult<HashMap<Band, Resource>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulingError::ClusterUnavailable {
                detail: "mock cluster down".into(),
            });
        }
        Ok(self.bands_tx.borrow().bands.clone())
    }

    async fn watch_all_bands(
        &self,
        _role: NodeRole,
        _statuses: &[NodeStatus],
        version: Option<u64>,
    ) -> SchedulingResult<BandStream> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulingError::ClusterUnavailable {
                detail: "mock cluster down".into(),
            });
        }
        let bands_rx = self.bands_tx.subscribe();
        let down_rx = self.down_tx.subscribe();
        let seen = version.unwrap_or(0);

        // the stream ends when the service "goes down", mimicking a broken
        // connection; the view under test is expected to reconnect
        let stream = stream::unfold(
            (bands_rx, down_rx, seen),
            |(mut bands_rx, mut down_rx, seen)| async move {
                loop {
                    if *down_rx.borrow_and_update() {
                        return None;
                    }
                    let snapshot = bands_rx.borrow_and_update().clone();
                    if snapshot.version > seen {
                        let version = snapshot.version;
                        return Some((snapshot, (bands_rx, down_rx, version)));
                    }
                    tokio::select! {
                        changed = bands_rx.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                        changed = down_rx.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

// ── StaticMeta ────────────────────────────────────────────────────────────────

/// Metadata service double answering from a fixed table.
pub(crate) struct StaticMeta {
    metas: HashMap<ChunkKey, ChunkMeta>,
}

impl StaticMeta {
    pub fn with(entries: Vec<(&str, u64, Vec<Band>)>) -> Self {
        Self {
            metas: entries
                .into_iter()
                .map(|(key, store_size, bands)| {
                    (key.to_string(), ChunkMeta { store_size, bands })
                })
                .collect(),
        }
    }
}

#[async_trait]
impl MetaApi for StaticMeta {
    async fn get_chunk_meta(
        &self,
        keys: &[ChunkKey],
        _fields: &[&str],
    ) -> SchedulingResult<Vec<Option<ChunkMeta>>> {
        Ok(keys.iter().map(|k| self.metas.get(k).cloned()).collect())
    }
}

// ── MockWorker ────────────────────────────────────────────────────────────────

/// Worker runtime double: acknowledges every dispatch immediately and
/// records dispatches and cancels for assertions.  Completion reports are
/// injected by the test through the manager, as the real runtime would.
pub(crate) struct MockWorker {
    dispatched: Mutex<Vec<(String, Band)>>,
    cancels: Mutex<Vec<(String, Band)>>,
}

impl MockWorker {
    pub fn new() -> Self {
        Self {
            dispatched: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
        }
    }

    pub fn dispatched(&self) -> Vec<(String, Band)> {
        self.dispatched.lock().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().len()
    }

    pub fn cancels(&self) -> Vec<(String, Band)> {
        self.cancels.lock().clone()
    }

    /// Poll until at least `n` dispatches were recorded.
    pub async fn wait_for_dispatches(&self, n: usize) {
        for _ in 0..WAIT_ROUNDS {
            if self.dispatch_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("timed out waiting for {n} dispatches");
    }

    /// Poll until at least `n` cancel calls were recorded.
    pub async fn wait_for_cancels(&self, n: usize) {
        for _ in 0..WAIT_ROUNDS {
            if self.cancels.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("timed out waiting for {n} cancels");
    }
}

#[async_trait]
impl WorkerApi for MockWorker {
    async fn run_subtask(&self, subtask: Arc<Subtask>, band: Band) -> SchedulingResult<()> {
        self.dispatched
            .lock()
            .push((subtask.subtask_id.clone(), band));
        Ok(())
    }

    async fn cancel_subtask(&self, subtask_id: &str, band: Band) -> SchedulingResult<()> {
        self.cancels.lock().push((subtask_id.to_string(), band));
        Ok(())
    }
}
