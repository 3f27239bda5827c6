//! Streaming projection of live bands.
//!
//! [`ClusterView`] sits between the cluster membership service and the rest
//! of the scheduling core.  It exposes a point-in-time [`snapshot`] and an
//! infinite, restartable [`watch`] sequence that only emits on change and
//! survives cluster-service outages: on failure the last snapshot is retained
//! and re-yielded after a backoff, and the watch resumes from the last version
//! seen.  Consumers never observe an error from the watch.
//!
//! [`snapshot`]: ClusterView::snapshot
//! [`watch`]: ClusterView::watch

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, warn};

use crate::band::{Band, NodeStatus, Resource};
use crate::error::SchedulingResult;
use crate::metrics::SchedulerMetrics;

// ── Constants ─────────────────────────────────────────────────────────────────

/// First retry delay after a cluster-service failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Retry delays double up to this cap.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

// ── Consumed cluster surface ──────────────────────────────────────────────────

/// Which side of the cluster a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Supervisor,
    Worker,
}

/// One emission of the band watch: the full live map plus a version counter
/// that increases monotonically with every cluster change.
#[derive(Debug, Clone, Default)]
pub struct BandsSnapshot {
    pub version: u64,
    pub bands: HashMap<Band, Resource>,
}

/// Stream of band snapshots produced by the cluster service.
pub type BandStream = Pin<Box<dyn Stream<Item = BandsSnapshot> + Send>>;

/// The consumed surface of the cluster membership service.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Point-in-time band map for nodes of `role` in any of `statuses`.
    async fn get_all_bands(
        &self,
        role: NodeRole,
        statuses: &[NodeStatus],
    ) -> SchedulingResult<HashMap<Band, Resource>>;

    /// Open a change stream starting after `version` (or from the current
    /// state when `None`).  Emits only on change.
    async fn watch_all_bands(
        &self,
        role: NodeRole,
        statuses: &[NodeStatus],
        version: Option<u64>,
    ) -> SchedulingResult<BandStream>;
}

// ── ClusterView ───────────────────────────────────────────────────────────────

/// Scheduler-side projection of the live worker bands.
#[derive(Clone)]
pub struct ClusterView {
    api: Arc<dyn ClusterApi>,
    role: NodeRole,
    statuses: Vec<NodeStatus>,
    metrics: Arc<SchedulerMetrics>,
}

impl ClusterView {
    /// A view over schedulable (`Ready`) worker bands.
    pub fn new(api: Arc<dyn ClusterApi>, metrics: Arc<SchedulerMetrics>) -> Self {
        Self::with_filter(api, NodeRole::Worker, vec![NodeStatus::Ready], metrics)
    }

    pub fn with_filter(
        api: Arc<dyn ClusterApi>,
        role: NodeRole,
        statuses: Vec<NodeStatus>,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            api,
            role,
            statuses,
            metrics,
        }
    }

    /// Point-in-time band map, filtered by the configured status set.
    pub async fn snapshot(&self) -> SchedulingResult<HashMap<Band, Resource>> {
        self.api.get_all_bands(self.role, &self.statuses).await
    }

    /// Infinite sequence of band snapshots.
    ///
    /// Versions increase strictly along the sequence; stale emissions from a
    /// restarted upstream watch are dropped.  When the cluster service is
    /// unreachable the last snapshot is re-yielded unchanged after a backoff
    /// and a `cluster_unavailable` event is recorded; the stream never ends
    /// and never yields an error.
    pub fn watch(&self) -> impl Stream<Item = BandsSnapshot> + Send + 'static {
        let state = WatchState {
            api: self.api.clone(),
            role: self.role,
            statuses: self.statuses.clone(),
            metrics: self.metrics.clone(),
            upstream: None,
            last: None,
            backoff: INITIAL_BACKOFF,
        };

        stream::unfold(state, |mut s| async move {
            loop {
                if s.upstream.is_none() {
                    let resume = s.last.as_ref().map(|l| l.version);
                    match s.api.watch_all_bands(s.role, &s.statuses, resume).await {
                        Ok(upstream) => {
                            s.upstream = Some(upstream);
                            s.backoff = INITIAL_BACKOFF;
                        }
                        Err(err) => {
                            if let Some(unchanged) = s.note_unavailable(&err.to_string()).await {
                                return Some((unchanged, s));
                            }
                            continue;
                        }
                    }
                }

                let Some(upstream) = s.upstream.as_mut() else {
                    continue;
                };
                match upstream.next().await {
                    Some(snapshot) => {
                        if let Some(last) = &s.last {
                            if snapshot.version <= last.version {
                                debug!(
                                    version = snapshot.version,
                                    seen = last.version,
                                    "dropping stale bands snapshot"
                                );
                                continue;
                            }
                        }
                        s.last = Some(snapshot.clone());
                        return Some((snapshot, s));
                    }
                    None => {
                        // Upstream closed; re-establish from the last version.
                        s.upstream = None;
                        if let Some(unchanged) = s.note_unavailable("watch stream ended").await {
                            return Some((unchanged, s));
                        }
                    }
                }
            }
        })
    }
}

struct WatchState {
    api: Arc<dyn ClusterApi>,
    role: NodeRole,
    statuses: Vec<NodeStatus>,
    metrics: Arc<SchedulerMetrics>,
    upstream: Option<BandStream>,
    last: Option<BandsSnapshot>,
    backoff: Duration,
}

impl WatchState {
    /// Record an outage, sleep the current backoff and hand back the retained
    /// snapshot (if there is one) so consumers see an unchanged emission
    /// instead of an error.
    async fn note_unavailable(&mut self, detail: &str) -> Option<BandsSnapshot> {
        warn!(
            event = "cluster_unavailable",
            detail = detail,
            backoff_ms = self.backoff.as_millis() as u64,
            "cluster service unavailable; retaining last band snapshot"
        );
        self.metrics
            .cluster_unavailable
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        self.last.clone()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
