//! Per-session wiring of the scheduling core.
//!
//! [`SessionScheduler::start`] builds the component graph for one session
//! (cluster view, assigner, slot accounting, band queues, subtask manager),
//! seeds it from an initial cluster snapshot and spawns the background loops:
//!
//! * the **band watch loop**, which applies cluster churn: capacity updates,
//!   new bands, band-loss sweeps and queue rebalancing;
//! * the **submit loop**, which drains band queues into worker dispatches on
//!   every `submit_period` tick and on event kicks;
//! * the **speculation monitor**, when enabled.
//!
//! The components reference each other only downwards (manager → queues /
//! assigner / resources); the loops at this level close the cycle, so no
//! component holds a back-reference.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::assigner::Assigner;
use crate::autoscale::{AutoscaleSignals, AutoscaleTracker};
use crate::band::{Band, Resource};
use crate::cluster::{BandsSnapshot, ClusterApi, ClusterView};
use crate::config::SchedulingConfig;
use crate::error::SchedulingResult;
use crate::manager::speculation::SpeculationMonitor;
use crate::manager::SubtaskManager;
use crate::meta::{MetaApi, MetaClient};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::queue::SubtaskQueueing;
use crate::resource::GlobalResourceManager;
use crate::subtask::{Subtask, SubtaskReport, SubtaskState};
use crate::worker::{WorkerApi, WorkerOutcome};

/// One session's scheduling service.
///
/// Dropping the scheduler aborts its background loops; in-flight worker RPCs
/// are left to the worker runtime to wind down.
pub struct SessionScheduler {
    session_id: String,
    assigner: Arc<Assigner>,
    resources: Arc<GlobalResourceManager>,
    queues: Arc<SubtaskQueueing>,
    manager: Arc<SubtaskManager>,
    metrics: Arc<SchedulerMetrics>,
    autoscale: Arc<AutoscaleTracker>,
    loops: Vec<JoinHandle<()>>,
}

impl SessionScheduler {
    /// Construct and start the scheduling core for `session_id`.
    ///
    /// # Errors
    /// Fails only when the initial cluster snapshot cannot be obtained; this
    /// is the one startup dependency the core cannot do without.
    pub async fn start(
        session_id: impl Into<String>,
        config: SchedulingConfig,
        cluster_api: Arc<dyn ClusterApi>,
        meta_api: Arc<dyn MetaApi>,
        worker_api: Arc<dyn WorkerApi>,
    ) -> SchedulingResult<Self> {
        let session_id = session_id.into();
        let metrics = Arc::new(SchedulerMetrics::default());
        let cluster = ClusterView::new(cluster_api, metrics.clone());

        let initial = cluster.snapshot().await?;
        info!(
            session_id = %session_id,
            bands = initial.len(),
            "session scheduler starting"
        );

        let assigner = Arc::new(Assigner::new(MetaClient::new(meta_api)));
        let resources = Arc::new(GlobalResourceManager::new());
        let queues = Arc::new(SubtaskQueueing::new());
        let autoscale = Arc::new(AutoscaleTracker::new(config.autoscale.clone()));

        assigner.update_bands(0, initial.keys().cloned().collect());
        for (band, resource) in &initial {
            let capacity = resource.slot_capacity(band.device_class());
            resources.register_band(band.clone(), capacity);
            queues.add_band(band.clone());
        }

        let manager = Arc::new(SubtaskManager::new(
            session_id.clone(),
            config.clone(),
            assigner.clone(),
            queues.clone(),
            resources.clone(),
            worker_api,
            metrics.clone(),
        ));

        let mut loops = Vec::new();
        loops.push(tokio::spawn(Self::band_watch_loop(
            cluster,
            initial,
            assigner.clone(),
            resources.clone(),
            queues.clone(),
            manager.clone(),
            autoscale.clone(),
        )));
        loops.push(tokio::spawn(Self::submit_loop(
            config.clone(),
            queues.clone(),
            manager.clone(),
            autoscale.clone(),
        )));
        if config.speculation.enabled {
            loops.push(tokio::spawn(SpeculationMonitor::new(manager.clone()).run()));
        }

        Ok(Self {
            session_id,
            assigner,
            resources,
            queues,
            manager,
            metrics,
            autoscale,
            loops,
        })
    }

    // ── Public scheduling surface ─────────────────────────────────────────────

    /// Submit a batch of subtasks for execution.
    pub async fn submit(&self, subtasks: Vec<Subtask>) -> SchedulingResult<()> {
        let result = self.manager.submit(subtasks).await;
        self.queues.kick();
        result
    }

    /// Best-effort cancellation; confirmation comes from polling or `wait`.
    pub fn cancel(&self, subtask_ids: &[String]) {
        self.manager.cancel(subtask_ids);
    }

    /// Await the terminal report of one subtask.
    pub async fn wait(&self, subtask_id: &str) -> SchedulingResult<SubtaskReport> {
        self.manager.wait(subtask_id).await
    }

    /// Current state of one subtask, if it is still tracked.
    pub fn subtask_state(&self, subtask_id: &str) -> Option<SubtaskState> {
        self.manager.subtask_state(subtask_id)
    }

    /// Completion callback invoked by the worker runtime.
    pub async fn on_worker_report(
        &self,
        subtask_id: &str,
        band: &Band,
        outcome: WorkerOutcome,
    ) {
        self.manager.on_worker_report(subtask_id, band, outcome).await;
        self.queues.kick();
    }

    /// Assignment preview: which band(s) would this batch land on right now.
    /// Used by the tile producer for pre-assignment.
    pub async fn assign_subtasks(
        &self,
        subtasks: &[Subtask],
        exclude_bands: &std::collections::HashSet<Band>,
        random_when_unavailable: bool,
    ) -> SchedulingResult<Vec<Band>> {
        self.assigner
            .assign_subtasks(subtasks, exclude_bands, random_when_unavailable)
            .await
    }

    /// Administrative rebalance: compute a plan for the given queue depths
    /// and apply it to the live queues.  Returns the plan.
    pub fn reassign_subtasks(
        &self,
        band_to_queued: &HashMap<Band, usize>,
    ) -> SchedulingResult<HashMap<Band, i64>> {
        let moves = self.assigner.reassign_subtasks(band_to_queued)?;
        let applied = self.queues.migrate(&moves);
        self.manager.apply_migrations(&applied);
        Ok(moves)
    }

    // ── Observability ─────────────────────────────────────────────────────────

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.metrics.counters(),
            queue_depth: self.queues.depths(),
            free_slots: self
                .resources
                .snapshot()
                .into_iter()
                .map(|(band, (free, _))| (band, free))
                .collect(),
        }
    }

    pub fn autoscale_signals(&self) -> AutoscaleSignals {
        self.autoscale.signals()
    }

    /// Stop the background loops.  Subtask state is kept so late `wait`
    /// callers still observe their reports.
    pub fn stop(&mut self) {
        info!(session_id = %self.session_id, "session scheduler stopping");
        for handle in self.loops.drain(..) {
            handle.abort();
        }
    }

    // ── Background loops ──────────────────────────────────────────────────────

    async fn band_watch_loop(
        cluster: ClusterView,
        initial: HashMap<Band, Resource>,
        assigner: Arc<Assigner>,
        resources: Arc<GlobalResourceManager>,
        queues: Arc<SubtaskQueueing>,
        manager: Arc<SubtaskManager>,
        autoscale: Arc<AutoscaleTracker>,
    ) {
        let mut known = initial;
        let mut watch = Box::pin(cluster.watch());
        while let Some(snapshot) = watch.next().await {
            Self::apply_snapshot(
                snapshot,
                &mut known,
                &assigner,
                &resources,
                &queues,
                &manager,
                &autoscale,
            )
            .await;
        }
    }

    /// Fold one cluster emission into the components: indexes first, then
    /// membership and capacity, then the band-loss sweep, then rebalance.
    async fn apply_snapshot(
        snapshot: BandsSnapshot,
        known: &mut HashMap<Band, Resource>,
        assigner: &Arc<Assigner>,
        resources: &Arc<GlobalResourceManager>,
        queues: &Arc<SubtaskQueueing>,
        manager: &Arc<SubtaskManager>,
        autoscale: &Arc<AutoscaleTracker>,
    ) {
        let fresh = snapshot.bands;
        if !assigner.update_bands(snapshot.version, fresh.keys().cloned().collect()) {
            return;
        }

        let lost: Vec<Band> = known
            .keys()
            .filter(|band| !fresh.contains_key(*band))
            .cloned()
            .collect();
        for band in &lost {
            resources.remove_band(band);
            autoscale.forget_band(band);
            manager.handle_band_lost(band).await;
        }

        for (band, resource) in &fresh {
            let capacity = resource.slot_capacity(band.device_class());
            match known.get(band) {
                None => {
                    info!(band = %band, capacity, "band joined the ready set");
                    resources.register_band(band.clone(), capacity);
                    queues.add_band(band.clone());
                }
                Some(previous)
                    if previous.slot_capacity(band.device_class()) != capacity =>
                {
                    resources.capacity_changed(band, capacity);
                }
                _ => {}
            }
        }
        *known = fresh;

        // spread queued work over the changed membership
        let depths = queues.depths();
        if !depths.is_empty() {
            match assigner.reassign_subtasks(&depths) {
                Ok(moves) => {
                    let applied = queues.migrate(&moves);
                    if !applied.is_empty() {
                        info!(moved = applied.len(), "rebalanced queued subtasks");
                    }
                    manager.apply_migrations(&applied);
                }
                Err(err) => {
                    warn!(error = %err, "queue rebalance skipped");
                }
            }
        }
        queues.kick();
    }

    async fn submit_loop(
        config: SchedulingConfig,
        queues: Arc<SubtaskQueueing>,
        manager: Arc<SubtaskManager>,
        autoscale: Arc<AutoscaleTracker>,
    ) {
        let kick = queues.kick_handle();
        let mut ticker = tokio::time::interval(config.submit_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = kick.notified() => {}
            }
            manager.drain_queues();

            let running = manager.running_counts();
            for (band, queued) in queues.depths() {
                let active = running.get(&band).copied().unwrap_or(0);
                autoscale.observe(&band, queued, active);
            }
        }
    }
}

impl Drop for SessionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulingError;
    use crate::subtask::{ChunkGraph, ChunkNode, ChunkOp, Priority};
    use crate::testing::{MockCluster, MockWorker, StaticMeta};
    use std::time::Duration;

    fn band(addr: &str, name: &str) -> Band {
        Band::new(addr, name)
    }

    fn fast_config() -> SchedulingConfig {
        SchedulingConfig {
            submit_period: Duration::from_millis(20),
            ..SchedulingConfig::default()
        }
    }

    fn fetch_subtask(id: &str, key: &str) -> Subtask {
        Subtask::new(
            id,
            "sess-1",
            Priority::default(),
            ChunkGraph::new(vec![ChunkNode {
                key: key.to_string(),
                op: ChunkOp::Fetch { broadcaster: false },
                gpu: false,
                indep: true,
            }]),
        )
    }

    struct Harness {
        scheduler: SessionScheduler,
        cluster: Arc<MockCluster>,
        worker: Arc<MockWorker>,
    }

    async fn harness(metas: Vec<(&str, u64, Vec<Band>)>) -> Harness {
        let b1 = band("w1:7777", "numa-0");
        let b2 = band("w2:7777", "numa-0");
        let cluster = Arc::new(MockCluster::new());
        cluster.set_bands(vec![
            (b1, Resource::cpu(2.0, 1 << 30)),
            (b2, Resource::cpu(2.0, 1 << 30)),
        ]);
        let worker = Arc::new(MockWorker::new());

        let scheduler = SessionScheduler::start(
            "sess-1",
            fast_config(),
            cluster.clone(),
            Arc::new(StaticMeta::with(metas)),
            worker.clone(),
        )
        .await
        .unwrap();

        Harness {
            scheduler,
            cluster,
            worker,
        }
    }

    #[tokio::test]
    async fn startup_fails_without_a_cluster_snapshot() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_unavailable(true);

        let result = SessionScheduler::start(
            "sess-1",
            fast_config(),
            cluster,
            Arc::new(StaticMeta::with(vec![])),
            Arc::new(MockWorker::new()),
        )
        .await;
        assert!(matches!(
            result,
            Err(SchedulingError::ClusterUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn submitted_subtasks_are_dispatched_and_complete() {
        let home = band("w1:7777", "numa-0");
        let h = harness(vec![("c1", 10, vec![home.clone()])]).await;

        h.scheduler
            .submit(vec![fetch_subtask("s1", "c1")])
            .await
            .unwrap();
        h.worker.wait_for_dispatches(1).await;

        let (id, b) = h.worker.dispatched()[0].clone();
        assert_eq!(b, home);
        h.scheduler
            .on_worker_report(&id, &b, WorkerOutcome::Succeeded)
            .await;

        let report = h.scheduler.wait("s1").await.unwrap();
        assert_eq!(report.state, SubtaskState::Succeeded);

        let metrics = h.scheduler.metrics();
        assert_eq!(metrics.counters.subtasks_submitted, 1);
        assert_eq!(metrics.counters.subtasks_succeeded, 1);
        assert_eq!(metrics.free_slots.values().sum::<usize>(), 4);
    }

    #[tokio::test]
    async fn band_withdrawal_moves_running_work_to_survivors() {
        let home = band("w1:7777", "numa-0");
        let other = band("w2:7777", "numa-0");
        let h = harness(vec![("c1", 10, vec![home.clone()])]).await;

        h.scheduler
            .submit(vec![fetch_subtask("s1", "c1")])
            .await
            .unwrap();
        h.worker.wait_for_dispatches(1).await;
        assert_eq!(h.worker.dispatched()[0].1, home);

        // the worker hosting the band goes away
        h.cluster
            .set_bands(vec![(other.clone(), Resource::cpu(2.0, 1 << 30))]);

        h.worker.wait_for_dispatches(2).await;
        assert_eq!(h.worker.dispatched()[1].1, other);

        h.scheduler
            .on_worker_report("s1", &other, WorkerOutcome::Succeeded)
            .await;
        let report = h.scheduler.wait("s1").await.unwrap();
        assert_eq!(report.state, SubtaskState::Succeeded);
        assert_eq!(report.band, Some(other));
    }

    #[tokio::test]
    async fn admin_rebalance_returns_a_zero_sum_plan() {
        let h = harness(vec![]).await;
        let b1 = band("w1:7777", "numa-0");
        let b2 = band("w2:7777", "numa-0");

        let mut counts = HashMap::new();
        counts.insert(b1, 6);
        counts.insert(b2, 0);
        let moves = h.scheduler.reassign_subtasks(&counts).unwrap();
        assert_eq!(moves.values().sum::<i64>(), 0);
    }

    #[tokio::test]
    async fn assignment_preview_does_not_enqueue() {
        let home = band("w1:7777", "numa-0");
        let h = harness(vec![("c1", 10, vec![home.clone()])]).await;

        let preview = h
            .scheduler
            .assign_subtasks(
                &[fetch_subtask("probe", "c1")],
                &std::collections::HashSet::new(),
                true,
            )
            .await
            .unwrap();
        assert_eq!(preview, vec![home]);
        assert_eq!(h.scheduler.subtask_state("probe"), None);
        assert_eq!(h.scheduler.metrics().queue_depth.values().sum::<usize>(), 0);
    }
}
