//! Subtask lifecycle management.
//!
//! [`SubtaskManager`] owns every subtask of one session from submission to a
//! terminal state.  It drives the FSM
//! `Pending → Assigned → Queued → Submitted → Running → terminal`, applies
//! the retry policy on band failures, executes best-effort cancellation and
//! issues speculative duplicates for stragglers (see [`speculation`]).
//!
//! Worker reports may arrive out of order or after a subtask is already
//! terminal; only transitions valid from the current state are applied, the
//! rest are dropped with a debug log.  Slot release is idempotent per
//! attempt, so a cancel racing a completion can never free a slot twice.

pub mod speculation;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::assigner::Assigner;
use crate::band::Band;
use crate::config::SchedulingConfig;
use crate::error::{SchedulingError, SchedulingResult};
use crate::metrics::SchedulerMetrics;
use crate::queue::{QueueEntry, SubtaskQueueing};
use crate::resource::GlobalResourceManager;
use crate::subtask::{Subtask, SubtaskReport, SubtaskState};
use crate::worker::{WorkerApi, WorkerOutcome};

/// How many times a requeue retries when bands vanish between assignment and
/// enqueueing.
const REQUEUE_ATTEMPTS: usize = 5;

// ── Per-subtask bookkeeping ───────────────────────────────────────────────────

struct SubtaskInfo {
    subtask: Arc<Subtask>,
    state: SubtaskState,
    /// Owning band while Assigned..Running.
    band: Option<Band>,
    /// Bands excluded from future assignments of this subtask.
    exclude_bands: HashSet<Band>,
    num_reschedules: u32,
    /// The primary attempt holds a slot from dispatch until release.
    slot_held: bool,
    /// In-flight duplicate, if speculation issued one.
    speculative_band: Option<Band>,
    speculative_slot_held: bool,
    cancel_requested: bool,
    started_at: Option<Instant>,
    done: watch::Sender<Option<SubtaskReport>>,
}

impl SubtaskInfo {
    fn new(subtask: Arc<Subtask>) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            subtask,
            state: SubtaskState::Pending,
            band: None,
            exclude_bands: HashSet::new(),
            num_reschedules: 0,
            slot_held: false,
            speculative_band: None,
            speculative_slot_held: false,
            cancel_requested: false,
            started_at: None,
            done,
        }
    }
}

/// Which in-flight attempt a worker event refers to.
enum Attempt {
    Primary,
    Speculative,
    Stale,
}

fn attempt_of(info: &SubtaskInfo, band: &Band) -> Attempt {
    if info.band.as_ref() == Some(band) {
        Attempt::Primary
    } else if info.speculative_band.as_ref() == Some(band) {
        Attempt::Speculative
    } else {
        Attempt::Stale
    }
}

// ── SubtaskManager ────────────────────────────────────────────────────────────

/// Lifecycle state machine for one session's subtasks.
pub struct SubtaskManager {
    session_id: String,
    pub(crate) config: SchedulingConfig,
    assigner: Arc<Assigner>,
    queues: Arc<SubtaskQueueing>,
    resources: Arc<GlobalResourceManager>,
    worker: Arc<dyn WorkerApi>,
    metrics: Arc<SchedulerMetrics>,
    subtasks: Mutex<HashMap<String, SubtaskInfo>>,
    /// Finished-run durations per graph layer, kept for straggler medians
    /// even after the subtasks themselves are garbage-collected.
    layer_runtimes: Mutex<HashMap<i64, Vec<Duration>>>,
}

impl SubtaskManager {
    pub fn new(
        session_id: impl Into<String>,
        config: SchedulingConfig,
        assigner: Arc<Assigner>,
        queues: Arc<SubtaskQueueing>,
        resources: Arc<GlobalResourceManager>,
        worker: Arc<dyn WorkerApi>,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            assigner,
            queues,
            resources,
            worker,
            metrics,
            subtasks: Mutex::new(HashMap::new()),
            layer_runtimes: Mutex::new(HashMap::new()),
        }
    }

    // ── Submission ────────────────────────────────────────────────────────────

    /// Accept a batch of subtasks: assign each a band and enqueue it.
    ///
    /// Subtasks are assigned in input order.  Failures are isolated: a
    /// subtask the assigner rejects becomes terminal `Failed` and the rest of
    /// the batch proceeds; the first such error is also returned so the
    /// caller learns about it without polling.
    pub async fn submit(self: &Arc<Self>, subtasks: Vec<Subtask>) -> SchedulingResult<()> {
        let subtasks: Vec<Arc<Subtask>> = {
            let known = self.subtasks.lock();
            subtasks
                .into_iter()
                .filter(|s| {
                    if known.contains_key(&s.subtask_id) {
                        warn!(subtask_id = %s.subtask_id, "duplicate submission ignored");
                        false
                    } else {
                        true
                    }
                })
                .map(Arc::new)
                .collect()
        };
        if subtasks.is_empty() {
            return Ok(());
        }

        self.metrics
            .subtasks_submitted
            .fetch_add(subtasks.len() as u64, std::sync::atomic::Ordering::Relaxed);

        let no_exclude = HashSet::new();
        let plain: Vec<Subtask> = subtasks.iter().map(|s| (**s).clone()).collect();
        let mut first_err = None;

        let assigns = match self.assigner.assign_subtasks(&plain, &no_exclude, true).await {
            Ok(bands) => bands.into_iter().map(Some).collect::<Vec<_>>(),
            Err(batch_err) => {
                // retry one by one so a single bad subtask cannot sink the
                // whole batch
                debug!(error = %batch_err, "batch assignment failed; isolating per subtask");
                let mut assigns = Vec::with_capacity(plain.len());
                for subtask in &plain {
                    match self
                        .assigner
                        .assign_subtasks(std::slice::from_ref(subtask), &no_exclude, true)
                        .await
                    {
                        Ok(mut bands) => assigns.push(bands.pop()),
                        Err(err) => {
                            if first_err.is_none() {
                                first_err = Some(err.clone());
                            }
                            assigns.push(None);
                            self.record_assignment_failure(subtask, err);
                        }
                    }
                }
                assigns
            }
        };

        for (subtask, band) in subtasks.into_iter().zip(assigns) {
            let Some(band) = band else { continue };
            {
                let mut map = self.subtasks.lock();
                let mut new_info = SubtaskInfo::new(subtask.clone());
                new_info.state = SubtaskState::Assigned;
                new_info.band = Some(band.clone());
                map.insert(subtask.subtask_id.clone(), new_info);
            }
            self.enqueue(&subtask.subtask_id, band).await;
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record a subtask the assigner rejected outright.
    fn record_assignment_failure(&self, subtask: &Subtask, err: SchedulingError) {
        warn!(
            subtask_id = %subtask.subtask_id,
            session_id = %self.session_id,
            error = %err,
            "subtask failed assignment"
        );
        let mut map = self.subtasks.lock();
        let mut new_info = SubtaskInfo::new(Arc::new(subtask.clone()));
        self.finish(
            &subtask.subtask_id,
            &mut new_info,
            SubtaskState::Failed,
            Some(err),
        );
        map.insert(subtask.subtask_id.clone(), new_info);
    }

    /// Move a subtask into its band queue, reassigning if the band vanished
    /// in between.  The state goes to Queued before the push so a submit-loop
    /// pop can never observe a half-enqueued subtask.
    async fn enqueue(self: &Arc<Self>, subtask_id: &str, band: Band) {
        let mut band = band;
        for _ in 0..REQUEUE_ATTEMPTS {
            let priority = {
                let mut map = self.subtasks.lock();
                let Some(info) = map.get_mut(subtask_id) else {
                    return;
                };
                if info.state.is_terminal() {
                    return;
                }
                info.state = SubtaskState::Queued;
                info.band = Some(band.clone());
                info.subtask.priority
            };

            if self.queues.push(&band, subtask_id.to_string(), priority) {
                return;
            }

            // band disappeared between assignment and enqueueing
            debug!(subtask_id, band = %band, "queue gone; reassigning");
            let (subtask, exclude) = {
                let mut map = self.subtasks.lock();
                let Some(info) = map.get_mut(subtask_id) else {
                    return;
                };
                info.state = SubtaskState::Pending;
                info.band = None;
                info.exclude_bands.insert(band.clone());
                (info.subtask.clone(), info.exclude_bands.clone())
            };
            match self
                .assigner
                .assign_subtasks(std::slice::from_ref(&*subtask), &exclude, true)
                .await
            {
                Ok(mut bands) => match bands.pop() {
                    Some(next) => band = next,
                    None => return,
                },
                Err(err) => {
                    self.fail_subtask(subtask_id, err);
                    return;
                }
            }
        }
        self.fail_subtask(
            subtask_id,
            SchedulingError::Internal("no stable band to enqueue on".into()),
        );
    }

    // ── Queue draining and dispatch ───────────────────────────────────────────

    /// One submit-loop pass: scan bands in shuffled order and dispatch while
    /// slots can be reserved.
    pub fn drain_queues(self: &Arc<Self>) {
        let mut bands = self.queues.bands();
        bands.shuffle(&mut rand::thread_rng());
        for band in bands {
            while let Some(entry) = self.queues.pop_if_acquirable(&band, &self.resources) {
                self.dispatch(entry, band.clone());
            }
        }
    }

    /// Dispatch one popped entry.  The caller has already reserved a slot on
    /// `band`; ownership of that reservation passes to the subtask here.
    fn dispatch(self: &Arc<Self>, entry: QueueEntry, band: Band) {
        let subtask = {
            let mut map = self.subtasks.lock();
            let Some(info) = map.get_mut(&entry.subtask_id) else {
                self.resources.release(&band, 1);
                return;
            };
            if info.state != SubtaskState::Queued {
                debug!(
                    subtask_id = %entry.subtask_id,
                    state = %info.state,
                    "popped subtask no longer queued; returning slot"
                );
                self.resources.release(&band, 1);
                return;
            }
            info.state = SubtaskState::Submitted;
            info.band = Some(band.clone());
            info.slot_held = true;
            info.subtask.clone()
        };

        let mgr = self.clone();
        let dispatch_timeout = self.config.submit_period * 2;
        tokio::spawn(async move {
            let ack = tokio::time::timeout(
                dispatch_timeout,
                mgr.worker.run_subtask(subtask.clone(), band.clone()),
            )
            .await;
            match ack {
                Ok(Ok(())) => mgr.on_worker_started(&subtask.subtask_id, &band),
                Ok(Err(err)) => {
                    warn!(subtask_id = %subtask.subtask_id, band = %band, error = %err, "dispatch failed");
                    mgr.on_band_lost_attempt(&subtask.subtask_id, &band).await;
                }
                Err(_) => {
                    warn!(subtask_id = %subtask.subtask_id, band = %band, "dispatch timed out");
                    mgr.on_band_lost_attempt(&subtask.subtask_id, &band).await;
                }
            }
        });
    }

    pub(crate) fn on_worker_started(&self, subtask_id: &str, band: &Band) {
        let mut map = self.subtasks.lock();
        let Some(info) = map.get_mut(subtask_id) else {
            return;
        };
        match attempt_of(info, band) {
            Attempt::Primary if info.state == SubtaskState::Submitted => {
                info.state = SubtaskState::Running;
                info.started_at = Some(Instant::now());
            }
            Attempt::Speculative => {
                // duplicate acknowledged; the primary drives the state
            }
            _ => {
                debug!(subtask_id, band = %band, state = %info.state, "dropping stale start event");
            }
        }
    }

    // ── Worker reports ────────────────────────────────────────────────────────

    /// Apply a completion report from `band`.  Reports for terminal or
    /// rescheduled subtasks, and reports from bands that no longer own an
    /// attempt, are dropped.
    pub async fn on_worker_report(
        self: &Arc<Self>,
        subtask_id: &str,
        band: &Band,
        outcome: WorkerOutcome,
    ) {
        enum Action {
            None,
            CancelTwin { twin: Band },
            Requeue,
        }

        let action = {
            let mut map = self.subtasks.lock();
            let Some(info) = map.get_mut(subtask_id) else {
                debug!(subtask_id, "report for unknown subtask dropped");
                return;
            };
            if info.state.is_terminal() {
                debug!(subtask_id, state = %info.state, "report after terminal state dropped");
                return;
            }
            if info.cancel_requested {
                debug!(subtask_id, "report raced a cancel; dropped");
                return;
            }

            match (attempt_of(info, band), outcome) {
                (Attempt::Stale, _) => {
                    debug!(subtask_id, band = %band, "report from stale band dropped");
                    Action::None
                }
                (Attempt::Primary, WorkerOutcome::Succeeded) => {
                    if !matches!(
                        info.state,
                        SubtaskState::Running | SubtaskState::Submitted
                    ) {
                        debug!(subtask_id, state = %info.state, "success report in invalid state dropped");
                        Action::None
                    } else {
                        self.release_primary(info);
                        let twin = info.speculative_band.take();
                        if info.speculative_slot_held {
                            if let Some(twin) = &twin {
                                self.resources.release(twin, 1);
                            }
                            info.speculative_slot_held = false;
                        }
                        self.record_runtime(info);
                        self.finish(subtask_id, info, SubtaskState::Succeeded, None);
                        match twin {
                            Some(twin) => Action::CancelTwin { twin },
                            None => Action::None,
                        }
                    }
                }
                (Attempt::Speculative, WorkerOutcome::Succeeded) => {
                    // the duplicate won; retire the primary attempt
                    let loser = info.band.clone();
                    self.release_primary(info);
                    if info.speculative_slot_held {
                        self.resources.release(band, 1);
                        info.speculative_slot_held = false;
                    }
                    info.speculative_band = None;
                    info.band = Some(band.clone());
                    self.record_runtime(info);
                    self.finish(subtask_id, info, SubtaskState::Succeeded, None);
                    match loser {
                        Some(twin) => Action::CancelTwin { twin },
                        None => Action::None,
                    }
                }
                (Attempt::Speculative, WorkerOutcome::Errored { message, .. }) => {
                    // a failed duplicate never counts against the budget
                    debug!(subtask_id, band = %band, message, "speculative attempt failed");
                    if info.speculative_slot_held {
                        self.resources.release(band, 1);
                        info.speculative_slot_held = false;
                    }
                    info.speculative_band = None;
                    Action::None
                }
                (Attempt::Primary, WorkerOutcome::Errored { retryable, message }) => {
                    self.release_primary(info);
                    if !retryable || !info.subtask.retryable {
                        let err = SchedulingError::WorkerPermanent { detail: message };
                        self.finish(subtask_id, info, SubtaskState::Failed, Some(err));
                        Action::None
                    } else {
                        let cause = SchedulingError::WorkerTransient { detail: message };
                        if self.begin_reschedule(subtask_id, info, band, cause) {
                            Action::Requeue
                        } else {
                            Action::None
                        }
                    }
                }
            }
        };

        match action {
            Action::None => {}
            Action::CancelTwin { twin } => {
                let mgr = self.clone();
                let id = subtask_id.to_string();
                tokio::spawn(async move {
                    let _ = mgr.worker.cancel_subtask(&id, twin).await;
                });
            }
            Action::Requeue => self.requeue(subtask_id).await,
        }
    }

    /// A dispatched attempt lost its band (RPC failure or timeout).
    async fn on_band_lost_attempt(self: &Arc<Self>, subtask_id: &str, band: &Band) {
        let requeue = {
            let mut map = self.subtasks.lock();
            let Some(info) = map.get_mut(subtask_id) else {
                return;
            };
            if info.state.is_terminal() {
                return;
            }
            match attempt_of(info, band) {
                Attempt::Speculative => {
                    if info.speculative_slot_held {
                        self.resources.release(band, 1);
                        info.speculative_slot_held = false;
                    }
                    info.speculative_band = None;
                    false
                }
                Attempt::Primary => {
                    self.release_primary(info);
                    let cause = SchedulingError::BandLost { band: band.clone() };
                    if !info.subtask.retryable {
                        self.finish(subtask_id, info, SubtaskState::Failed, Some(cause));
                        false
                    } else {
                        self.begin_reschedule(subtask_id, info, band, cause)
                    }
                }
                Attempt::Stale => false,
            }
        };
        if requeue {
            self.requeue(subtask_id).await;
        }
    }

    /// Sweep every subtask owned by a band that left the ready set.
    ///
    /// Queued entries go back to the assigner with the band excluded;
    /// dispatched attempts become band-lost events.  The caller removes the
    /// band from the slot accounting first, so releases here are no-ops.
    pub async fn handle_band_lost(self: &Arc<Self>, band: &Band) {
        info!(session_id = %self.session_id, band = %band, "band left the ready set");

        let queued: Vec<QueueEntry> = self.queues.remove_band(band);
        let mut to_requeue: Vec<String> = Vec::new();

        {
            let mut map = self.subtasks.lock();
            for entry in queued {
                if let Some(info) = map.get_mut(&entry.subtask_id) {
                    if info.state == SubtaskState::Queued {
                        info.state = SubtaskState::Pending;
                        info.band = None;
                        info.exclude_bands.insert(band.clone());
                        to_requeue.push(entry.subtask_id.clone());
                    }
                }
            }

            let dispatched: Vec<String> = map
                .iter()
                .filter(|(_, info)| {
                    matches!(
                        info.state,
                        SubtaskState::Submitted | SubtaskState::Running
                    ) && (info.band.as_ref() == Some(band)
                        || info.speculative_band.as_ref() == Some(band))
                })
                .map(|(id, _)| id.clone())
                .collect();

            for id in dispatched {
                let Some(info) = map.get_mut(&id) else { continue };
                if info.speculative_band.as_ref() == Some(band) {
                    info.speculative_band = None;
                    info.speculative_slot_held = false;
                    continue;
                }
                self.release_primary(info);
                let cause = SchedulingError::BandLost { band: band.clone() };
                if !info.subtask.retryable {
                    self.finish(&id, info, SubtaskState::Failed, Some(cause));
                } else if self.begin_reschedule(&id, info, band, cause) {
                    to_requeue.push(id.clone());
                }
            }
        }

        for id in to_requeue {
            self.requeue(&id).await;
        }
    }

    /// Point queued subtasks at their new bands after a rebalance migration.
    pub fn apply_migrations(&self, moves: &[(String, Band, Band)]) {
        let mut map = self.subtasks.lock();
        for (subtask_id, _, to) in moves {
            if let Some(info) = map.get_mut(subtask_id) {
                if info.state == SubtaskState::Queued {
                    info.band = Some(to.clone());
                }
            }
        }
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// Best-effort cancellation; fire-and-forget and idempotent per subtask.
    pub fn cancel(self: &Arc<Self>, subtask_ids: &[String]) {
        for subtask_id in subtask_ids {
            let mut map = self.subtasks.lock();
            let Some(info) = map.get_mut(subtask_id) else {
                continue;
            };
            match info.state {
                SubtaskState::Succeeded | SubtaskState::Failed | SubtaskState::Cancelled => {}
                SubtaskState::Pending | SubtaskState::Assigned => {
                    self.finish(subtask_id, info, SubtaskState::Cancelled, None);
                }
                SubtaskState::Queued => {
                    if let Some(band) = info.band.clone() {
                        self.queues.remove(&band, subtask_id);
                    }
                    self.finish(subtask_id, info, SubtaskState::Cancelled, None);
                }
                SubtaskState::Submitted | SubtaskState::Running => {
                    if info.cancel_requested {
                        continue;
                    }
                    info.cancel_requested = true;
                    let bands: Vec<Band> = info
                        .band
                        .iter()
                        .chain(info.speculative_band.iter())
                        .cloned()
                        .collect();
                    drop(map);

                    let mgr = self.clone();
                    let id = subtask_id.clone();
                    let cancel_timeout = self.config.subtask_cancel_timeout;
                    tokio::spawn(async move {
                        for band in bands {
                            let _ = tokio::time::timeout(
                                cancel_timeout,
                                mgr.worker.cancel_subtask(&id, band),
                            )
                            .await;
                        }
                        mgr.force_cancelled(&id);
                    });
                }
            }
        }
        self.queues.kick();
    }

    /// The cancel window elapsed (or the worker acknowledged): force the
    /// terminal state and free every held slot.
    fn force_cancelled(&self, subtask_id: &str) {
        let mut map = self.subtasks.lock();
        let Some(info) = map.get_mut(subtask_id) else {
            return;
        };
        if info.state.is_terminal() {
            return;
        }
        self.release_primary(info);
        if info.speculative_slot_held {
            if let Some(band) = &info.speculative_band {
                self.resources.release(band, 1);
            }
            info.speculative_slot_held = false;
        }
        self.finish(subtask_id, info, SubtaskState::Cancelled, None);
    }

    // ── Completion signalling ─────────────────────────────────────────────────

    /// Await the terminal report of `subtask_id`.
    ///
    /// Observing the report releases the manager's record of the subtask.
    pub async fn wait(&self, subtask_id: &str) -> SchedulingResult<SubtaskReport> {
        let mut rx = {
            let map = self.subtasks.lock();
            let info = map
                .get(subtask_id)
                .ok_or_else(|| SchedulingError::SubtaskNotFound {
                    subtask_id: subtask_id.to_string(),
                })?;
            info.done.subscribe()
        };

        let report = loop {
            let current = rx.borrow().clone();
            if let Some(report) = current {
                break report;
            }
            if rx.changed().await.is_err() {
                return Err(SchedulingError::SubtaskNotFound {
                    subtask_id: subtask_id.to_string(),
                });
            }
        };

        // terminal and observed: the record can go
        let mut map = self.subtasks.lock();
        if map
            .get(subtask_id)
            .map(|info| info.state.is_terminal())
            .unwrap_or(false)
        {
            map.remove(subtask_id);
        }
        Ok(report)
    }

    /// Current lifecycle state, for callers that poll instead of waiting.
    pub fn subtask_state(&self, subtask_id: &str) -> Option<SubtaskState> {
        self.subtasks.lock().get(subtask_id).map(|i| i.state)
    }

    pub fn num_reschedules(&self, subtask_id: &str) -> Option<u32> {
        self.subtasks
            .lock()
            .get(subtask_id)
            .map(|i| i.num_reschedules)
    }

    /// Dispatched-attempt count per band, used by the autoscale tracker.
    pub fn running_counts(&self) -> HashMap<Band, usize> {
        let map = self.subtasks.lock();
        let mut counts: HashMap<Band, usize> = HashMap::new();
        for info in map.values() {
            if matches!(info.state, SubtaskState::Submitted | SubtaskState::Running) {
                if let Some(band) = &info.band {
                    *counts.entry(band.clone()).or_insert(0) += 1;
                }
                if let Some(band) = &info.speculative_band {
                    *counts.entry(band.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn release_primary(&self, info: &mut SubtaskInfo) {
        if info.slot_held {
            if let Some(band) = &info.band {
                self.resources.release(band, 1);
            }
            info.slot_held = false;
        }
    }

    fn record_runtime(&self, info: &SubtaskInfo) {
        if let Some(started) = info.started_at {
            self.layer_runtimes
                .lock()
                .entry(info.subtask.priority.layer)
                .or_default()
                .push(started.elapsed());
        }
    }

    /// Count a reschedule; returns `true` if the subtask goes back to
    /// Pending, `false` if the budget is spent and it failed terminally.
    fn begin_reschedule(
        &self,
        subtask_id: &str,
        info: &mut SubtaskInfo,
        failed_band: &Band,
        cause: SchedulingError,
    ) -> bool {
        info.num_reschedules += 1;
        info.exclude_bands.insert(failed_band.clone());
        if info.num_reschedules > self.config.subtask_max_reschedules {
            let err = SchedulingError::RescheduleExhausted {
                subtask_id: subtask_id.to_string(),
                budget: self.config.subtask_max_reschedules,
                cause: Box::new(cause),
            };
            self.finish(subtask_id, info, SubtaskState::Failed, Some(err));
            return false;
        }
        self.metrics
            .subtasks_rescheduled
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(
            subtask_id,
            band = %failed_band,
            attempt = info.num_reschedules,
            cause = %cause,
            "rescheduling subtask"
        );
        info.state = SubtaskState::Pending;
        info.band = None;
        true
    }

    /// Re-assign a Pending subtask (with its exclusions) and enqueue it.
    async fn requeue(self: &Arc<Self>, subtask_id: &str) {
        let picked = {
            let map = self.subtasks.lock();
            map.get(subtask_id).and_then(|info| {
                (info.state == SubtaskState::Pending)
                    .then(|| (info.subtask.clone(), info.exclude_bands.clone()))
            })
        };
        let Some((subtask, exclude)) = picked else {
            return;
        };

        match self
            .assigner
            .assign_subtasks(std::slice::from_ref(&*subtask), &exclude, true)
            .await
        {
            Ok(mut bands) => {
                if let Some(band) = bands.pop() {
                    self.enqueue(subtask_id, band).await;
                    self.queues.kick();
                }
            }
            Err(err) => self.fail_subtask(subtask_id, err),
        }
    }

    fn fail_subtask(&self, subtask_id: &str, err: SchedulingError) {
        let mut map = self.subtasks.lock();
        if let Some(info) = map.get_mut(subtask_id) {
            if !info.state.is_terminal() {
                self.finish(subtask_id, info, SubtaskState::Failed, Some(err));
            }
        }
    }

    /// Transition to a terminal state and publish the report.
    fn finish(
        &self,
        subtask_id: &str,
        info: &mut SubtaskInfo,
        state: SubtaskState,
        error: Option<SchedulingError>,
    ) {
        use std::sync::atomic::Ordering::Relaxed;

        info.state = state;
        match state {
            SubtaskState::Succeeded => {
                self.metrics.subtasks_succeeded.fetch_add(1, Relaxed);
                info!(subtask_id, band = ?info.band.as_ref().map(|b| b.to_string()), "subtask succeeded");
            }
            SubtaskState::Failed => {
                self.metrics.subtasks_failed.fetch_add(1, Relaxed);
                warn!(subtask_id, error = ?error.as_ref().map(|e| e.to_string()), "subtask failed");
            }
            SubtaskState::Cancelled => {
                self.metrics.subtasks_cancelled.fetch_add(1, Relaxed);
                info!(subtask_id, "subtask cancelled");
            }
            _ => {}
        }
        let report = SubtaskReport {
            subtask_id: subtask_id.to_string(),
            state,
            band: info.band.clone(),
            error,
        };
        let _ = info.done.send(Some(report));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
