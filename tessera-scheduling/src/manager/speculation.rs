//! Straggler speculation.
//!
//! When enabled, a periodic monitor compares each running subtask's elapsed
//! time against `multiplier × median(finished peer runtimes)` for peers at
//! the same graph layer.  A straggler gets one duplicate on a different band;
//! whichever attempt finishes first wins and the loser is cancelled.
//! Duplicates never consume the reschedule budget.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::band::Band;
use crate::subtask::{Subtask, SubtaskState};

use super::SubtaskManager;

impl SubtaskManager {
    /// One monitor pass.  Safe to call at any time; does nothing unless
    /// speculation is enabled and enough peers have finished to trust the
    /// medians.
    pub async fn speculate_once(self: &Arc<Self>) {
        let spec = self.config.speculation.clone();
        if !spec.enabled {
            return;
        }

        let medians: HashMap<i64, Duration> = {
            let runtimes = self.layer_runtimes.lock();
            runtimes
                .iter()
                .filter(|(_, v)| v.len() >= spec.min_peers)
                .map(|(layer, v)| {
                    let mut sorted = v.clone();
                    sorted.sort();
                    (*layer, sorted[sorted.len() / 2])
                })
                .collect()
        };
        if medians.is_empty() {
            return;
        }

        type Candidate = (String, Arc<Subtask>, Band, HashSet<Band>);
        let candidates: Vec<Candidate> = {
            let map = self.subtasks.lock();
            map.iter()
                .filter_map(|(id, info)| {
                    if info.state != SubtaskState::Running
                        || info.cancel_requested
                        || info.speculative_band.is_some()
                    {
                        return None;
                    }
                    let band = info.band.clone()?;
                    let started = info.started_at?;
                    let median = medians.get(&info.subtask.priority.layer)?;
                    let threshold = median.mul_f64(spec.multiplier);
                    if started.elapsed() <= threshold {
                        return None;
                    }
                    let mut exclude = info.exclude_bands.clone();
                    exclude.insert(band.clone());
                    Some((id.clone(), info.subtask.clone(), band, exclude))
                })
                .collect()
        };

        for (id, subtask, primary_band, exclude) in candidates {
            // the duplicate must land somewhere else; a subtask that only
            // matches its current band simply keeps running
            let target = match self
                .assigner
                .assign_subtasks(std::slice::from_ref(&*subtask), &exclude, false)
                .await
            {
                Ok(mut bands) => match bands.pop() {
                    Some(band) => band,
                    None => continue,
                },
                Err(err) => {
                    debug!(subtask_id = %id, error = %err, "no band for speculative duplicate");
                    continue;
                }
            };
            if target == primary_band {
                continue;
            }
            if !self.resources.acquire(&target, 1) {
                continue;
            }

            let attached = {
                let mut map = self.subtasks.lock();
                match map.get_mut(&id) {
                    Some(info)
                        if info.state == SubtaskState::Running
                            && info.speculative_band.is_none()
                            && !info.cancel_requested =>
                    {
                        info.speculative_band = Some(target.clone());
                        info.speculative_slot_held = true;
                        true
                    }
                    _ => false,
                }
            };
            if !attached {
                self.resources.release(&target, 1);
                continue;
            }

            self.metrics
                .subtasks_speculated
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            info!(
                subtask_id = %id,
                straggler_band = %primary_band,
                band = %target,
                "issuing speculative duplicate"
            );

            let mgr = self.clone();
            let dispatch_timeout = self.config.submit_period * 2;
            tokio::spawn(async move {
                let ack = tokio::time::timeout(
                    dispatch_timeout,
                    mgr.worker.run_subtask(subtask, target.clone()),
                )
                .await;
                if !matches!(ack, Ok(Ok(()))) {
                    mgr.on_band_lost_attempt(&id, &target).await;
                }
            });
        }
    }
}

/// Drives [`SubtaskManager::speculate_once`] on the configured interval.
pub struct SpeculationMonitor {
    manager: Arc<SubtaskManager>,
}

impl SpeculationMonitor {
    pub fn new(manager: Arc<SubtaskManager>) -> Self {
        Self { manager }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.manager.config.speculation.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.manager.speculate_once().await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
