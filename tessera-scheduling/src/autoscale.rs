//! Autoscaling signals.
//!
//! The scheduling core does not scale the cluster itself; it derives two
//! signals from queue state that an external autoscaler consumes:
//!
//! * `scheduler_backlog` – some band has had a non-empty queue for longer
//!   than `scheduler_backlog_timeout`; more workers would help.
//! * `idle_bands` – bands with nothing queued and nothing running for longer
//!   than `worker_idle_timeout`; candidates for scale-down.
//!
//! The submit loop feeds occupancy observations in on every tick.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::band::Band;
use crate::config::AutoscaleConfig;

#[derive(Debug, Clone, Copy, Default)]
struct BandActivity {
    queued: usize,
    running: usize,
    backlogged_since: Option<Instant>,
    idle_since: Option<Instant>,
}

/// Signals as of one [`AutoscaleTracker::signals`] call.
#[derive(Debug, Clone, Default)]
pub struct AutoscaleSignals {
    pub scheduler_backlog: bool,
    /// Sorted for stable consumption.
    pub idle_bands: Vec<Band>,
}

/// Derives scale-up / scale-down signals from per-band occupancy.
pub struct AutoscaleTracker {
    config: AutoscaleConfig,
    state: Mutex<HashMap<Band, BandActivity>>,
}

impl AutoscaleTracker {
    pub fn new(config: AutoscaleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AutoscaleConfig {
        &self.config
    }

    /// Record the current occupancy of `band`.
    pub fn observe(&self, band: &Band, queued: usize, running: usize) {
        self.observe_at(band, queued, running, Instant::now());
    }

    fn observe_at(&self, band: &Band, queued: usize, running: usize, now: Instant) {
        let mut state = self.state.lock();
        let activity = state.entry(band.clone()).or_default();
        activity.queued = queued;
        activity.running = running;

        if queued > 0 {
            activity.backlogged_since.get_or_insert(now);
        } else {
            activity.backlogged_since = None;
        }

        if queued == 0 && running == 0 {
            activity.idle_since.get_or_insert(now);
        } else {
            activity.idle_since = None;
        }
    }

    /// Drop state for a band that left the cluster.
    pub fn forget_band(&self, band: &Band) {
        self.state.lock().remove(band);
    }

    /// Current signals.
    pub fn signals(&self) -> AutoscaleSignals {
        self.signals_at(Instant::now())
    }

    fn signals_at(&self, now: Instant) -> AutoscaleSignals {
        let state = self.state.lock();

        let scheduler_backlog = state.values().any(|a| {
            a.backlogged_since
                .is_some_and(|since| now.duration_since(since) >= self.config.scheduler_backlog_timeout)
        });

        let mut idle_bands: Vec<Band> = state
            .iter()
            .filter(|(_, a)| {
                a.idle_since
                    .is_some_and(|since| now.duration_since(since) >= self.config.worker_idle_timeout)
            })
            .map(|(band, _)| band.clone())
            .collect();
        idle_bands.sort();

        AutoscaleSignals {
            scheduler_backlog,
            idle_bands,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn band(n: &str) -> Band {
        Band::new("w:1234", n)
    }

    fn tracker() -> AutoscaleTracker {
        AutoscaleTracker::new(AutoscaleConfig {
            scheduler_backlog_timeout: Duration::from_secs(20),
            worker_idle_timeout: Duration::from_secs(40),
            min_workers: 1,
            max_workers: 100,
        })
    }

    #[test]
    fn backlog_needs_a_sustained_queue() {
        let t = tracker();
        let t0 = Instant::now();
        t.observe_at(&band("numa-0"), 3, 1, t0);

        // not yet sustained
        let s = t.signals_at(t0 + Duration::from_secs(5));
        assert!(!s.scheduler_backlog);

        let s = t.signals_at(t0 + Duration::from_secs(25));
        assert!(s.scheduler_backlog);
    }

    #[test]
    fn draining_the_queue_resets_the_backlog_clock() {
        let t = tracker();
        let t0 = Instant::now();
        t.observe_at(&band("numa-0"), 3, 1, t0);
        t.observe_at(&band("numa-0"), 0, 4, t0 + Duration::from_secs(10));
        t.observe_at(&band("numa-0"), 2, 2, t0 + Duration::from_secs(15));

        // queue re-appeared at t0+15; t0+30 is only 15s of backlog
        let s = t.signals_at(t0 + Duration::from_secs(30));
        assert!(!s.scheduler_backlog);
        let s = t.signals_at(t0 + Duration::from_secs(36));
        assert!(s.scheduler_backlog);
    }

    #[test]
    fn idle_band_is_reported_after_the_timeout() {
        let t = tracker();
        let t0 = Instant::now();
        t.observe_at(&band("numa-0"), 0, 0, t0);
        t.observe_at(&band("numa-1"), 0, 2, t0);

        let s = t.signals_at(t0 + Duration::from_secs(39));
        assert!(s.idle_bands.is_empty());

        let s = t.signals_at(t0 + Duration::from_secs(41));
        assert_eq!(s.idle_bands, vec![band("numa-0")]);
    }

    #[test]
    fn activity_resets_the_idle_clock() {
        let t = tracker();
        let t0 = Instant::now();
        t.observe_at(&band("numa-0"), 0, 0, t0);
        t.observe_at(&band("numa-0"), 1, 0, t0 + Duration::from_secs(30));
        t.observe_at(&band("numa-0"), 0, 0, t0 + Duration::from_secs(35));

        let s = t.signals_at(t0 + Duration::from_secs(60));
        assert!(s.idle_bands.is_empty());
        let s = t.signals_at(t0 + Duration::from_secs(80));
        assert_eq!(s.idle_bands, vec![band("numa-0")]);
    }

    #[test]
    fn forgotten_band_emits_no_signals() {
        let t = tracker();
        let t0 = Instant::now();
        t.observe_at(&band("numa-0"), 5, 0, t0);
        t.forget_band(&band("numa-0"));

        let s = t.signals_at(t0 + Duration::from_secs(60));
        assert!(!s.scheduler_backlog);
        assert!(s.idle_bands.is_empty());
    }
}
