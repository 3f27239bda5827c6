//! Scheduling configuration loading.
//!
//! The expected YAML structure is:
//! ```yaml
//! scheduling:
//!   submit_period: 1.0
//!   subtask_max_reschedules: 3
//!   subtask_cancel_timeout: 5.0
//!   speculation:
//!     enabled: false
//!     multiplier: 1.5
//!   autoscale:
//!     scheduler_backlog_timeout: 20.0
//!     worker_idle_timeout: 40.0
//!     min_workers: 1
//!     max_workers: 100
//! ```
//!
//! Every field is optional; absent values fall back to their defaults, so an
//! empty file (or no file at all) yields a fully usable configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

// ── Defaults ──────────────────────────────────────────────────────────────────

const DEFAULT_SUBMIT_PERIOD_SECS: f64 = 1.0;
const DEFAULT_SUBTASK_MAX_RESCHEDULES: u32 = 3;
const DEFAULT_SUBTASK_CANCEL_TIMEOUT_SECS: f64 = 5.0;
const DEFAULT_SPECULATION_MULTIPLIER: f64 = 1.5;
const DEFAULT_SPECULATION_INTERVAL_SECS: f64 = 5.0;
const DEFAULT_SPECULATION_MIN_PEERS: usize = 3;
const DEFAULT_BACKLOG_TIMEOUT_SECS: f64 = 20.0;
const DEFAULT_IDLE_TIMEOUT_SECS: f64 = 40.0;
const DEFAULT_MIN_WORKERS: u32 = 1;
const DEFAULT_MAX_WORKERS: u32 = 100;

// ── Private YAML deserialization types ────────────────────────────────────────

/// Top-level wrapper that maps directly onto the YAML file layout.
///
/// Kept private – callers work with [`SchedulingConfig`] instead.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    scheduling: SchedulingEntry,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulingEntry {
    submit_period: Option<f64>,
    subtask_max_reschedules: Option<u32>,
    subtask_cancel_timeout: Option<f64>,
    #[serde(default)]
    speculation: SpeculationEntry,
    #[serde(default)]
    autoscale: AutoscaleEntry,
}

#[derive(Debug, Default, Deserialize)]
struct SpeculationEntry {
    enabled: Option<bool>,
    multiplier: Option<f64>,
    interval: Option<f64>,
    min_peers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct AutoscaleEntry {
    scheduler_backlog_timeout: Option<f64>,
    worker_idle_timeout: Option<f64>,
    min_workers: Option<u32>,
    max_workers: Option<u32>,
}

// ── Public configuration types ────────────────────────────────────────────────

/// Straggler-speculation knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeculationConfig {
    pub enabled: bool,
    /// A running subtask is a straggler once its elapsed time exceeds
    /// `multiplier × median(finished peer runtimes)` at the same graph layer.
    pub multiplier: f64,
    /// Monitor scan period.
    pub interval: Duration,
    /// Minimum finished peers before the median is trusted.
    pub min_peers: usize,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            multiplier: DEFAULT_SPECULATION_MULTIPLIER,
            interval: Duration::from_secs_f64(DEFAULT_SPECULATION_INTERVAL_SECS),
            min_peers: DEFAULT_SPECULATION_MIN_PEERS,
        }
    }
}

/// Signals thresholds consumed by an external autoscaler.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoscaleConfig {
    pub scheduler_backlog_timeout: Duration,
    pub worker_idle_timeout: Duration,
    pub min_workers: u32,
    pub max_workers: u32,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            scheduler_backlog_timeout: Duration::from_secs_f64(DEFAULT_BACKLOG_TIMEOUT_SECS),
            worker_idle_timeout: Duration::from_secs_f64(DEFAULT_IDLE_TIMEOUT_SECS),
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// All knobs recognised by the per-session scheduling core.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingConfig {
    /// Queue scan tick of the submit loop.
    pub submit_period: Duration,
    /// Reschedule budget per subtask; exceeding it is terminal failure.
    pub subtask_max_reschedules: u32,
    /// How long to wait for a worker to acknowledge a cancel before the slot
    /// is force-released.
    pub subtask_cancel_timeout: Duration,
    pub speculation: SpeculationConfig,
    pub autoscale: AutoscaleConfig,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            submit_period: Duration::from_secs_f64(DEFAULT_SUBMIT_PERIOD_SECS),
            subtask_max_reschedules: DEFAULT_SUBTASK_MAX_RESCHEDULES,
            subtask_cancel_timeout: Duration::from_secs_f64(DEFAULT_SUBTASK_CANCEL_TIMEOUT_SECS),
            speculation: SpeculationConfig::default(),
            autoscale: AutoscaleConfig::default(),
        }
    }
}

impl SchedulingConfig {
    /// Parse `path` into a configuration, filling gaps with defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or the YAML is
    /// structurally invalid.  A file without a `scheduling:` section is valid
    /// and yields the defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading scheduling configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let file: ConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        Ok(Self::from_entry(file.scheduling))
    }

    fn from_entry(entry: SchedulingEntry) -> Self {
        let defaults = SchedulingConfig::default();
        SchedulingConfig {
            submit_period: entry
                .submit_period
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.submit_period),
            subtask_max_reschedules: entry
                .subtask_max_reschedules
                .unwrap_or(defaults.subtask_max_reschedules),
            subtask_cancel_timeout: entry
                .subtask_cancel_timeout
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.subtask_cancel_timeout),
            speculation: SpeculationConfig {
                enabled: entry
                    .speculation
                    .enabled
                    .unwrap_or(defaults.speculation.enabled),
                multiplier: entry
                    .speculation
                    .multiplier
                    .unwrap_or(defaults.speculation.multiplier),
                interval: entry
                    .speculation
                    .interval
                    .map(Duration::from_secs_f64)
                    .unwrap_or(defaults.speculation.interval),
                min_peers: entry
                    .speculation
                    .min_peers
                    .unwrap_or(defaults.speculation.min_peers),
            },
            autoscale: AutoscaleConfig {
                scheduler_backlog_timeout: entry
                    .autoscale
                    .scheduler_backlog_timeout
                    .map(Duration::from_secs_f64)
                    .unwrap_or(defaults.autoscale.scheduler_backlog_timeout),
                worker_idle_timeout: entry
                    .autoscale
                    .worker_idle_timeout
                    .map(Duration::from_secs_f64)
                    .unwrap_or(defaults.autoscale.worker_idle_timeout),
                min_workers: entry
                    .autoscale
                    .min_workers
                    .unwrap_or(defaults.autoscale.min_workers),
                max_workers: entry
                    .autoscale
                    .max_workers
                    .unwrap_or(defaults.autoscale.max_workers),
            },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SchedulingConfig::default();
        assert_eq!(cfg.submit_period, Duration::from_secs(1));
        assert_eq!(cfg.subtask_max_reschedules, 3);
        assert_eq!(cfg.subtask_cancel_timeout, Duration::from_secs(5));
        assert!(!cfg.speculation.enabled);
        assert_eq!(cfg.speculation.multiplier, 1.5);
        assert_eq!(
            cfg.autoscale.scheduler_backlog_timeout,
            Duration::from_secs(20)
        );
        assert_eq!(cfg.autoscale.worker_idle_timeout, Duration::from_secs(40));
        assert_eq!(cfg.autoscale.min_workers, 1);
        assert_eq!(cfg.autoscale.max_workers, 100);
    }

    #[test]
    fn load_full_yaml() {
        let yaml = r#"
scheduling:
  submit_period: 0.5
  subtask_max_reschedules: 5
  subtask_cancel_timeout: 2.5
  speculation:
    enabled: true
    multiplier: 2.0
    interval: 10.0
    min_peers: 8
  autoscale:
    scheduler_backlog_timeout: 15.0
    worker_idle_timeout: 60.0
    min_workers: 2
    max_workers: 64
"#;
        let f = yaml_tempfile(yaml);
        let cfg = SchedulingConfig::load_from_file(f.path()).unwrap();

        assert_eq!(cfg.submit_period, Duration::from_millis(500));
        assert_eq!(cfg.subtask_max_reschedules, 5);
        assert_eq!(cfg.subtask_cancel_timeout, Duration::from_millis(2500));
        assert!(cfg.speculation.enabled);
        assert_eq!(cfg.speculation.multiplier, 2.0);
        assert_eq!(cfg.speculation.interval, Duration::from_secs(10));
        assert_eq!(cfg.speculation.min_peers, 8);
        assert_eq!(
            cfg.autoscale.scheduler_backlog_timeout,
            Duration::from_secs(15)
        );
        assert_eq!(cfg.autoscale.worker_idle_timeout, Duration::from_secs(60));
        assert_eq!(cfg.autoscale.min_workers, 2);
        assert_eq!(cfg.autoscale.max_workers, 64);
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_absent_fields() {
        let yaml = r#"
scheduling:
  submit_period: 0.25
  speculation:
    enabled: true
"#;
        let f = yaml_tempfile(yaml);
        let cfg = SchedulingConfig::load_from_file(f.path()).unwrap();

        assert_eq!(cfg.submit_period, Duration::from_millis(250));
        assert!(cfg.speculation.enabled);
        // untouched knobs keep their defaults
        assert_eq!(cfg.subtask_max_reschedules, 3);
        assert_eq!(cfg.speculation.multiplier, 1.5);
        assert_eq!(cfg.autoscale.max_workers, 100);
    }

    #[test]
    fn empty_mapping_yields_defaults() {
        let f = yaml_tempfile("{}\n");
        let cfg = SchedulingConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg, SchedulingConfig::default());
    }

    #[test]
    fn missing_file_returns_error() {
        let result = SchedulingConfig::load_from_file(Path::new("/nonexistent/scheduling.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_yaml_returns_error() {
        let f = yaml_tempfile("scheduling: [not, a, mapping\n");
        assert!(SchedulingConfig::load_from_file(f.path()).is_err());
    }
}
