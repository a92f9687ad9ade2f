//! Simulation configuration shared by the harness and its binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SimulationError, SimulationResult};

/// Default counter scraped from every node's monitoring gateway
pub const DEFAULT_METRIC_NAME: &str = "papyrus_consensus_height";

/// Default log filter exported to each node process
pub const DEFAULT_NODE_LOG_FILTER: &str = "papyrus_consensus=debug,papyrus=info";

/// Smallest cluster that still has a bootstrap and a proposer
pub const MIN_VALIDATORS: usize = 2;

/// Configuration for one simulation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Node binary launched once per validator
    pub node_binary: PathBuf,

    /// Base layer endpoint handed to every node
    pub base_layer_node_url: String,

    /// Total number of validators in the cluster
    pub num_validators: usize,

    /// Existing storage root holding `data0..data{N-1}`
    pub data_root: Option<PathBuf>,

    /// Directory receiving `validator{id}.txt` logs
    pub log_root: Option<PathBuf>,

    /// Seconds without height change before a node counts as stagnated
    pub stagnation_timeout_secs: u64,

    /// Total run duration in seconds, unbounded when absent
    pub duration_secs: Option<u64>,

    /// Polling cadence of the liveness monitor (milliseconds)
    pub monitoring_period_ms: u64,

    /// Progress counter name on the monitoring endpoint
    pub metric_name: String,

    /// `RUST_LOG` value for node processes
    pub node_log_filter: String,

    /// Per-request timeout when scraping metrics (milliseconds)
    pub scrape_timeout_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("target/release/papyrus_node"),
            base_layer_node_url: String::new(),
            num_validators: 4,
            data_root: None,
            log_root: None,
            stagnation_timeout_secs: 60,
            duration_secs: None,
            monitoring_period_ms: 10_000,
            metric_name: DEFAULT_METRIC_NAME.to_string(),
            node_log_filter: DEFAULT_NODE_LOG_FILTER.to_string(),
            scrape_timeout_ms: 2_000,
        }
    }
}

impl SimulationConfig {
    /// Create a configuration targeting the given base layer endpoint
    pub fn new(base_layer_node_url: impl Into<String>) -> Self {
        Self {
            base_layer_node_url: base_layer_node_url.into(),
            ..Default::default()
        }
    }

    pub fn with_validators(mut self, count: usize) -> Self {
        self.num_validators = count;
        self
    }

    pub fn with_node_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.node_binary = binary.into();
        self
    }

    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = Some(root.into());
        self
    }

    pub fn with_log_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.log_root = Some(root.into());
        self
    }

    pub fn with_stagnation_timeout(mut self, timeout: Duration) -> Self {
        self.stagnation_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration_secs = duration.map(|d| d.as_secs());
        self
    }

    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_metric_name(mut self, name: impl Into<String>) -> Self {
        self.metric_name = name.into();
        self
    }

    pub fn stagnation_timeout(&self) -> Duration {
        Duration::from_secs(self.stagnation_timeout_secs)
    }

    pub fn duration_limit(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }

    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_millis(self.scrape_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> SimulationResult<()> {
        if self.num_validators < MIN_VALIDATORS {
            return Err(SimulationError::InvalidConfig(format!(
                "at least {} validators are required, got {}",
                MIN_VALIDATORS, self.num_validators
            )));
        }

        if self.base_layer_node_url.trim().is_empty() {
            return Err(SimulationError::InvalidConfig(
                "base layer node url must not be empty".to_string(),
            ));
        }

        if self.stagnation_timeout_secs == 0 {
            return Err(SimulationError::InvalidConfig(
                "stagnation timeout must be positive".to_string(),
            ));
        }

        if self.duration_secs == Some(0) {
            return Err(SimulationError::InvalidConfig(
                "duration must be positive when set".to_string(),
            ));
        }

        if self.monitoring_period_ms == 0 {
            return Err(SimulationError::InvalidConfig(
                "monitoring period must be positive".to_string(),
            ));
        }

        if self.scrape_timeout_ms == 0 {
            return Err(SimulationError::InvalidConfig(
                "scrape timeout must be positive".to_string(),
            ));
        }

        if self.metric_name.trim().is_empty() {
            return Err(SimulationError::InvalidConfig(
                "metric name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Check that a reused storage root holds exactly `data0..data{N-1}`.
///
/// Regular files are ignored so the lock marker left by earlier runs does
/// not invalidate the directory.
pub fn validate_existing_data_root(root: &Path, num_validators: usize) -> SimulationResult<()> {
    if !root.is_dir() {
        return Err(SimulationError::InvalidConfig(format!(
            "data root {:?} is not a directory",
            root
        )));
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            found.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    found.sort();

    let mut expected: Vec<String> = (0..num_validators).map(|i| format!("data{}", i)).collect();
    expected.sort();

    if found != expected {
        return Err(SimulationError::InvalidConfig(format!(
            "data root {:?} must contain exactly {:?}, found {:?}",
            root, expected, found
        )));
    }

    Ok(())
}
