use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Failure-count thresholds used by escalation.
///
/// A suspect worker is recycled every `reset_threshold` failures and failed
/// permanently once it reaches `reset_threshold * reset_failure_multiplier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub reset_threshold: u32,
    pub reset_failure_multiplier: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            reset_threshold: 3,
            reset_failure_multiplier: 5,
        }
    }
}

impl Thresholds {
    pub fn fail_threshold(&self) -> u32 {
        self.reset_threshold
            .saturating_mul(self.reset_failure_multiplier)
    }
}

/// Runtime configuration for the manager and its scanners.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Pause between the end of one scan cycle and the start of the next.
    pub scan_interval: Duration,
    /// How long a worker may keep running a job after being asked to abort.
    /// Must exceed the worker's own abort timeout.
    pub cancel_timeout: Duration,
    pub fleet_discovery_interval: Duration,
    /// Per-call timeout for worker RPCs.
    pub rpc_timeout: Duration,
    /// Cap for the consumer pump. `None` sizes it to the fleet.
    pub max_concurrent_jobs: Option<usize>,
    pub thresholds: Thresholds,
    /// Start each scanner after a random delay within one scan interval.
    pub stagger_scans: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(15),
            cancel_timeout: Duration::from_secs(180),
            fleet_discovery_interval: Duration::from_secs(300),
            rpc_timeout: Duration::from_secs(30),
            max_concurrent_jobs: None,
            thresholds: Thresholds::default(),
            stagger_scans: true,
        }
    }
}

impl ManagerConfig {
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    pub fn with_fleet_discovery_interval(mut self, interval: Duration) -> Self {
        self.fleet_discovery_interval = interval;
        self
    }

    pub fn with_thresholds(mut self, reset_threshold: u32, reset_failure_multiplier: u32) -> Self {
        self.thresholds = Thresholds {
            reset_threshold,
            reset_failure_multiplier,
        };
        self
    }

    pub fn without_stagger(mut self) -> Self {
        self.stagger_scans = false;
        self
    }

    /// Worker slots for the consumer pump given the current fleet size.
    pub fn pump_capacity(&self, fleet_size: usize) -> usize {
        self.max_concurrent_jobs.unwrap_or(fleet_size).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("scan_interval", self.scan_interval),
            ("cancel_timeout", self.cancel_timeout),
            ("fleet_discovery_interval", self.fleet_discovery_interval),
            ("rpc_timeout", self.rpc_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        if self.cancel_timeout < self.scan_interval {
            return Err(ConfigError::Invalid(
                "cancel_timeout must be at least one scan_interval".into(),
            ));
        }
        if self.thresholds.reset_threshold == 0 || self.thresholds.reset_failure_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "reset_threshold and reset_failure_multiplier must be non-zero".into(),
            ));
        }
        if self.max_concurrent_jobs == Some(0) {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs must be non-zero when set".into(),
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(contents)?;
        let config = Self::from(file);
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }
}

/// On-disk form of [`ManagerConfig`]. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub scan_interval_seconds: u64,
    pub cancel_timeout_seconds: u64,
    pub fleet_discovery_interval_seconds: u64,
    pub rpc_timeout_seconds: u64,
    pub max_concurrent_jobs: Option<usize>,
    pub reset_threshold: u32,
    pub reset_failure_multiplier: u32,
    pub stagger_scans: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

impl From<FileConfig> for ManagerConfig {
    fn from(file: FileConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(file.scan_interval_seconds),
            cancel_timeout: Duration::from_secs(file.cancel_timeout_seconds),
            fleet_discovery_interval: Duration::from_secs(file.fleet_discovery_interval_seconds),
            rpc_timeout: Duration::from_secs(file.rpc_timeout_seconds),
            max_concurrent_jobs: file.max_concurrent_jobs,
            thresholds: Thresholds {
                reset_threshold: file.reset_threshold,
                reset_failure_multiplier: file.reset_failure_multiplier,
            },
            stagger_scans: file.stagger_scans,
        }
    }
}

impl From<&ManagerConfig> for FileConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            scan_interval_seconds: config.scan_interval.as_secs(),
            cancel_timeout_seconds: config.cancel_timeout.as_secs(),
            fleet_discovery_interval_seconds: config.fleet_discovery_interval.as_secs(),
            rpc_timeout_seconds: config.rpc_timeout.as_secs(),
            max_concurrent_jobs: config.max_concurrent_jobs,
            reset_threshold: config.thresholds.reset_threshold,
            reset_failure_multiplier: config.thresholds.reset_failure_multiplier,
            stagger_scans: config.stagger_scans,
        }
    }
}
