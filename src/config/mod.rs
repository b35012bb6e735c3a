//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;
pub mod workload;

use crate::stats::sensors::THERMAL_SYSFS_ROOT;
use crate::stressor::sysfs::SYSFS_ROOT;
use crate::stressor::StressorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use workload::*;

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stressors to run, each with its own instance count
    pub stressors: Vec<StressorConfig>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub clone: CloneConfig,
    #[serde(default)]
    pub lockf: LockfConfig,
    #[serde(default)]
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub aio_linux: AioLinuxConfig,
    #[serde(default)]
    pub sysfs: SysfsConfig,
    #[serde(default)]
    pub thermal: ThermalConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// One stressor entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressorConfig {
    pub kind: StressorKind,
    /// Worker processes to start (0 = one per online CPU)
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Bogo operation cap per worker (0 = unbounded)
    #[serde(default)]
    pub ops: u64,
}

fn default_instances() -> u32 {
    1
}

impl StressorConfig {
    pub fn new(kind: StressorKind, instances: u32) -> Self {
        Self {
            kind,
            instances,
            ops: 0,
        }
    }

    /// Instance count with 0 resolved to the number of online CPUs
    pub fn effective_instances(&self) -> u32 {
        if self.instances == 0 {
            num_cpus::get() as u32
        } else {
            self.instances
        }
    }
}

/// Run-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Time budget in seconds (0 = until every worker stops on its own)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Seconds stragglers get after the stop request before SIGKILL
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Failures across all workers that abort the run (0 = never abort)
    #[serde(default = "default_abort_failures")]
    pub abort_failures: u64,
    #[serde(default)]
    pub mode: RunMode,
    /// Directory scratch files are created under
    #[serde(default = "default_temp_path")]
    pub temp_path: PathBuf,
    /// Base seed for per-worker RNGs (random if unset)
    pub seed: Option<u64>,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_grace_secs() -> u64 {
    5
}

fn default_abort_failures() -> u64 {
    crate::control::ABORT_FAILURES
}

fn default_temp_path() -> PathBuf {
    PathBuf::from(".")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            grace_secs: default_grace_secs(),
            abort_failures: default_abort_failures(),
            mode: RunMode::default(),
            temp_path: default_temp_path(),
            seed: None,
        }
    }
}

impl RunConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Clone stressor options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Maximum concurrent clones per worker
    pub max: Option<u64>,
}

/// Lockf stressor options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockfConfig {
    #[serde(default)]
    pub mode: LockMode,
}

/// Matrix stressor options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default)]
    pub method: MatrixMethod,
    /// Matrix dimension n (n × n)
    pub size: Option<usize>,
}

/// Aio-linux stressor options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AioLinuxConfig {
    /// Writes submitted per batch
    pub requests: Option<u64>,
}

/// Sysfs stressor options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysfsConfig {
    /// Tree to walk
    #[serde(default = "default_sysfs_walk_root")]
    pub root: PathBuf,
}

fn default_sysfs_walk_root() -> PathBuf {
    PathBuf::from(SYSFS_ROOT)
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            root: default_sysfs_walk_root(),
        }
    }
}

/// Thermal zone sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    /// Minimum time between samples in a worker (milliseconds)
    #[serde(default = "default_sample_interval_ms")]
    pub interval_ms: u64,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(THERMAL_SYSFS_ROOT)
}

fn default_sample_interval_ms() -> u64 {
    1000
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sysfs_root: default_sysfs_root(),
            interval_ms: default_sample_interval_ms(),
        }
    }
}

impl ThermalConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// JSON report file path
    pub json_output: Option<PathBuf>,
    /// Output verbosity level
    #[serde(default)]
    pub verbosity: u8,
    /// Only log warnings and errors
    #[serde(default)]
    pub quiet: bool,
}

impl Config {
    /// Configuration running the given stressors with defaults everywhere else
    pub fn with_stressors(stressors: Vec<StressorConfig>) -> Self {
        Self {
            stressors,
            run: RunConfig::default(),
            clone: CloneConfig::default(),
            lockf: LockfConfig::default(),
            matrix: MatrixConfig::default(),
            aio_linux: AioLinuxConfig::default(),
            sysfs: SysfsConfig::default(),
            thermal: ThermalConfig::default(),
            output: OutputConfig::default(),
        }
    }

    /// Total worker processes the run will start
    pub fn total_instances(&self) -> usize {
        self.stressors
            .iter()
            .map(|s| s.effective_instances() as usize)
            .sum()
    }
}

// Display trait implementations

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        for stressor in &self.stressors {
            writeln!(f, "  Stressor: {}", stressor)?;
        }
        writeln!(f, "  Run: {}", self.run)?;
        writeln!(f, "  Thermal: {}", self.thermal)?;
        Ok(())
    }
}

impl fmt::Display for StressorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{}", self.kind, self.effective_instances())?;
        if self.ops > 0 {
            write!(f, ", ops={}", self.ops)?;
        }
        Ok(())
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.timeout() {
            Some(t) => write!(f, "timeout={}s", t.as_secs())?,
            None => write!(f, "timeout=none")?,
        }
        write!(
            f,
            ", mode={}, abort_failures={}, temp_path={}",
            self.mode,
            self.abort_failures,
            self.temp_path.display()
        )
    }
}

impl fmt::Display for ThermalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.enabled {
            write!(f, "{} every {}ms", self.sysfs_root.display(), self.interval_ms)
        } else {
            write!(f, "disabled")
        }
    }
}
