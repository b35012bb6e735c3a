//! Hardware sensor enumeration
//!
//! Sensors are discovered once at start and stay fixed for the run. The only
//! real source is the Linux thermal class in sysfs; anything implementing
//! [`SensorSource`] can stand in for it.

use crate::Result;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

/// Most sensors tracked per worker
pub const MAX_SENSORS: usize = 31;

/// Default sysfs location of thermal zones
pub const THERMAL_SYSFS_ROOT: &str = "/sys/class/thermal";

/// A sensor discovered at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDescriptor {
    /// Slot index in the sample array (0..MAX_SENSORS)
    pub id: usize,
    /// Human label (thermal zone type, e.g. `x86_pkg_temp`)
    pub label: String,
    /// Source-specific key (thermal zone directory name)
    pub key: String,
}

/// Read-only source of sensor readings
pub trait SensorSource: Send {
    /// List available sensors; called once per run
    fn enumerate(&self) -> Result<Vec<SensorDescriptor>>;

    /// Current reading in thousandths of a unit, or `None` if unreadable
    fn read(&self, sensor: &SensorDescriptor) -> Option<u64>;
}

/// Thermal zones under `/sys/class/thermal`
#[derive(Debug, Clone)]
pub struct ThermalZones {
    root: PathBuf,
}

impl ThermalZones {
    pub fn new() -> Self {
        Self::with_root(THERMAL_SYSFS_ROOT)
    }

    /// Read zones from a different root (tests, chroots)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for ThermalZones {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for ThermalZones {
    fn enumerate(&self) -> Result<Vec<SensorDescriptor>> {
        // No thermal class at all is not an error, just no sensors
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut zones: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("thermal_zone"))
            .collect();
        zones.sort();

        let mut sensors = Vec::with_capacity(zones.len().min(MAX_SENSORS));
        for key in zones.into_iter().take(MAX_SENSORS) {
            let type_path = self.root.join(&key).join("type");
            let label = fs::read_to_string(&type_path)
                .with_context(|| format!("Failed to read thermal zone type: {}", type_path.display()))?;
            let label = label.lines().next().unwrap_or("").trim().to_string();

            sensors.push(SensorDescriptor {
                id: sensors.len(),
                label,
                key,
            });
        }

        Ok(sensors)
    }

    fn read(&self, sensor: &SensorDescriptor) -> Option<u64> {
        let temp = fs::read_to_string(self.root.join(&sensor.key).join("temp")).ok()?;
        temp.trim().parse().ok()
    }
}
