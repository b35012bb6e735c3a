//! Thermal sample aggregation
//!
//! Reduces the shared [`SampleArray`] into one mean reading per (stressor,
//! sensor) once all workers have been reaped. Readings above
//! [`SENSOR_CEILING`] are sensor glitches and count as 0; a sensor whose
//! contributions sum to 0 is left out of the report entirely (no data, not a
//! reading of zero).
//!
//! # Example
//!
//! ```
//! use stresspulse::stats::SampleArray;
//! use stresspulse::stats::aggregator::ThermalAggregator;
//! use stresspulse::stats::sensors::SensorDescriptor;
//! use std::sync::atomic::Ordering;
//!
//! let sensors = vec![SensorDescriptor { id: 0, label: "acpitz".into(), key: "thermal_zone0".into() }];
//! let samples = SampleArray::new(1, 2, 1).unwrap();
//! samples.slot(0, 0, 0).store(40000, Ordering::Relaxed);
//! samples.slot(0, 1, 0).store(50000, Ordering::Relaxed);
//!
//! let mut aggregator = ThermalAggregator::new();
//! aggregator.add_stressor(0, "clone", &[0, 1]);
//! let report = aggregator.aggregate(&samples, &sensors);
//! assert_eq!(report.stressors[0].sensors[0].mean_celsius, 45.0);
//! ```

use super::sensors::SensorDescriptor;
use super::SampleArray;
use serde::Serialize;

/// Readings above this (250 °C in millidegrees) are discarded as glitches
pub const SENSOR_CEILING: u64 = 250_000;

/// Mean reading of one sensor while one stressor ran
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorMean {
    pub label: String,
    /// Mean in thousandths of a degree
    pub mean_millidegrees: f64,
    /// Mean in degrees Celsius
    pub mean_celsius: f64,
    /// Number of worker samples that went into the mean
    pub samples: u32,
}

/// Sensors with data for one stressor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StressorThermal {
    pub stressor: String,
    pub sensors: Vec<SensorMean>,
}

/// Thermal section of the run report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThermalReport {
    /// Only stressors with at least one reporting sensor
    pub stressors: Vec<StressorThermal>,
}

impl ThermalReport {
    pub fn is_empty(&self) -> bool {
        self.stressors.is_empty()
    }

    /// Sensors reported for a stressor, if any
    pub fn for_stressor(&self, name: &str) -> Option<&StressorThermal> {
        self.stressors.iter().find(|s| s.stressor == name)
    }
}

#[derive(Debug, Clone)]
struct StressorEntry {
    kind: usize,
    name: String,
    /// Instance numbers that were actually forked
    started: Vec<u32>,
}

/// Collects which stressors ran and reduces their samples
///
/// # Usage
///
/// 1. Create with `new()`
/// 2. Register each stressor kind with `add_stressor()` after its workers joined
/// 3. Reduce with `aggregate()`
#[derive(Debug, Default)]
pub struct ThermalAggregator {
    stressors: Vec<StressorEntry>,
}

impl ThermalAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stressor kind and the instance numbers that were started
    ///
    /// Instances that failed to fork leave gaps; their rows are never read.
    pub fn add_stressor(&mut self, kind: usize, name: &str, started: &[u32]) {
        self.stressors.push(StressorEntry {
            kind,
            name: name.to_string(),
            started: started.to_vec(),
        });
    }

    pub fn num_stressors(&self) -> usize {
        self.stressors.len()
    }

    /// Reduce the sample array into per-stressor sensor means
    ///
    /// Must only run after every worker writing `samples` has exited.
    pub fn aggregate(&self, samples: &SampleArray, sensors: &[SensorDescriptor]) -> ThermalReport {
        let mut report = ThermalReport::default();

        for entry in &self.stressors {
            let mut means = Vec::new();

            for sensor in sensors.iter().filter(|s| s.id < samples.max_sensors()) {
                let mut total = 0u64;
                let mut count = 0u32;

                for instance in entry
                    .started
                    .iter()
                    .map(|&i| i as usize)
                    .filter(|&i| i < samples.max_instances())
                {
                    let reading = samples.reading(entry.kind, instance, sensor.id);
                    total += clamp_reading(reading);
                    count += 1;
                }

                if total == 0 {
                    continue;
                }

                let mean = total as f64 / count as f64;
                means.push(SensorMean {
                    label: sensor.label.clone(),
                    mean_millidegrees: mean,
                    mean_celsius: mean / 1000.0,
                    samples: count,
                });
            }

            if !means.is_empty() {
                report.stressors.push(StressorThermal {
                    stressor: entry.name.clone(),
                    sensors: means,
                });
            }
        }

        report
    }
}

/// Glitch filter: anything above the ceiling counts as no reading
#[inline]
pub fn clamp_reading(reading: u64) -> u64 {
    if reading > SENSOR_CEILING {
        0
    } else {
        reading
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn sensor(id: usize, label: &str) -> SensorDescriptor {
        SensorDescriptor {
            id,
            label: label.to_string(),
            key: format!("thermal_zone{}", id),
        }
    }

    #[test]
    fn test_clamp_reading() {
        assert_eq!(clamp_reading(300_000), 0);
        assert_eq!(clamp_reading(250_000), 250_000);
        assert_eq!(clamp_reading(42_000), 42_000);
    }

    #[test]
    fn test_mean_per_stressor_and_sensor() {
        let sensors = vec![sensor(0, "acpitz"), sensor(1, "x86_pkg_temp")];
        let samples = SampleArray::new(2, 3, 2).unwrap();

        for (instance, temp) in [40_000u64, 42_000, 44_000].iter().enumerate() {
            samples.slot(0, instance, 0).store(*temp, Ordering::Relaxed);
            samples.slot(0, instance, 1).store(*temp + 10_000, Ordering::Relaxed);
        }
        samples.slot(1, 0, 0).store(60_000, Ordering::Relaxed);

        let mut aggregator = ThermalAggregator::new();
        aggregator.add_stressor(0, "clone", &[0, 1, 2]);
        aggregator.add_stressor(1, "lockf", &[0]);
        let report = aggregator.aggregate(&samples, &sensors);

        let clone = report.for_stressor("clone").unwrap();
        assert_eq!(clone.sensors.len(), 2);
        assert_eq!(clone.sensors[0].mean_celsius, 42.0);
        assert_eq!(clone.sensors[1].mean_celsius, 52.0);
        assert_eq!(clone.sensors[0].samples, 3);

        // lockf only ever saw sensor 0
        let lockf = report.for_stressor("lockf").unwrap();
        assert_eq!(lockf.sensors.len(), 1);
        assert_eq!(lockf.sensors[0].label, "acpitz");
        assert_eq!(lockf.sensors[0].mean_celsius, 60.0);
    }

    #[test]
    fn test_glitch_reading_is_clamped() {
        let sensors = vec![sensor(0, "acpitz"), sensor(1, "broken")];
        let samples = SampleArray::new(1, 2, 2).unwrap();
        samples.slot(0, 0, 0).store(300_000, Ordering::Relaxed);
        samples.slot(0, 1, 0).store(50_000, Ordering::Relaxed);
        samples.slot(0, 0, 1).store(300_000, Ordering::Relaxed);
        samples.slot(0, 1, 1).store(0, Ordering::Relaxed);

        let mut aggregator = ThermalAggregator::new();
        aggregator.add_stressor(0, "matrix", &[0, 1]);
        let report = aggregator.aggregate(&samples, &sensors);

        let matrix = report.for_stressor("matrix").unwrap();
        // The glitch contributes 0 but still counts as a sample
        assert_eq!(matrix.sensors.len(), 1);
        assert_eq!(matrix.sensors[0].mean_celsius, 25.0);
        // All-zero sensor is absent rather than reported as 0
        assert!(matrix.sensors.iter().all(|s| s.label != "broken"));
    }

    #[test]
    fn test_stressor_without_data_is_omitted() {
        let sensors = vec![sensor(0, "acpitz")];
        let samples = SampleArray::new(1, 4, 1).unwrap();

        let mut aggregator = ThermalAggregator::new();
        aggregator.add_stressor(0, "clone", &[0, 1, 2, 3]);
        let report = aggregator.aggregate(&samples, &sensors);
        assert!(report.is_empty());
    }

    #[test]
    fn test_only_started_instances_count() {
        let sensors = vec![sensor(0, "acpitz")];
        let samples = SampleArray::new(1, 4, 1).unwrap();
        samples.slot(0, 0, 0).store(30_000, Ordering::Relaxed);
        // Stale slot of an instance that never started
        samples.slot(0, 3, 0).store(90_000, Ordering::Relaxed);

        let mut aggregator = ThermalAggregator::new();
        aggregator.add_stressor(0, "clone", &[0]);
        let report = aggregator.aggregate(&samples, &sensors);
        assert_eq!(report.stressors[0].sensors[0].mean_celsius, 30.0);
    }

    #[test]
    fn test_gap_in_started_instances() {
        let sensors = vec![sensor(0, "acpitz")];
        let samples = SampleArray::new(1, 3, 1).unwrap();
        samples.slot(0, 0, 0).store(40_000, Ordering::Relaxed);
        samples.slot(0, 2, 0).store(50_000, Ordering::Relaxed);

        // Instance 1 never forked; its row must not dilute the mean
        let mut aggregator = ThermalAggregator::new();
        aggregator.add_stressor(0, "clone", &[0, 2]);
        let report = aggregator.aggregate(&samples, &sensors);

        let clone = report.for_stressor("clone").unwrap();
        assert_eq!(clone.sensors[0].samples, 2);
        assert_eq!(clone.sensors[0].mean_celsius, 45.0);
    }
}
