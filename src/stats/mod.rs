//! Cross-process metrics collection
//!
//! Workers write sensor readings into a [`SampleArray`] that lives in shared
//! memory, one row per (stressor kind, worker instance). Each worker only ever
//! writes its own row, so writes never race with each other; the parent reads
//! the array once every worker has been reaped and reduces it with
//! [`aggregator::ThermalAggregator`].
//!
//! # Layout
//!
//! ```text
//! [kind 0: [instance 0: sensor 0..S] [instance 1: ...] ... ]
//! [kind 1: ...]
//! ```

pub mod aggregator;
pub mod sensors;

use crate::control::SharedSlice;
use crate::Result;
use sensors::{SensorDescriptor, SensorSource, MAX_SENSORS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared `kinds × max_instances × max_sensors` array of readings
pub struct SampleArray {
    readings: SharedSlice<AtomicU64>,
    kinds: usize,
    max_instances: usize,
    max_sensors: usize,
}

impl SampleArray {
    /// Map a zeroed array; must happen before workers fork
    pub fn new(kinds: usize, max_instances: usize, max_sensors: usize) -> Result<Self> {
        let max_sensors = max_sensors.min(MAX_SENSORS);
        let len = kinds * max_instances * max_sensors;
        Ok(Self {
            readings: SharedSlice::new(len)?,
            kinds,
            max_instances,
            max_sensors,
        })
    }

    #[inline]
    fn row_start(&self, kind: usize, instance: usize) -> usize {
        assert!(
            kind < self.kinds && instance < self.max_instances,
            "sample row ({}, {}) out of range",
            kind,
            instance
        );
        (kind * self.max_instances + instance) * self.max_sensors
    }

    /// Reading slot for one (kind, instance, sensor)
    ///
    /// # Panics
    /// Panics if any coordinate is out of range
    pub fn slot(&self, kind: usize, instance: usize, sensor: usize) -> &AtomicU64 {
        assert!(sensor < self.max_sensors, "sensor {} out of range", sensor);
        &self.readings[self.row_start(kind, instance) + sensor]
    }

    /// The row a single worker writes
    pub fn worker_slots(&self, kind: usize, instance: usize) -> &[AtomicU64] {
        let start = self.row_start(kind, instance);
        &self.readings[start..start + self.max_sensors]
    }

    /// Current reading (read side, after join)
    pub fn reading(&self, kind: usize, instance: usize, sensor: usize) -> u64 {
        self.slot(kind, instance, sensor).load(Ordering::Acquire)
    }

    pub fn kinds(&self) -> usize {
        self.kinds
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn max_sensors(&self) -> usize {
        self.max_sensors
    }
}

/// Per-worker sensor poller
///
/// Polled by the worker loop once per iteration; reads the source at most once
/// per interval and stores each reading in the worker's row. A sensor that
/// cannot be read stores 0.
pub struct SensorSampler<'a> {
    source: &'a dyn SensorSource,
    sensors: &'a [SensorDescriptor],
    slots: &'a [AtomicU64],
    interval: Duration,
    last: Option<Instant>,
    samples_taken: u64,
}

impl<'a> SensorSampler<'a> {
    pub fn new(
        source: &'a dyn SensorSource,
        sensors: &'a [SensorDescriptor],
        slots: &'a [AtomicU64],
        interval: Duration,
    ) -> Self {
        Self {
            source,
            sensors,
            slots,
            interval,
            last: None,
            samples_taken: 0,
        }
    }

    /// Sample if the interval has elapsed since the previous sample
    #[inline]
    pub fn maybe_sample(&mut self) {
        let due = match self.last {
            Some(last) => last.elapsed() >= self.interval,
            None => true,
        };
        if due {
            self.sample_now();
        }
    }

    /// Sample every sensor immediately
    pub fn sample_now(&mut self) {
        for sensor in self.sensors {
            if let Some(slot) = self.slots.get(sensor.id) {
                let reading = self.source.read(sensor).unwrap_or(0);
                slot.store(reading, Ordering::Release);
            }
        }
        self.last = Some(Instant::now());
        self.samples_taken += 1;
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken
    }
}
