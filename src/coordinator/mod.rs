//! Coordinator module
//!
//! Orchestrates a run: maps the shared state, forks one process per stressor
//! instance, enforces the time budget, tears the workers down and reduces what
//! they left in shared memory into a [`RunSummary`].
//!
//! # Shared state
//!
//! Everything a worker reports travels through mappings created before the
//! first fork:
//!
//! - one [`ControlBlock`] (stop flag, circuit breaker)
//! - one bogo-op counter per worker
//! - the thermal [`SampleArray`], one row per worker
//!
//! # Teardown
//!
//! The run ends when every worker has exited, the time budget expires, the
//! circuit breaker trips or SIGINT arrives. The coordinator then sets the stop
//! flag, gives workers the grace period to drain their pools and exit, and
//! SIGKILLs whatever is left. Every worker is reaped before totals are read.

pub mod signal;

use crate::config::Config;
use crate::control::{ControlBlock, RunController, SharedMem, SharedSlice};
use crate::error::FailureKind;
use crate::stats::aggregator::{ThermalAggregator, ThermalReport};
use crate::stats::sensors::{SensorDescriptor, SensorSource, ThermalZones};
use crate::stats::{SampleArray, SensorSampler};
use crate::stressor::{worker_seed, StressArgs, Stressor, StressorKind};
use crate::worker::process::{WorkerExit, EXIT_FAILURE, EXIT_SUCCESS};
use crate::worker::WorkerProcess;
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use signal::InterruptGuard;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How often the coordinator checks on its workers
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-stressor result of a run
#[derive(Debug, Clone, PartialEq)]
pub struct StressorOutcome {
    pub kind: StressorKind,
    /// Instances requested
    pub instances: u32,
    /// Instances actually forked
    pub started: u32,
    /// Bogo operations summed over every instance
    pub bogo_ops: u64,
    /// Instances that exited with a failure status
    pub failed: u32,
    /// Instances that had to be killed or died on a signal
    pub killed: u32,
}

impl StressorOutcome {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Everything a run produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub stressors: Vec<StressorOutcome>,
    /// `None` when thermal sampling was not requested
    pub thermal: Option<ThermalReport>,
    /// True if the circuit breaker ended the run
    pub aborted: bool,
    /// Failures counted by the circuit breaker
    pub failures: u64,
}

impl RunSummary {
    pub fn total_bogo_ops(&self) -> u64 {
        self.stressors.iter().map(|s| s.bogo_ops).sum()
    }

    pub fn total_failed(&self) -> u32 {
        self.stressors.iter().map(|s| s.failed + s.killed).sum()
    }

    /// True if no worker failed and the run was not aborted
    pub fn success(&self) -> bool {
        !self.aborted && self.total_failed() == 0
    }
}

/// A forked worker and where its results live
struct Worker {
    stressor: usize,
    instance: u32,
    process: WorkerProcess,
}

/// Thermal sampling inputs shared with every worker
struct SamplingPlan<'a> {
    source: &'a dyn SensorSource,
    sensors: &'a [SensorDescriptor],
    samples: &'a SampleArray,
    interval: Duration,
}

/// Runs the configured stressors to completion
pub struct Coordinator {
    config: Config,
    source: Box<dyn SensorSource>,
}

impl Coordinator {
    /// Coordinator reading thermal zones from the configured sysfs root
    pub fn new(config: Config) -> Self {
        let source = Box::new(ThermalZones::with_root(&config.thermal.sysfs_root));
        Self::with_sensor_source(config, source)
    }

    pub fn with_sensor_source(config: Config, source: Box<dyn SensorSource>) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run every stressor and collect the results
    pub fn run(&self) -> Result<RunSummary> {
        let start_time = Utc::now();
        let started_at = Instant::now();
        let config = &self.config;

        let block: SharedMem<ControlBlock> = SharedMem::new().context("Failed to map control block")?;
        let controller = RunController::new(&block, config.run.abort_failures);
        let _interrupt = InterruptGuard::install(&block);

        let total_instances = config.total_instances();
        let counters: SharedSlice<AtomicU64> =
            SharedSlice::new(total_instances.max(1)).context("Failed to map bogo-op counters")?;

        let sensors = self.enumerate_sensors();
        let max_instances = config
            .stressors
            .iter()
            .map(|s| s.effective_instances() as usize)
            .max()
            .unwrap_or(0)
            .max(1);
        let samples = SampleArray::new(config.stressors.len(), max_instances, sensors.len())
            .context("Failed to map thermal sample array")?;
        let plan = (!sensors.is_empty()).then(|| SamplingPlan {
            source: self.source.as_ref(),
            sensors: &sensors,
            samples: &samples,
            interval: config.thermal.interval(),
        });

        let base_seed = config.run.seed.unwrap_or_else(rand::random);
        tracing::info!(
            "dispatching hogs: {}",
            config
                .stressors
                .iter()
                .map(|s| format!("{} {}", s.effective_instances(), s.kind))
                .collect::<Vec<_>>()
                .join(", ")
        );

        // Fork every instance
        let mut workers = Vec::with_capacity(total_instances);
        let mut started = vec![0u32; config.stressors.len()];
        let mut counter_base = Vec::with_capacity(config.stressors.len());
        let mut next_counter = 0usize;

        for (index, stressor_config) in config.stressors.iter().enumerate() {
            let stressor = stressor_config.kind.build(config);
            let instances = stressor_config.effective_instances();
            counter_base.push(next_counter);

            for instance in 0..instances {
                if !controller.is_running() {
                    break;
                }
                let counter = &counters[next_counter + instance as usize];
                let seed = worker_seed(base_seed, index, instance);
                let spawned = WorkerProcess::spawn(Some(&controller), || {
                    run_worker(
                        stressor.as_ref(),
                        index,
                        instance,
                        counter,
                        controller,
                        stressor_config.ops,
                        seed,
                        &config.run.temp_path,
                        plan.as_ref(),
                    )
                });

                match spawned {
                    Ok(process) => {
                        tracing::debug!("{}: started instance {} (pid {})", stressor.kind(), instance, process.pid());
                        started[index] += 1;
                        workers.push(Worker {
                            stressor: index,
                            instance,
                            process,
                        });
                    }
                    Err(e) => {
                        tracing::error!("{}: failed to start instance {}: {:#}", stressor.kind(), instance, e);
                        controller.record_failure(FailureKind::Setup);
                    }
                }
            }
            next_counter += instances as usize;
        }

        self.wait_for_workers(&controller, &mut workers, started_at)?;

        // Every worker has been reaped; shared memory is now stable
        let mut stressors: Vec<StressorOutcome> = config
            .stressors
            .iter()
            .enumerate()
            .map(|(index, s)| StressorOutcome {
                kind: s.kind,
                instances: s.effective_instances(),
                started: started[index],
                bogo_ops: 0,
                failed: 0,
                killed: 0,
            })
            .collect();

        for worker in &workers {
            let outcome = &mut stressors[worker.stressor];
            outcome.bogo_ops +=
                counters[counter_base[worker.stressor] + worker.instance as usize].load(Ordering::Acquire);
            match worker.process.exit_status() {
                Some(WorkerExit::Success) => {}
                Some(WorkerExit::Failed(_)) => outcome.failed += 1,
                Some(WorkerExit::Signaled(_)) | None => outcome.killed += 1,
            }
        }

        let thermal = config.thermal.enabled.then(|| {
            let mut aggregator = ThermalAggregator::new();
            for (index, outcome) in stressors.iter().enumerate() {
                // A failed fork leaves a gap in the instance numbers
                let instances: Vec<u32> = workers
                    .iter()
                    .filter(|w| w.stressor == index)
                    .map(|w| w.instance)
                    .collect();
                aggregator.add_stressor(index, outcome.name(), &instances);
            }
            aggregator.aggregate(&samples, &sensors)
        });

        let summary = RunSummary {
            start_time,
            end_time: Utc::now(),
            elapsed: started_at.elapsed(),
            stressors,
            thermal,
            aborted: controller.aborted(),
            failures: controller.failure_count(),
        };

        if summary.success() {
            tracing::info!("successful run completed in {:.2}s", summary.elapsed.as_secs_f64());
        } else {
            tracing::warn!(
                "unsuccessful run completed in {:.2}s ({} worker(s) failed)",
                summary.elapsed.as_secs_f64(),
                summary.total_failed()
            );
        }

        Ok(summary)
    }

    fn enumerate_sensors(&self) -> Vec<SensorDescriptor> {
        if !self.config.thermal.enabled {
            return Vec::new();
        }
        match self.source.enumerate() {
            Ok(sensors) => {
                tracing::debug!("sampling {} thermal zone(s)", sensors.len());
                sensors
            }
            Err(e) => {
                tracing::warn!("thermal zones unavailable: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Wait out the run, then stop, grace, kill and reap every worker
    fn wait_for_workers(
        &self,
        controller: &RunController<'_>,
        workers: &mut [Worker],
        started_at: Instant,
    ) -> Result<()> {
        let deadline = self.config.run.timeout().map(|t| started_at + t);

        loop {
            let mut running = 0;
            for worker in workers.iter_mut() {
                if worker.process.try_wait()?.is_none() {
                    running += 1;
                }
            }
            if running == 0 {
                break;
            }
            if !controller.is_running() {
                tracing::debug!("stop requested with {} worker(s) running", running);
                break;
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                tracing::debug!("time budget expired with {} worker(s) running", running);
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        controller.request_stop();

        let grace_deadline = Instant::now() + self.config.run.grace();
        for worker in workers.iter_mut() {
            if worker.process.wait_until(grace_deadline)?.is_some() {
                continue;
            }
            tracing::warn!(
                "{} instance {} (pid {}) did not stop, killing it",
                self.config.stressors[worker.stressor].kind,
                worker.instance,
                worker.process.pid()
            );
            worker.process.kill()?;
            worker.process.wait()?;
        }

        Ok(())
    }
}

/// Body of a worker process
#[allow(clippy::too_many_arguments)]
fn run_worker(
    stressor: &dyn Stressor,
    kind_index: usize,
    instance: u32,
    counter: &AtomicU64,
    controller: RunController<'_>,
    max_ops: u64,
    seed: u64,
    temp_path: &Path,
    plan: Option<&SamplingPlan<'_>>,
) -> i32 {
    let sampler = plan.map(|plan| {
        SensorSampler::new(
            plan.source,
            plan.sensors,
            plan.samples.worker_slots(kind_index, instance as usize),
            plan.interval,
        )
    });

    let mut args = StressArgs {
        counter,
        instance,
        max_ops,
        name: stressor.kind().name(),
        controller,
        sampler,
        seed,
        temp_path,
    };

    tracing::debug!("{}: [{}] started instance {}", args.name, std::process::id(), instance);
    match stressor.run(&mut args) {
        Ok(()) => EXIT_SUCCESS,
        Err(_) => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StressorConfig;
    use crate::stats::tests::FakeSensors;

    fn config(stressors: Vec<StressorConfig>) -> Config {
        let mut config = Config::with_stressors(stressors);
        config.run.timeout_secs = 30;
        config.run.grace_secs = 2;
        config.run.seed = Some(1);
        config.matrix.size = Some(16);
        config
    }

    fn with_ops(kind: StressorKind, instances: u32, ops: u64) -> StressorConfig {
        StressorConfig {
            kind,
            instances,
            ops,
        }
    }

    #[test]
    fn test_ops_capped_run() {
        let _serial = signal::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let config = config(vec![with_ops(StressorKind::Matrix, 2, 20)]);
        let summary = Coordinator::new(config).run().unwrap();

        assert!(summary.success());
        assert!(summary.thermal.is_none());
        let matrix = &summary.stressors[0];
        assert_eq!(matrix.started, 2);
        assert_eq!(matrix.bogo_ops, 40);
        assert_eq!(matrix.failed, 0);
        assert_eq!(summary.total_bogo_ops(), 40);
    }

    #[test]
    fn test_time_budget_stops_unbounded_run() {
        let _serial = signal::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut config = config(vec![with_ops(StressorKind::Matrix, 1, 0)]);
        config.run.timeout_secs = 1;
        let summary = Coordinator::new(config).run().unwrap();

        assert!(summary.success());
        assert!(summary.elapsed >= Duration::from_secs(1));
        assert!(summary.stressors[0].bogo_ops > 0);
    }

    #[test]
    fn test_thermal_report_from_worker_samples() {
        let _serial = signal::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut config = config(vec![with_ops(StressorKind::Matrix, 2, 10)]);
        config.thermal.enabled = true;
        let source = FakeSensors::new(&[("cpu", Some(45_000)), ("glitch", Some(300_000)), ("dead", None)]);

        let summary = Coordinator::with_sensor_source(config, Box::new(source)).run().unwrap();

        let report = summary.thermal.unwrap();
        let matrix = report.for_stressor("matrix").unwrap();
        assert_eq!(matrix.sensors.len(), 1);
        assert_eq!(matrix.sensors[0].label, "cpu");
        assert_eq!(matrix.sensors[0].mean_celsius, 45.0);
    }

    #[test]
    fn test_setup_failures_trip_circuit_breaker() {
        let _serial = signal::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut config = config(vec![with_ops(StressorKind::Lockf, 3, 100)]);
        config.run.temp_path = "/nonexistent/stresspulse".into();
        config.run.abort_failures = 2;

        let summary = Coordinator::new(config).run().unwrap();

        assert!(summary.aborted);
        assert!(!summary.success());
        assert!(summary.failures >= 2);
        let lockf = &summary.stressors[0];
        assert!(lockf.started >= 2);
        assert_eq!(lockf.failed, lockf.started);
        assert_eq!(lockf.bogo_ops, 0);
    }
}
