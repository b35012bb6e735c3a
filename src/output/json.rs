//! JSON output formatting
//!
//! Serializes a [`RunSummary`] into a single document:
//! - Run information (version, host, timestamps, page size, CPU counts)
//! - Per-stressor totals and bogo-op rates
//! - Per-stressor thermal zone means (sensors without data are omitted)

use crate::coordinator::{RunSummary, StressorOutcome};
use crate::stats::aggregator::ThermalReport;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Run information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRunInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub duration: String,
    pub pagesize: u64,
    pub cpus: usize,
    pub cpus_online: usize,
}

/// Mean temperature of one zone while a stressor ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonThermalZone {
    pub label: String,
    pub mean_celsius: f64,
}

/// Per-stressor results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonStressor {
    pub name: String,
    pub instances: u32,
    pub started: u32,
    pub bogo_ops: u64,
    pub bogo_ops_per_sec: f64,
    pub exit_failures: u32,
    pub killed: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thermal_zones: Vec<JsonThermalZone>,
}

/// Complete JSON output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    pub run_info: JsonRunInfo,
    pub stressors: Vec<JsonStressor>,
    pub aborted: bool,
    pub failures: u64,
}

/// Format duration in human-readable format
fn format_duration_human(d: Duration) -> String {
    let millis = d.as_millis() as u64;

    if millis < 1000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.3}s", millis as f64 / 1000.0)
    } else if millis < 3_600_000 {
        format!("{:.2}m", millis as f64 / 60_000.0)
    } else {
        format!("{:.2}h", millis as f64 / 3_600_000.0)
    }
}

fn pagesize() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

fn local_hostname() -> Option<String> {
    hostname::get().ok().map(|h| h.to_string_lossy().into_owned())
}

/// Build JsonRunInfo
pub fn build_run_info(summary: &RunSummary) -> JsonRunInfo {
    JsonRunInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: local_hostname(),
        start_time: summary.start_time.to_rfc3339(),
        end_time: summary.end_time.to_rfc3339(),
        duration_secs: summary.elapsed.as_secs_f64(),
        duration: format_duration_human(summary.elapsed),
        pagesize: pagesize(),
        cpus: num_cpus::get_physical(),
        cpus_online: num_cpus::get(),
    }
}

fn build_stressor(outcome: &StressorOutcome, elapsed: Duration, thermal: Option<&ThermalReport>) -> JsonStressor {
    let secs = elapsed.as_secs_f64();
    let bogo_ops_per_sec = if secs > 0.0 {
        outcome.bogo_ops as f64 / secs
    } else {
        0.0
    };

    let thermal_zones = thermal
        .and_then(|report| report.for_stressor(outcome.name()))
        .map(|entry| {
            entry
                .sensors
                .iter()
                .map(|s| JsonThermalZone {
                    label: s.label.clone(),
                    mean_celsius: s.mean_celsius,
                })
                .collect()
        })
        .unwrap_or_default();

    JsonStressor {
        name: outcome.name().to_string(),
        instances: outcome.instances,
        started: outcome.started,
        bogo_ops: outcome.bogo_ops,
        bogo_ops_per_sec,
        exit_failures: outcome.failed,
        killed: outcome.killed,
        thermal_zones,
    }
}

/// Convert a run summary to its JSON form
pub fn build_report(summary: &RunSummary) -> JsonReport {
    JsonReport {
        run_info: build_run_info(summary),
        stressors: summary
            .stressors
            .iter()
            .map(|s| build_stressor(s, summary.elapsed, summary.thermal.as_ref()))
            .collect(),
        aborted: summary.aborted,
        failures: summary.failures,
    }
}

/// Write the report to a file
pub fn write_json_output(output_path: &Path, report: &JsonReport, pretty: bool) -> Result<()> {
    let file = File::create(output_path)?;

    if pretty {
        serde_json::to_writer_pretty(file, report)?;
    } else {
        serde_json::to_writer(file, report)?;
    }

    Ok(())
}
