//! Human-readable text output

use crate::coordinator::RunSummary;
use crate::stats::aggregator::ThermalReport;
use std::fmt::Write;

const RULE: &str = "═══════════════════════════════════════════════════════════";

/// Print run results to the console
///
/// Displays per-stressor bogo ops and rates, failed workers, the circuit
/// breaker state and, when sampling was enabled, thermal zone means.
pub fn print_results(summary: &RunSummary) {
    print!("{}", format_results(summary));
}

/// Render run results as text
pub fn format_results(summary: &RunSummary) -> String {
    let mut out = String::new();
    let secs = summary.elapsed.as_secs_f64();

    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "                    RUN RESULTS");
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out);
    let _ = writeln!(out, "Elapsed Time: {:.3}s", secs);
    let _ = writeln!(out);

    let _ = writeln!(
        out,
        "{:<10} {:>9} {:>15} {:>12} {:>8}",
        "stressor", "instances", "bogo ops", "ops/s", "failed"
    );
    for s in &summary.stressors {
        let rate = if secs > 0.0 { s.bogo_ops as f64 / secs } else { 0.0 };
        let _ = writeln!(
            out,
            "{:<10} {:>9} {:>15} {:>12} {:>8}",
            s.name(),
            format!("{}/{}", s.started, s.instances),
            format_number(s.bogo_ops),
            format_rate(rate),
            s.failed + s.killed
        );
    }
    let _ = writeln!(out);

    if summary.aborted {
        let _ = writeln!(out, "Aborted after {} failures", summary.failures);
        let _ = writeln!(out);
    }

    if let Some(thermal) = &summary.thermal {
        out.push_str(&format_thermal(thermal));
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "{}", RULE);
    out
}

/// Per-stressor thermal zone means
pub fn format_thermal(report: &ThermalReport) -> String {
    let mut out = String::new();

    if report.is_empty() {
        let _ = writeln!(out, "thermal zone temperatures not available");
        return out;
    }

    for stressor in &report.stressors {
        let _ = writeln!(out, "{}:", stressor.stressor);
        for sensor in &stressor.sensors {
            let _ = writeln!(out, "{:>20} {:7.2} °C", sensor.label, sensor.mean_celsius);
        }
    }
    out
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}

/// Format a rate (operations per second)
fn format_rate(rate: f64) -> String {
    if rate < 1_000.0 {
        format!("{:.2}", rate)
    } else if rate < 1_000_000.0 {
        format!("{:.2}K", rate / 1_000.0)
    } else if rate < 1_000_000_000.0 {
        format!("{:.2}M", rate / 1_000_000.0)
    } else {
        format!("{:.2}G", rate / 1_000_000_000.0)
    }
}
