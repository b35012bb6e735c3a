//! CLI to Config conversion utilities

use crate::config::cli;
use crate::config::workload;
use anyhow::{Context, Result};

/// Parse an operation count (e.g., "5000", "10k", "2m") using decimal multipliers
pub fn parse_count(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with('k') {
        (s.trim_end_matches('k'), 1_000u64)
    } else if s.ends_with('m') {
        (s.trim_end_matches('m'), 1_000_000)
    } else if s.ends_with('g') || s.ends_with('b') {
        (s.trim_end_matches('g').trim_end_matches('b'), 1_000_000_000)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str.parse()
        .with_context(|| format!("Invalid count format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Count out of range: {}", s))
}

/// Parse a duration string (e.g., "60s", "5m", "1h") to seconds
pub fn parse_duration(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("s") || s.ends_with("sec") {
        (s.trim_end_matches("sec").trim_end_matches("s"), 1u64)
    } else if s.ends_with("m") || s.ends_with("min") {
        (s.trim_end_matches("min").trim_end_matches("m"), 60)
    } else if s.ends_with("h") || s.ends_with("hr") {
        (s.trim_end_matches("hr").trim_end_matches("h"), 3600)
    } else if s.ends_with("d") {
        (s.trim_end_matches("d"), 86400)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str.parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Duration out of range: {}", s))
}

/// Parse a time string (e.g., "250ms", "1s") to milliseconds
pub fn parse_time_ms(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("ms") {
        (s.trim_end_matches("ms"), 1u64)
    } else if s.ends_with("s") {
        (s.trim_end_matches("s"), 1000)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str.parse()
        .with_context(|| format!("Invalid time format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Time out of range: {}", s))
}

/// Convert CLI MatrixMethod to workload MatrixMethod
pub fn convert_matrix_method(cli_method: cli::MatrixMethod) -> workload::MatrixMethod {
    match cli_method {
        cli::MatrixMethod::All => workload::MatrixMethod::All,
        cli::MatrixMethod::Add => workload::MatrixMethod::Add,
        cli::MatrixMethod::Div => workload::MatrixMethod::Div,
        cli::MatrixMethod::Frobenius => workload::MatrixMethod::Frobenius,
        cli::MatrixMethod::Hadamard => workload::MatrixMethod::Hadamard,
        cli::MatrixMethod::Mult => workload::MatrixMethod::Mult,
        cli::MatrixMethod::Prod => workload::MatrixMethod::Prod,
        cli::MatrixMethod::Sub => workload::MatrixMethod::Sub,
        cli::MatrixMethod::Trans => workload::MatrixMethod::Trans,
    }
}

/// Run mode selected by the --maximize / --minimize flags
pub fn convert_run_mode(maximize: bool, minimize: bool) -> workload::RunMode {
    match (maximize, minimize) {
        (true, _) => workload::RunMode::Maximize,
        (false, true) => workload::RunMode::Minimize,
        (false, false) => workload::RunMode::Normal,
    }
}

/// Lock mode selected by --lockf-nonblock
pub fn convert_lock_mode(nonblock: bool) -> workload::LockMode {
    if nonblock {
        workload::LockMode::NonBlocking
    } else {
        workload::LockMode::Blocking
    }
}
