//! Configuration validation

use super::*;
use crate::stats::sensors::MAX_SENSORS;
use crate::stressor::aio_linux::{MAX_AIO_REQUESTS, MIN_AIO_REQUESTS};
use crate::stressor::clone::{MAX_CLONES, MIN_CLONES};
use crate::stressor::matrix::{MAX_MATRIX_SIZE, MIN_MATRIX_SIZE};
use anyhow::{Context, Result};

/// Most workers a single stressor may start
pub const MAX_INSTANCES: u32 = 4096;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_stressors(&config.stressors)?;
    validate_run(&config.run)?;
    validate_clone(&config.clone)?;
    validate_matrix(&config.matrix)?;
    validate_aio_linux(&config.aio_linux)?;
    validate_sysfs(config)?;
    validate_thermal(&config.thermal)?;

    Ok(())
}

/// Validate the stressor list
pub fn validate_stressors(stressors: &[StressorConfig]) -> Result<()> {
    if stressors.is_empty() {
        anyhow::bail!("no stressors configured");
    }

    for (i, stressor) in stressors.iter().enumerate() {
        if stressors[..i].iter().any(|s| s.kind == stressor.kind) {
            anyhow::bail!("stressor {} is configured more than once", stressor.kind);
        }

        let instances = stressor.effective_instances();
        if instances > MAX_INSTANCES {
            anyhow::bail!(
                "{} instances must be between 0 and {}, got {}",
                stressor.kind,
                MAX_INSTANCES,
                instances
            );
        }
    }

    Ok(())
}

/// Validate run settings
pub fn validate_run(run: &RunConfig) -> Result<()> {
    let metadata = std::fs::metadata(&run.temp_path)
        .with_context(|| format!("temp_path {} is not accessible", run.temp_path.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("temp_path {} is not a directory", run.temp_path.display());
    }

    Ok(())
}

/// Validate clone options
fn validate_clone(clone: &CloneConfig) -> Result<()> {
    if let Some(max) = clone.max {
        if !(MIN_CLONES..=MAX_CLONES).contains(&max) {
            anyhow::bail!(
                "clone max must be between {} and {}, got {}",
                MIN_CLONES,
                MAX_CLONES,
                max
            );
        }
    }

    Ok(())
}

/// Validate matrix options
fn validate_matrix(matrix: &MatrixConfig) -> Result<()> {
    if let Some(size) = matrix.size {
        if !(MIN_MATRIX_SIZE..=MAX_MATRIX_SIZE).contains(&size) {
            anyhow::bail!(
                "matrix size must be between {} and {}, got {}",
                MIN_MATRIX_SIZE,
                MAX_MATRIX_SIZE,
                size
            );
        }
    }

    Ok(())
}

/// Validate aio-linux options
fn validate_aio_linux(aio_linux: &AioLinuxConfig) -> Result<()> {
    if let Some(requests) = aio_linux.requests {
        if !(MIN_AIO_REQUESTS..=MAX_AIO_REQUESTS).contains(&requests) {
            anyhow::bail!(
                "aio-linux requests must be between {} and {}, got {}",
                MIN_AIO_REQUESTS,
                MAX_AIO_REQUESTS,
                requests
            );
        }
    }

    Ok(())
}

/// Validate the sysfs root when a sysfs stressor will walk it
fn validate_sysfs(config: &Config) -> Result<()> {
    if !config.stressors.iter().any(|s| s.kind == StressorKind::Sysfs) {
        return Ok(());
    }
    if !config.sysfs.root.is_dir() {
        anyhow::bail!("sysfs root {} is not a directory", config.sysfs.root.display());
    }

    Ok(())
}

/// Validate thermal sampling
fn validate_thermal(thermal: &ThermalConfig) -> Result<()> {
    if !thermal.enabled {
        return Ok(());
    }

    if thermal.interval_ms == 0 {
        anyhow::bail!("thermal sample interval must be at least 1ms");
    }

    if !thermal.sysfs_root.exists() {
        tracing::warn!(
            "thermal sysfs root {} does not exist; no zones will be sampled (up to {} supported)",
            thermal.sysfs_root.display(),
            MAX_SENSORS
        );
    }

    Ok(())
}
