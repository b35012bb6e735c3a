//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use crate::config::cli_convert::{
    convert_lock_mode, convert_matrix_method, convert_run_mode, parse_count, parse_duration,
    parse_time_ms,
};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Load the configuration file named on the command line, if any, and apply CLI overrides
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::with_stressors(Vec::new()),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    // Stressor instance counts and caps
    let requested = [
        (StressorKind::AioLinux, cli.aio_linux, &cli.aio_linux_ops),
        (StressorKind::Clone, cli.clone, &cli.clone_ops),
        (StressorKind::Lockf, cli.lockf, &cli.lockf_ops),
        (StressorKind::Matrix, cli.matrix, &cli.matrix_ops),
        (StressorKind::Mlock, cli.mlock, &cli.mlock_ops),
        (StressorKind::Sigpending, cli.sigpending, &cli.sigpending_ops),
        (StressorKind::Sigsuspend, cli.sigsuspend, &cli.sigsuspend_ops),
        (StressorKind::Sysfs, cli.sysfs, &cli.sysfs_ops),
    ];
    for (kind, instances, ops) in requested {
        if let Some(instances) = instances {
            stressor_entry(&mut config, kind).instances = instances;
        }
        if let Some(ops_str) = ops {
            let ops = parse_count(ops_str)?;
            match config.stressors.iter_mut().find(|s| s.kind == kind) {
                Some(stressor) => stressor.ops = ops,
                None => anyhow::bail!("--{}-ops given but {} is not configured", kind, kind),
            }
        }
    }

    // Stressor options
    if let Some(requests) = cli.aio_linux_requests {
        config.aio_linux.requests = Some(requests);
    }
    if let Some(max) = cli.clone_max {
        config.clone.max = Some(max);
    }
    if cli.lockf_nonblock {
        config.lockf.mode = convert_lock_mode(true);
    }
    if let Some(method) = cli.matrix_method {
        config.matrix.method = convert_matrix_method(method);
    }
    if let Some(size) = cli.matrix_size {
        config.matrix.size = Some(size);
    }
    if let Some(ref root) = cli.sysfs_root {
        config.sysfs.root = root.clone();
    }

    // Run settings
    if let Some(timeout_str) = &cli.timeout {
        config.run.timeout_secs = parse_duration(timeout_str)?;
    }
    if cli.maximize || cli.minimize {
        config.run.mode = convert_run_mode(cli.maximize, cli.minimize);
    }
    if let Some(failures) = cli.abort_failures {
        config.run.abort_failures = failures;
    }
    if let Some(ref path) = cli.temp_path {
        config.run.temp_path = path.clone();
    }
    if let Some(seed) = cli.seed {
        config.run.seed = Some(seed);
    }

    // Thermal sampling
    if cli.thermal_zones {
        config.thermal.enabled = true;
    }
    if let Some(ref root) = cli.thermal_root {
        config.thermal.sysfs_root = root.clone();
    }
    if let Some(ref interval_str) = cli.sample_interval {
        config.thermal.interval_ms = parse_time_ms(interval_str)?;
    }

    // Output settings
    if let Some(ref path) = cli.json {
        config.output.json_output = Some(path.clone());
    }
    if cli.verbose > 0 {
        config.output.verbosity = cli.verbose;
    }
    if cli.quiet {
        config.output.quiet = true;
    }

    Ok(config)
}

/// Entry for `kind`, appended with default settings if not configured yet
fn stressor_entry(config: &mut Config, kind: StressorKind) -> &mut StressorConfig {
    let index = match config.stressors.iter().position(|s| s.kind == kind) {
        Some(index) => index,
        None => {
            config.stressors.push(StressorConfig::new(kind, 1));
            config.stressors.len() - 1
        }
    };
    &mut config.stressors[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_toml_basic() {
        let toml = r#"
[[stressors]]
kind = "clone"
instances = 2
ops = 5000

[[stressors]]
kind = "lockf"

[run]
timeout_secs = 30
mode = "minimize"

[clone]
max = 128

[lockf]
mode = "nonblocking"

[thermal]
enabled = true
interval_ms = 250
"#;

        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.stressors.len(), 2);
        assert_eq!(config.stressors[0].kind, StressorKind::Clone);
        assert_eq!(config.stressors[0].instances, 2);
        assert_eq!(config.stressors[0].ops, 5000);
        assert_eq!(config.stressors[1].instances, 1);
        assert_eq!(config.stressors[1].ops, 0);
        assert_eq!(config.run.timeout_secs, 30);
        assert_eq!(config.run.mode, RunMode::Minimize);
        assert_eq!(config.run.abort_failures, 5);
        assert_eq!(config.clone.max, Some(128));
        assert_eq!(config.lockf.mode, LockMode::NonBlocking);
        assert!(config.thermal.enabled);
        assert_eq!(config.thermal.interval_ms, 250);
        assert_eq!(config.thermal.sysfs_root, PathBuf::from("/sys/class/thermal"));
    }

    #[test]
    fn test_parse_toml_rejects_unknown_stressor() {
        let toml = r#"
[[stressors]]
kind = "fork"
"#;
        assert!(parse_toml_string(toml).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
[[stressors]]
kind = "matrix"
instances = 4

[run]
timeout_secs = 600
"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "stresspulse",
            "--config",
            path.to_str().unwrap(),
            "--matrix-ops",
            "10k",
            "--clone",
            "1",
            "-t",
            "1m",
            "--maximize",
        ]);
        let config = load_config(&cli).unwrap();

        assert_eq!(config.stressors.len(), 2);
        assert_eq!(config.stressors[0].kind, StressorKind::Matrix);
        assert_eq!(config.stressors[0].instances, 4);
        assert_eq!(config.stressors[0].ops, 10_000);
        assert_eq!(config.stressors[1].kind, StressorKind::Clone);
        assert_eq!(config.run.timeout_secs, 60);
        assert_eq!(config.run.mode, RunMode::Maximize);
    }

    #[test]
    fn test_cli_only() {
        let cli = Cli::parse_from(["stresspulse", "--lockf", "2", "--lockf-nonblock", "--tz", "--sample-interval", "500ms"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.stressors.len(), 1);
        assert_eq!(config.stressors[0].kind, StressorKind::Lockf);
        assert_eq!(config.lockf.mode, LockMode::NonBlocking);
        assert!(config.thermal.enabled);
        assert_eq!(config.thermal.interval_ms, 500);
    }

    #[test]
    fn test_new_stressor_sections() {
        let toml = r#"
[[stressors]]
kind = "aio-linux"
ops = 100

[[stressors]]
kind = "sigsuspend"
instances = 2

[[stressors]]
kind = "sysfs"

[aio_linux]
requests = 256

[sysfs]
root = "/tmp"
"#;
        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.stressors[0].kind, StressorKind::AioLinux);
        assert_eq!(config.stressors[0].ops, 100);
        assert_eq!(config.stressors[1].kind, StressorKind::Sigsuspend);
        assert_eq!(config.aio_linux.requests, Some(256));
        assert_eq!(config.sysfs.root, PathBuf::from("/tmp"));

        let defaults = parse_toml_string("[[stressors]]\nkind = \"mlock\"\n").unwrap();
        assert_eq!(defaults.aio_linux.requests, None);
        assert_eq!(defaults.sysfs.root, PathBuf::from("/sys"));

        let cli = Cli::parse_from(["stresspulse", "--aio-linux", "1", "--aio-linux-requests", "8", "--sysfs", "2", "--sysfs-root", "/proc"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.stressors.len(), 2);
        assert_eq!(config.aio_linux.requests, Some(8));
        assert_eq!(config.sysfs.root, PathBuf::from("/proc"));
    }

    #[test]
    fn test_ops_for_unconfigured_stressor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, "[[stressors]]\nkind = \"matrix\"\n").unwrap();

        let cli = Cli::parse_from(["stresspulse", "--config", path.to_str().unwrap(), "--lockf-ops", "10"]);
        assert!(load_config(&cli).is_err());
    }
}
