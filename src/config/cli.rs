//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// StressPulse - process, lock and CPU stress harness
#[derive(Parser, Debug)]
#[command(name = "stresspulse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file (command line options override it)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Stressors ===
    /// Start N aio-linux workers (0 = one per online CPU)
    #[arg(long, visible_alias = "aiol", value_name = "N")]
    pub aio_linux: Option<u32>,

    /// Stop each aio-linux worker after N bogo operations
    #[arg(long, visible_alias = "aiol-ops", value_name = "N")]
    pub aio_linux_ops: Option<String>,

    /// Writes submitted per aio-linux batch (1-4096)
    #[arg(long, visible_alias = "aiol-requests", value_name = "N")]
    pub aio_linux_requests: Option<u64>,

    /// Start N clone workers (0 = one per online CPU)
    #[arg(long, value_name = "N")]
    pub clone: Option<u32>,

    /// Stop each clone worker after N bogo operations (e.g., 10000, 1m)
    #[arg(long, value_name = "N")]
    pub clone_ops: Option<String>,

    /// Maximum concurrent clones per worker (1-1000000)
    #[arg(long, value_name = "N")]
    pub clone_max: Option<u64>,

    /// Start N lockf workers (0 = one per online CPU)
    #[arg(long, value_name = "N")]
    pub lockf: Option<u32>,

    /// Stop each lockf worker after N bogo operations
    #[arg(long, value_name = "N")]
    pub lockf_ops: Option<String>,

    /// Use non-blocking lock attempts (F_TLOCK) instead of blocking ones
    #[arg(long)]
    pub lockf_nonblock: bool,

    /// Start N matrix workers (0 = one per online CPU)
    #[arg(long, value_name = "N")]
    pub matrix: Option<u32>,

    /// Stop each matrix worker after N bogo operations
    #[arg(long, value_name = "N")]
    pub matrix_ops: Option<String>,

    /// Matrix kernel
    #[arg(long, value_enum)]
    pub matrix_method: Option<MatrixMethod>,

    /// Matrix dimension n (16-4096)
    #[arg(long, value_name = "N")]
    pub matrix_size: Option<usize>,

    /// Start N mlock workers (0 = one per online CPU)
    #[arg(long, value_name = "N")]
    pub mlock: Option<u32>,

    /// Stop each mlock worker after N bogo operations
    #[arg(long, value_name = "N")]
    pub mlock_ops: Option<String>,

    /// Start N sigpending workers (0 = one per online CPU)
    #[arg(long, value_name = "N")]
    pub sigpending: Option<u32>,

    /// Stop each sigpending worker after N bogo operations
    #[arg(long, value_name = "N")]
    pub sigpending_ops: Option<String>,

    /// Start N sigsuspend workers (0 = one per online CPU)
    #[arg(long, value_name = "N")]
    pub sigsuspend: Option<u32>,

    /// Stop each sigsuspend worker after N bogo operations
    #[arg(long, value_name = "N")]
    pub sigsuspend_ops: Option<String>,

    /// Start N sysfs workers (0 = one per online CPU)
    #[arg(long, value_name = "N")]
    pub sysfs: Option<u32>,

    /// Stop each sysfs worker after N bogo operations
    #[arg(long, value_name = "N")]
    pub sysfs_ops: Option<String>,

    /// Tree the sysfs workers walk
    #[arg(long)]
    pub sysfs_root: Option<PathBuf>,

    // === Run control ===
    /// Time budget (e.g., 60s, 5m, 1h; 0 = until workers finish)
    #[arg(short = 't', long)]
    pub timeout: Option<String>,

    /// Pin unset tunables to their maximum
    #[arg(long, conflicts_with = "minimize")]
    pub maximize: bool,

    /// Pin unset tunables to their minimum
    #[arg(long)]
    pub minimize: bool,

    /// Abort the run after N worker failures (0 = never)
    #[arg(long, value_name = "N")]
    pub abort_failures: Option<u64>,

    /// Directory for scratch files
    #[arg(long)]
    pub temp_path: Option<PathBuf>,

    /// Seed for worker random number generators
    #[arg(long)]
    pub seed: Option<u64>,

    // === Thermal ===
    /// Sample thermal zone temperatures and report per-stressor means
    #[arg(long = "tz")]
    pub thermal_zones: bool,

    /// Thermal sysfs root
    #[arg(long)]
    pub thermal_root: Option<PathBuf>,

    /// Minimum time between thermal samples (e.g., 500ms, 1s)
    #[arg(long)]
    pub sample_interval: Option<String>,

    // === Output ===
    /// Write a JSON report to this file
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// More log output (repeat for more)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short = 'q', long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Matrix kernel
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MatrixMethod {
    /// Cycle through every kernel
    All,
    /// Element-wise addition
    Add,
    /// Element-wise division by a scalar
    Div,
    /// Frobenius product
    Frobenius,
    /// Hadamard (element-wise) product
    Hadamard,
    /// Element-wise multiplication by a scalar
    Mult,
    /// Matrix product (row × column)
    Prod,
    /// Element-wise subtraction
    Sub,
    /// Transpose
    Trans,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Instance count and `--<name>-ops` value given for each stressor
    fn stressor_flags(&self) -> [(&'static str, Option<u32>, &Option<String>); 8] {
        [
            ("aio-linux", self.aio_linux, &self.aio_linux_ops),
            ("clone", self.clone, &self.clone_ops),
            ("lockf", self.lockf, &self.lockf_ops),
            ("matrix", self.matrix, &self.matrix_ops),
            ("mlock", self.mlock, &self.mlock_ops),
            ("sigpending", self.sigpending, &self.sigpending_ops),
            ("sigsuspend", self.sigsuspend, &self.sigsuspend_ops),
            ("sysfs", self.sysfs, &self.sysfs_ops),
        ]
    }

    /// True if any stressor was requested on the command line
    pub fn has_stressors(&self) -> bool {
        self.stressor_flags().iter().any(|(_, instances, _)| instances.is_some())
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.config.is_none() && !self.has_stressors() {
            anyhow::bail!(
                "must specify at least one stressor (--aio-linux, --clone, --lockf, --matrix, \
                 --mlock, --sigpending, --sigsuspend, --sysfs) or --config"
            );
        }

        for (name, instances, ops) in self.stressor_flags() {
            if ops.is_some() && instances.is_none() && self.config.is_none() {
                anyhow::bail!("--{}-ops requires --{}", name, name);
            }
        }

        Ok(())
    }
}
