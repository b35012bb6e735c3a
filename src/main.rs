//! StressPulse CLI entry point

use anyhow::{Context, Result};
use stresspulse::config::{cli::Cli, toml::load_config, validator::validate_config, Config};
use stresspulse::output::{json, text};
use stresspulse::Coordinator;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.validate()?;

    let config = load_config(&cli).context("Failed to build configuration")?;
    init_logging(&config);

    validate_config(&config).context("Configuration validation failed")?;

    if !config.output.quiet {
        println!("StressPulse v{}", env!("CARGO_PKG_VERSION"));
        println!();
        print!("{}", config);
        println!();
    }

    let summary = Coordinator::new(config.clone()).run()?;

    if !config.output.quiet {
        text::print_results(&summary);
    }

    if let Some(path) = &config.output.json_output {
        let report = json::build_report(&summary);
        json::write_json_output(path, &report, true)
            .with_context(|| format!("Failed to write JSON output to {}", path.display()))?;
        tracing::info!("JSON output written to {}", path.display());
    }

    if !summary.success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Install the fmt subscriber; `RUST_LOG` overrides `--verbose`/`--quiet`
fn init_logging(config: &Config) {
    let level = if config.output.quiet {
        "warn"
    } else {
        match config.output.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}
