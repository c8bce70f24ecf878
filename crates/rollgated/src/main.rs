//! rollgated — the Rollgate daemon.
//!
//! Single binary that assembles all Rollgate subsystems:
//! - State store (redb)
//! - Metric source (Prometheus query API or in-process cohort recorder)
//! - Traffic router
//! - Analysis engine
//! - Rollout controller + alert sinks
//! - REST API
//!
//! # Usage
//!
//! ```text
//! rollgated serve --config /etc/rollgate/rollgate.toml --manifest demos/voyager-gateway.toml
//! rollgated validate demos/voyager-gateway.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use rollgate_core::{DaemonConfig, RolloutManifest};

const DEFAULT_FILTER: &str = "info,rollgated=debug,rollgate=debug";

#[derive(Parser)]
#[command(name = "rollgated", about = "Rollgate progressive-delivery daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller and REST API.
    Serve {
        #[command(flatten)]
        overrides: ConfigArgs,

        /// Rollout manifest whose rollouts are started at boot.
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Validate a rollout manifest without starting anything.
    Validate {
        /// Path to the manifest.
        manifest: PathBuf,
    },

    /// Print the effective configuration as TOML.
    Config {
        #[command(flatten)]
        overrides: ConfigArgs,
    },
}

/// Config file plus command-line overrides.
#[derive(clap::Args)]
struct ConfigArgs {
    /// Path to rollgate.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.server.data_dir = dir.clone();
        }
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            overrides,
            manifest,
        } => {
            let config = overrides.load()?;
            let manifest = manifest
                .as_deref()
                .map(RolloutManifest::from_file)
                .transpose()?;
            daemon::run_serve(config, manifest).await
        }
        Command::Validate { manifest } => validate(&manifest),
        Command::Config { overrides } => {
            print!("{}", overrides.load()?.to_toml_string()?);
            Ok(())
        }
    }
}

fn validate(path: &std::path::Path) -> anyhow::Result<()> {
    let manifest = RolloutManifest::from_file(path)?;
    if manifest.rollouts.is_empty() {
        anyhow::bail!("{} defines no rollouts", path.display());
    }

    let mut invalid = 0;
    for spec in &manifest.rollouts {
        match spec.validate() {
            Ok(()) => println!(
                "ok       {} {} -> {} ({} steps)",
                spec.workload,
                spec.stable_version,
                spec.canary_version,
                spec.steps.len()
            ),
            Err(e) => {
                invalid += 1;
                println!("invalid  {}: {e}", spec.workload);
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} of {} rollouts are invalid", manifest.rollouts.len());
    }
    Ok(())
}
