//! vmscaled — the vmscale daemon.
//!
//! Single binary that assembles the controller:
//! - State store and metrics store (redb)
//! - Hypervisor drivers (virsh, or simulated with `--dry-run`)
//! - Metrics collector
//! - Reconciler
//! - Action queue and executor
//! - Platform bridge forwarder
//!
//! # Usage
//!
//! ```text
//! vmscaled init --config /etc/vmscale/vmscale.toml
//! vmscaled validate --config /etc/vmscale/vmscale.toml
//! vmscaled run --config /etc/vmscale/vmscale.toml [--dry-run] [--json-logs]
//! ```

mod daemon;

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vmscale_core::ControllerConfig;

const DEFAULT_CONFIG: &str = "/etc/vmscale/vmscale.toml";
const DEFAULT_FILTER: &str = "info,vmscaled=debug,vmscale=debug";

#[derive(Parser)]
#[command(name = "vmscaled", about = "vmscale autoscaling controller")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until Ctrl-C.
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Simulate hypervisor calls instead of running virsh.
        #[arg(long)]
        dry_run: bool,
    },
    /// Load and validate a config file, then exit.
    Validate {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Write a starter config file.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run { config, dry_run } => {
            if ControllerConfig::write_default(&config)? {
                warn!(path = %config.display(), "no config found, wrote a starter config; review it and run again");
                return Ok(());
            }
            let loaded = ControllerConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            info!(path = %config.display(), "config loaded");
            daemon::run(loaded, dry_run).await
        }
        Command::Validate { config } => {
            let loaded = ControllerConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let autoscale = &loaded.controller.autoscale;
            println!(
                "{}: ok ({} hosts, {} groups)",
                config.display(),
                autoscale.hosts.len(),
                autoscale.groups.len()
            );
            Ok(())
        }
        Command::Init { config } => {
            if !ControllerConfig::write_default(&config)? {
                bail!("{} already exists", config.display());
            }
            println!("wrote {}", config.display());
            Ok(())
        }
    }
}
