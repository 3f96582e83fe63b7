//! CLI entry point for cyclerd.
//!
//! Two subcommands:
//! - `init` writes a default settings file into a data directory
//! - `start` runs the daemon until SIGINT or a `stop` command
//!
//! Device and pipeline configuration is a separate YAML file loaded at
//! startup and re-loadable at runtime through the `setup` command.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cycler_core::driver::DriverRegistry;
use cycler_core::request::Request;
use cyclerd::config::{DeviceFile, Settings};
use cyclerd::daemon::Daemon;
use cyclerd::service;
use cycler_driver_mock::MockCycler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cyclerd")]
#[command(about = "Daemon scheduling measurement jobs onto a fleet of battery cyclers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default settings file into a data directory
    Init {
        /// Data directory for settings, job queue and job output
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,
    },

    /// Start the daemon
    Start {
        /// Settings file (TOML); CYCLERD_* env vars override
        #[arg(long, default_value = "settings.toml")]
        config: PathBuf,

        /// Device/pipeline file (YAML) to load at startup
        #[arg(long)]
        devices: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { data_dir } => init(&data_dir),
        Commands::Start { config, devices } => {
            let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
            runtime.block_on(start(&config, devices.as_deref()))
        }
    }
}

fn init(data_dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating '{}'", data_dir.display()))?;
    let path = data_dir.join("settings.toml");
    if path.exists() {
        anyhow::bail!("'{}' already exists", path.display());
    }
    let settings = Settings::defaults_in(data_dir);
    let text = toml::to_string_pretty(&settings).context("serializing default settings")?;
    std::fs::write(&path, text).with_context(|| format!("writing '{}'", path.display()))?;
    info!(path = %path.display(), "default settings written");
    Ok(())
}

async fn start(config: &std::path::Path, devices: Option<&std::path::Path>) -> Result<()> {
    let settings = Settings::load(config)?;

    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(MockCycler::new()));
    let drivers = Arc::new(drivers);
    info!(drivers = ?drivers.driver_types(), "drivers registered");

    let daemon = Daemon::new(&settings, drivers)?;
    let (client, requests) = service::channel(64, Duration::from_secs(30));
    let daemon_task = tokio::spawn(daemon.run(requests));

    if let Some(path) = devices {
        let file = DeviceFile::load(path)?;
        let reply = client
            .call(Request::Setup {
                devices: file.devices,
                pipelines: file.pipelines,
            })
            .await?;
        if !reply.success {
            anyhow::bail!("device file '{}' rejected: {}", path.display(), reply.msg);
        }
        info!(path = %path.display(), "{}", reply.msg);
    }

    signal::ctrl_c().await.context("waiting for SIGINT")?;
    info!("interrupt received, stopping");
    match client.call(Request::Stop).await {
        Ok(_) => {}
        Err(err) => error!(error = %err, "stop command failed"),
    }
    // Dropping the client closes the command channel; either way the loop
    // drains running jobs before exiting.
    drop(client);
    daemon_task.await.context("daemon task panicked")??;
    Ok(())
}
