//! CLI entry point for the coordination core.
//!
//! Provides command-line interface for:
//! - Running the coordination server daemon (`serve`)
//! - Executing a Rhai script with the import guard installed (`run`)
//!
//! # Usage
//!
//! Start the daemon:
//! ```bash
//! lab_coord serve --port 7339
//! ```
//!
//! Run a script:
//! ```bash
//! lab_coord run experiments/scan.rhai
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use lab_coord::config::CoordConfig;
use lab_coord::import_guard::{GuardOptions, ImportGuard};
use lab_coord::server::LockServer;
use lab_coord::tracing_setup;

#[derive(Parser)]
#[command(name = "lab_coord")]
#[command(about = "HDF5 coordination server and script tools", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/lab_coord.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordination server daemon
    Serve {
        /// TCP port to listen on (overrides configuration)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },

    /// Run a Rhai script with the double-import guard installed
    Run {
        /// Path to the .rhai script file
        script: PathBuf,

        /// Do not install the double-import guard
        #[arg(long)]
        no_import_guard: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CoordConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CoordConfig::load().context("loading configuration")?,
    };
    tracing_setup::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Serve { port, bind } => serve(config, bind, port).await,
        Commands::Run {
            script,
            no_import_guard,
        } => run_script(script, no_import_guard).await,
    }
}

async fn serve(mut config: CoordConfig, bind: String, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    config.check_security()?;

    let addr = format!("{}:{}", bind, config.server.port);
    let server = LockServer::bind(&addr, &config).await?;
    info!(session_timeout_ms = config.timeouts.session_ms, "daemon ready");
    server.run().await?;
    Ok(())
}

async fn run_script(script: PathBuf, no_import_guard: bool) -> Result<()> {
    let contents = tokio::fs::read_to_string(&script)
        .await
        .with_context(|| format!("reading {}", script.display()))?;

    let base_path = script
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut engine = rhai::Engine::new();
    ImportGuard::install(
        &mut engine,
        GuardOptions {
            base_path,
            enabled: !no_import_guard,
            ..GuardOptions::default()
        },
    )?;

    info!(script = %script.display(), "running script");
    engine
        .run(&contents)
        .map_err(|e| anyhow!("script failed: {e}"))?;
    Ok(())
}
