// src/main.rs

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dns_blm::app::App;
use dns_blm::config::{AppConfig, CONFIG_PATH_ENV};
use dns_blm::logging::initialize_logging;

#[derive(Parser)]
#[command(name = "dns-blm", version)]
#[command(about = "Checks domains against blacklist providers and mails a report")]
struct Cli {
    /// Configuration file (default: dns-blm.toml)
    #[arg(long, short, global = true, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the timed tasks until interrupted
    Run,

    /// Scan the configured domains once and print the result
    Scan,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let path = AppConfig::resolve_path(cli.config.as_deref());
    let config = AppConfig::load(&path)
        .wrap_err_with(|| format!("failed to load configuration from {}", path.display()))?;
    initialize_logging(config.debug)?;
    info!(version = env!("CARGO_PKG_VERSION"), config = %path.display(), "Starting DNS-BLM.");

    let app = App::from_config(config)?;
    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    match cli.command {
        Commands::Run => {
            app.run_scheduled(&cancel).await?;
            info!("All timed tasks stopped.");
        }
        Commands::Scan => {
            let result = app.scan_now(&cancel).await.wrap_err("on-demand scan failed")?;
            println!("{result}");
        }
    }
    Ok(())
}

/// Cancels `cancel` on Ctrl-C.
fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Cannot listen for Ctrl-C.");
            return;
        }
        info!("Shutdown requested.");
        cancel.cancel();
    });
}
