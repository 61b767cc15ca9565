// src/logging.rs

use color_eyre::eyre::Result;
use directories::ProjectDirs;
use lazy_static::lazy_static;
use std::path::PathBuf;
use time::macros::format_description;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::{self, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    pub static ref PROJECT_NAME: String = env!("CARGO_CRATE_NAME").to_uppercase();
    pub static ref LOG_ENV: String = format!("{}_LOGLEVEL", PROJECT_NAME.as_str());
    pub static ref LOG_FILE: String = format!("{}.log", env!("CARGO_PKG_NAME"));
}

fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("ch", "dns-blm", env!("CARGO_PKG_NAME"))
}

/// Directory holding the log file; `./.data` when the platform has no data dir.
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = project_directory() {
        proj_dirs.data_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".data")
    }
}

/// Filter directive: `RUST_LOG`, then `<CRATE>_LOGLEVEL`, then `<crate>=info`
/// (`<crate>=debug` when `debug` is set).
fn log_level(debug: bool) -> String {
    std::env::var("RUST_LOG")
        .or_else(|_| std::env::var(LOG_ENV.as_str()))
        .unwrap_or_else(|_| {
            let level = if debug { "debug" } else { "info" };
            format!("{}={level}", env!("CARGO_CRATE_NAME"))
        })
}

/// Initializes console and file logging using the tracing subscriber.
///
/// # Arguments
/// * `debug` - Raise the default level when no filter is set in the environment.
pub fn initialize_logging(debug: bool) -> Result<()> {
    let directory = get_data_dir();
    std::fs::create_dir_all(&directory)?;
    let log_path = directory.join(LOG_FILE.as_str());
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let level = log_level(debug);
    let timer = LocalTime::new(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    ));

    let file_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_timer(timer.clone())
        .with_target(false)
        .with_ansi(false)
        .with_filter(EnvFilter::new(&level));

    let console_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(timer)
        .with_target(false)
        .with_filter(EnvFilter::new(&level));

    tracing_subscriber::registry()
        .with(file_subscriber)
        .with(console_subscriber)
        .with(ErrorLayer::default())
        .init();

    Ok(())
}
