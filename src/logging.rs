//! Tracing subscriber setup.
//!
//! Logs always go to a daily-rotating file so bug reports have something to
//! attach. Stderr output is added on request.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::cli::Verbosity;

const APP_DIR: &str = "veil";
const LOG_FILE_PREFIX: &str = "veil.log";

const FILE_FILTER: &str = "veil=info,info";
const STDERR_FILTER: &str = "veil=info,info";
const STDERR_TRAFFIC_FILTER: &str = "veil=info,veil::relay=debug,info";

/// Directory the rolling log file lives in.
///
/// `--log-file=<path>` overrides the platform default with the parent of
/// `<path>`.
pub fn log_dir(log_file: Option<&Path>) -> PathBuf {
    match log_file {
        Some(path) => path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("logs"),
    }
}

fn stderr_filter(verbose: Option<Verbosity>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose == Some(Verbosity::Xmpp) {
        EnvFilter::new(STDERR_TRAFFIC_FILTER)
    } else {
        EnvFilter::new(STDERR_FILTER)
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(verbose: Option<Verbosity>, log_file: Option<&Path>) -> WorkerGuard {
    let dir = log_dir(log_file);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("Warning: could not create log directory '{}': {}", dir.display(), e);
    }

    let file_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(FILE_FILTER)
    };

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer =
        if verbose.is_some() || log_file.is_some() || std::env::var("RUST_LOG").is_ok() {
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(stderr_filter(verbose)),
            )
        } else {
            None
        };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    eprintln!("Log file: {}", dir.display());
    guard
}
