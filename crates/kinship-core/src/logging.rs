//! Tracing subscriber setup.
//!
//! `KINSHIP_LOG` takes precedence over `[logging].level`. When file logging is
//! enabled, a daily rolling file is written to the given log directory through
//! a non-blocking writer; keep the returned guard alive until exit.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "KINSHIP_LOG";
const LOG_FILE_PREFIX: &str = "kinship.log";

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Installs the global subscriber.
///
/// Logs go to stderr so command output on stdout stays clean.
///
/// # Errors
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig, logs_dir: &Path) -> Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.log_to_file {
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create log directory {}", logs_dir.display()))?;
        let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(env_filter(config))
            .with(stderr_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(Some(guard));
    }

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(None)
}

/// Returns a masked version of a token for logs and display.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 16 {
        return "***".to_string();
    }
    let prefix: String = token.chars().take(12).collect();
    format!("{prefix}...")
}
