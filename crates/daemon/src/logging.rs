//! tracing setup
//!
//! `JOBWATCH_LOG_FORMAT=json|pretty` picks the stderr format, `RUST_LOG`
//! overrides the default filter, and `--log-dir` adds a daily rolling file.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FORMAT_ENV: &str = "JOBWATCH_LOG_FORMAT";
const DEFAULT_FILTER: &str = "jobwatch=info,jobwatch_core=info,jobwatch_infra_system=info,jobwatch_daemon=info";
const LOG_FILE_PREFIX: &str = "jobwatch.log";

/// Install the global subscriber. Keep the returned guard alive until exit,
/// or buffered file output is lost.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("Failed to create env filter")?;

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create log folder {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
    let format = std::env::var(LOG_FORMAT_ENV).unwrap_or_else(|_| "pretty".to_string());
    match format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
