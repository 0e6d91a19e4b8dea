//! Command-line and environment configuration

use anyhow::{Context, Result};
use clap::Parser;
use jobwatch_core::application::constants::{
    DEFAULT_CAPACITY, DEFAULT_DESCRIPTOR_EXTENSION, DEFAULT_POLL_ERROR_BACKOFF,
    DEFAULT_PROGRESS_THRESHOLD, DEFAULT_PROMPT_PATTERNS, DEFAULT_STREAM_LABELS, MAX_CAPACITY,
    MIN_CAPACITY,
};
use jobwatch_core::application::{FilterConfig, SupervisorConfig, WatcherConfig, WorkerCommand};
use jobwatch_infra_system::{BackendKind, DEFAULT_HOST_NAME};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_WATCH_DIR: &str = "./pending";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_WORKER_ENV: (&str, &str) = ("PYTHONIOENCODING", "utf-8");

#[derive(Parser, Debug)]
#[command(name = "jobwatch")]
#[command(about = "Watch a folder of job descriptors and run a worker for each", long_about = None)]
#[command(version)]
pub struct Args {
    /// Folder polled for descriptor files (created if absent)
    #[arg(long, env = "JOBWATCH_WATCH_DIR", default_value = DEFAULT_WATCH_DIR)]
    pub watch_dir: String,

    /// Worker executable; invoked as `<worker> [worker-args] <descriptor>`
    #[arg(long, env = "JOBWATCH_WORKER")]
    pub worker: String,

    /// Leading worker argument, e.g. the script an interpreter should run
    #[arg(
        long = "worker-arg",
        env = "JOBWATCH_WORKER_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    pub worker_args: Vec<String>,

    /// Extra worker environment variable, KEY=VALUE
    #[arg(long = "env", value_parser = parse_key_val)]
    pub worker_env: Vec<(String, String)>,

    /// Maximum parallel workers
    #[arg(long, env = "JOBWATCH_CAPACITY", default_value_t = DEFAULT_CAPACITY, value_parser = parse_capacity)]
    pub capacity: usize,

    /// Process backend: pty or pipe (platform default when omitted)
    #[arg(long, env = "JOBWATCH_BACKEND")]
    pub backend: Option<BackendKind>,

    /// Descriptor file extension
    #[arg(long, env = "JOBWATCH_EXTENSION", default_value = DEFAULT_DESCRIPTOR_EXTENSION)]
    pub extension: String,

    /// Directory poll interval in milliseconds
    #[arg(long, env = "JOBWATCH_POLL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_ms: u64,

    /// Minimum progress change (percentage points) worth a log line
    #[arg(long, env = "JOBWATCH_PROGRESS_THRESHOLD", default_value_t = DEFAULT_PROGRESS_THRESHOLD)]
    pub progress_threshold: f64,

    /// Progress stream label (line prefix)
    #[arg(
        long = "stream-label",
        env = "JOBWATCH_STREAM_LABELS",
        value_delimiter = ',',
        default_values_t = DEFAULT_STREAM_LABELS.iter().map(|s| s.to_string()).collect::<Vec<_>>()
    )]
    pub stream_labels: Vec<String>,

    /// Output fragment answered with Enter
    #[arg(
        long = "prompt",
        default_values_t = DEFAULT_PROMPT_PATTERNS.iter().map(|s| s.to_string()).collect::<Vec<_>>()
    )]
    pub prompts: Vec<String>,

    /// Do not start watching until `watch start`
    #[arg(long)]
    pub paused: bool,

    /// Hold discovered jobs until submitted from the console
    #[arg(long)]
    pub manual: bool,

    /// Also write logs, rotated daily, to this folder
    #[arg(long, env = "JOBWATCH_LOG_DIR")]
    pub log_dir: Option<String>,

    /// Native-messaging host name checked in browser manifests at startup
    #[arg(long, env = "JOBWATCH_HOST_NAME", default_value = DEFAULT_HOST_NAME)]
    pub manifest_host: String,
}

fn parse_capacity(raw: &str) -> Result<usize, String> {
    let value: usize = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&value) {
        return Err(format!(
            "must be between {MIN_CAPACITY} and {MAX_CAPACITY}"
        ));
    }
    Ok(value)
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err("empty variable name".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

impl Args {
    pub fn watch_dir(&self) -> PathBuf {
        expand(&self.watch_dir)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_deref().map(expand)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.unwrap_or_else(BackendKind::platform_default)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            capacity: self.capacity,
            auto_process: !self.manual,
            filter: FilterConfig {
                threshold: self.progress_threshold,
                stream_labels: self.stream_labels.clone(),
            },
            prompt_patterns: self.prompts.clone(),
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            extension: self.extension.trim_start_matches('.').to_string(),
            poll_interval: Duration::from_millis(self.poll_ms),
            error_backoff: DEFAULT_POLL_ERROR_BACKOFF,
            ..WatcherConfig::new(self.watch_dir())
        }
    }

    /// Workers run in our current directory with the default encoding variable
    pub fn worker_command(&self) -> Result<WorkerCommand> {
        let cwd = std::env::current_dir().context("Cannot determine current directory")?;
        let mut command = WorkerCommand::new(shellexpand::tilde(&self.worker).into_owned())
            .args(self.worker_args.iter().cloned())
            .working_dir(cwd);

        let (key, value) = DEFAULT_WORKER_ENV;
        if !self.worker_env.iter().any(|(k, _)| k == key) {
            command = command.env(key, value);
        }
        for (key, value) in &self.worker_env {
            command = command.env(key.as_str(), value.as_str());
        }
        Ok(command)
    }
}
