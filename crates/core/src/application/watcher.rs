// Directory Watcher - polls the pending folder for new descriptors

use crate::application::constants::{
    DEFAULT_DESCRIPTOR_EXTENSION, DEFAULT_POLL_ERROR_BACKOFF, DEFAULT_POLL_INTERVAL,
};
use crate::application::signal::{stop_channel, StopSender, StopToken};
use crate::application::supervisor::Supervisor;
use crate::error::{AppError, Result};
use crate::port::DescriptorStore;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    pub dir: PathBuf,
    /// Descriptor file extension, without the dot
    pub extension: String,
    pub poll_interval: Duration,
    /// Pause after a failed poll
    pub error_backoff: Duration,
}

impl WatcherConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: DEFAULT_DESCRIPTOR_EXTENSION.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_backoff: DEFAULT_POLL_ERROR_BACKOFF,
        }
    }
}

/// Poll loop state. The seen-set only grows: a path is handed to the
/// supervisor at most once per process lifetime.
pub struct DirectoryWatcher {
    store: Arc<dyn DescriptorStore>,
    config: WatcherConfig,
    seen: HashSet<PathBuf>,
}

impl DirectoryWatcher {
    pub fn new(store: Arc<dyn DescriptorStore>, config: WatcherConfig) -> Self {
        Self {
            store,
            config,
            seen: HashSet::new(),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn has_seen(&self, path: &std::path::Path) -> bool {
        self.seen.contains(path)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// One directory scan; returns the newly discovered paths
    pub async fn poll_once(&mut self, supervisor: &Supervisor) -> Result<Vec<PathBuf>> {
        let files = self
            .store
            .list(&self.config.dir, &self.config.extension)
            .await?;

        let mut discovered = Vec::new();
        for path in files {
            if !self.seen.insert(path.clone()) {
                continue;
            }
            match supervisor.discover(&path).await {
                Ok(_) => discovered.push(path),
                Err(AppError::Conflict(reason)) => debug!(%reason, "Descriptor already registered"),
                Err(e) => warn!(path = %path.display(), error = %e, "Discovery failed"),
            }
        }

        // cheap when nothing is waiting
        supervisor.promote().await;
        Ok(discovered)
    }

    /// Poll until `stop` fires; hands itself back so the seen-set survives restarts
    pub async fn run(mut self, supervisor: Supervisor, mut stop: StopToken) -> Self {
        match self.store.ensure_dir(&self.config.dir).await {
            Ok(dir) => self.config.dir = dir,
            Err(e) => warn!(error = %e, "Cannot prepare watch folder"),
        }
        info!(
            dir = %self.config.dir.display(),
            extension = %self.config.extension,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Started watching folder"
        );

        loop {
            if stop.is_stopped() {
                break;
            }

            let pause = match self.poll_once(&supervisor).await {
                Ok(found) => {
                    if !found.is_empty() {
                        debug!(count = found.len(), "New descriptors discovered");
                    }
                    self.config.poll_interval
                }
                Err(e) => {
                    warn!(error = %e, "Error in watch loop");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = sleep(pause) => {},
                _ = stop.stopped() => break,
            }
        }

        info!(dir = %self.config.dir.display(), "Stopped watching folder");
        self
    }
}

struct Running {
    stop: StopSender,
    task: JoinHandle<DirectoryWatcher>,
}

#[derive(Default)]
struct ControllerState {
    idle: Option<DirectoryWatcher>,
    running: Option<Running>,
}

/// Start/stop switch around one watcher
pub struct WatchController {
    supervisor: Supervisor,
    store: Arc<dyn DescriptorStore>,
    config: WatcherConfig,
    state: Mutex<ControllerState>,
}

impl WatchController {
    pub fn new(supervisor: Supervisor, store: Arc<dyn DescriptorStore>, config: WatcherConfig) -> Self {
        let watcher = DirectoryWatcher::new(Arc::clone(&store), config.clone());
        Self {
            supervisor,
            store,
            config,
            state: Mutex::new(ControllerState {
                idle: Some(watcher),
                running: None,
            }),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Start polling; false if already watching
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.running.is_some() {
            return false;
        }

        let watcher = state
            .idle
            .take()
            .unwrap_or_else(|| DirectoryWatcher::new(Arc::clone(&self.store), self.config.clone()));
        let (stop, token) = stop_channel();
        let task = tokio::spawn(watcher.run(self.supervisor.clone(), token));
        state.running = Some(Running { stop, task });
        true
    }

    /// Stop polling and wait for the loop to exit; false if not watching
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.take() else {
            return false;
        };

        running.stop.stop();
        match running.task.await {
            Ok(watcher) => state.idle = Some(watcher),
            Err(e) => {
                error!(error = %e, "Watch loop aborted");
                state.idle = Some(DirectoryWatcher::new(
                    Arc::clone(&self.store),
                    self.config.clone(),
                ));
            }
        }
        true
    }

    pub async fn is_watching(&self) -> bool {
        self.state.lock().await.running.is_some()
    }
}
