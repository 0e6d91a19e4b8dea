// Job Domain Model

use crate::domain::error::{DomainError, Result};
use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Job ID: the absolute path of the descriptor file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn from_path(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Stopped,
    Succeeded,
    Failed,
    Removed,
}

impl JobState {
    /// Terminal states: no further automatic transition happens
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Stopped | JobState::Succeeded | JobState::Failed
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Stopped => write!(f, "STOPPED"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Removed => write!(f, "REMOVED"),
        }
    }
}

/// One timestamped line of a job's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: i64, // epoch ms
    pub message: String,
}

impl LogEntry {
    /// Render as `[HH:MM:SS] message` in local time
    pub fn render(&self) -> String {
        let clock = Local
            .timestamp_millis_opt(self.at)
            .single()
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "--:--:--".to_string());
        format!("[{}] {}", clock, self.message)
    }
}

/// Append-only job log, shared between the registry and the job's run task.
///
/// Cumulative across retries. Kept behind its own lock so output streaming
/// never contends with admission decisions.
#[derive(Debug, Clone, Default)]
pub struct JobLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl JobLog {
    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        // A panicking appender leaves the Vec intact, so the data is still usable
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, at: i64, message: impl Into<String>) {
        self.lock().push(LogEntry {
            at,
            message: message.into(),
        });
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    /// Messages only, without timestamps
    pub fn messages(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|e| e.message.contains(needle))
    }
}

/// Job Entity
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub descriptor_path: PathBuf,
    pub state: JobState,

    /// Arrival order in the registry
    pub seq: u64,
    pub retries: u32,

    pub created_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub exit_code: Option<i32>,

    /// OS process id while running
    pub pid: Option<u32>,
    pub log: JobLog,
}

/// Read-only view of a job for UI/API consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub descriptor_path: PathBuf,
    pub state: JobState,
    pub seq: u64,
    pub retries: u32,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub log_len: usize,
}

impl Job {
    /// Create a new job in QUEUED state
    ///
    /// # Arguments
    ///
    /// * `descriptor_path` - Absolute descriptor path, also the job identity
    /// * `seq` - Arrival sequence number
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    pub fn new(descriptor_path: impl Into<PathBuf>, seq: u64, created_at: i64) -> Self {
        let descriptor_path = descriptor_path.into();
        let name = descriptor_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| descriptor_path.to_string_lossy().into_owned());

        Self {
            id: JobId::from_path(&descriptor_path),
            name,
            descriptor_path,
            state: JobState::Queued,
            seq,
            retries: 0,
            created_at,
            started_at: None,
            finished_at: None,
            exit_code: None,
            pid: None,
            log: JobLog::default(),
        }
    }

    /// Attempt number of the current (or next) run, starting at 1
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    fn transition_error(&self, to: JobState) -> DomainError {
        DomainError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    /// Transition to Running state with explicit timestamp
    pub fn start(&mut self, now_millis: i64) -> Result<()> {
        if self.state != JobState::Queued {
            return Err(self.transition_error(JobState::Running));
        }
        self.state = JobState::Running;
        self.started_at = Some(now_millis);
        self.finished_at = None;
        self.exit_code = None;
        Ok(())
    }

    /// Transition to Succeeded state after a zero exit code
    pub fn succeed(&mut self, now_millis: i64) -> Result<()> {
        if self.state != JobState::Running {
            return Err(self.transition_error(JobState::Succeeded));
        }
        self.state = JobState::Succeeded;
        self.finished_at = Some(now_millis);
        self.exit_code = Some(0);
        self.pid = None;
        Ok(())
    }

    /// Transition to Failed state; `exit_code` is None when no process exit was observed
    pub fn fail(&mut self, now_millis: i64, exit_code: Option<i32>) -> Result<()> {
        if self.state != JobState::Running {
            return Err(self.transition_error(JobState::Failed));
        }
        self.state = JobState::Failed;
        self.finished_at = Some(now_millis);
        self.exit_code = exit_code;
        self.pid = None;
        Ok(())
    }

    /// Transition to Stopped; returns false (no-op) if already terminal
    pub fn stop(&mut self, now_millis: i64) -> Result<bool> {
        match self.state {
            JobState::Queued | JobState::Running => {
                self.state = JobState::Stopped;
                self.finished_at = Some(now_millis);
                self.pid = None;
                Ok(true)
            }
            JobState::Stopped | JobState::Succeeded | JobState::Failed => Ok(false),
            JobState::Removed => Err(self.transition_error(JobState::Stopped)),
        }
    }

    /// Reset a stopped or failed job so it can be admitted again
    pub fn requeue_for_retry(&mut self) -> Result<()> {
        if !matches!(self.state, JobState::Stopped | JobState::Failed) {
            return Err(self.transition_error(JobState::Queued));
        }
        self.retries += 1;
        self.state = JobState::Queued;
        self.started_at = None;
        self.finished_at = None;
        self.exit_code = None;
        self.pid = None;
        Ok(())
    }

    /// Final transition when the job leaves the registry
    pub fn mark_removed(&mut self) -> Result<()> {
        if !self.state.is_terminal() {
            return Err(self.transition_error(JobState::Removed));
        }
        self.state = JobState::Removed;
        Ok(())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            descriptor_path: self.descriptor_path.clone(),
            state: self.state,
            seq: self.seq,
            retries: self.retries,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            pid: self.pid,
            log_len: self.log.len(),
        }
    }
}
