//! Job Supervisor
//!
//! Owns the registry, the admission manager and the table of live runs behind
//! one lock. Every state transition, slot release and promotion happens while
//! that lock is held, so a stop and a process exit racing for the same run
//! resolve to exactly one terminal state. Process I/O never runs under it.

use crate::application::admission::{Admission, AdmissionManager, QueuedJob};
use crate::application::constants::{
    DEFAULT_CAPACITY, DEFAULT_PROMPT_PATTERNS, EVENT_CHANNEL_CAPACITY,
};
use crate::application::controller::{separator, JobProcessController, RunTicket, WorkerCommand};
use crate::application::output::FilterConfig;
use crate::application::registry::JobRegistry;
use crate::application::signal::{stop_channel, StopSender};
use crate::domain::{JobEvent, JobId, JobSnapshot, JobState, LogEntry};
use crate::error::{AppError, Result};
use crate::port::{DescriptorStore, ProcessBackend, ProcessTerminator, TimeProvider};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum number of concurrently running jobs
    pub capacity: usize,
    /// Admit discovered jobs straight away; otherwise they wait for `submit`
    pub auto_process: bool,
    pub filter: FilterConfig,
    /// Output substrings answered with a line terminator
    pub prompt_patterns: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            auto_process: true,
            filter: FilterConfig::default(),
            prompt_patterns: DEFAULT_PROMPT_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Bookkeeping for the current run of a RUNNING job
struct RunSlot {
    attempt: u32,
    stop: StopSender,
    terminator: Option<Arc<dyn ProcessTerminator>>,
}

struct State {
    registry: JobRegistry,
    admission: AdmissionManager,
    runs: HashMap<JobId, RunSlot>,
}

struct Inner {
    state: Mutex<State>,
    controller: JobProcessController,
    store: Arc<dyn DescriptorStore>,
    time: Arc<dyn TimeProvider>,
    events: broadcast::Sender<JobEvent>,
    auto_process: AtomicBool,
}

/// Cloneable handle to the supervisor
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

fn not_found(id: &JobId) -> AppError {
    AppError::NotFound(format!("job {id}"))
}

impl Supervisor {
    /// # Errors
    /// - AppError::InvalidCapacity if `config.capacity` is outside 1..=50
    pub fn new(
        config: SupervisorConfig,
        command: WorkerCommand,
        backend: Arc<dyn ProcessBackend>,
        store: Arc<dyn DescriptorStore>,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self> {
        let admission = AdmissionManager::new(config.capacity)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let controller = JobProcessController::new(
            backend,
            Arc::clone(&store),
            Arc::clone(&time),
            command,
            config.filter,
            config.prompt_patterns,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    registry: JobRegistry::new(),
                    admission,
                    runs: HashMap::new(),
                }),
                controller,
                store,
                time,
                events,
                auto_process: AtomicBool::new(config.auto_process),
            }),
        })
    }

    fn now(&self) -> i64 {
        self.inner.time.now_millis()
    }

    fn emit(&self, event: JobEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.controller.backend_name()
    }

    pub fn auto_process(&self) -> bool {
        self.inner.auto_process.load(Ordering::SeqCst)
    }

    pub fn set_auto_process(&self, enabled: bool) {
        self.inner.auto_process.store(enabled, Ordering::SeqCst);
        info!(enabled, "Auto-process toggled");
    }

    // ------------------------------------------------------------------
    // Operator operations
    // ------------------------------------------------------------------

    /// Register a newly discovered descriptor and admit it (unless held)
    ///
    /// # Errors
    /// - AppError::Conflict if the descriptor already has a job
    pub async fn discover(&self, descriptor_path: &Path) -> Result<JobSnapshot> {
        let now = self.now();
        let auto = self.auto_process();
        let mut launches = Vec::new();

        let snapshot = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let job = state.registry.create(descriptor_path, now)?;
            let id = job.id.clone();
            info!(job_id = %id, name = %job.name, "Found new file");
            if !auto {
                job.log.append(
                    now,
                    format!("File ready: {} (manual processing required)", job.name),
                );
            }
            self.emit(JobEvent::Discovered { job_id: id.clone() });

            if auto {
                self.admit(state, &id, &mut launches)?;
            }
            state
                .registry
                .get(&id)
                .map(|j| j.snapshot())
                .ok_or_else(|| not_found(&id))?
        };

        self.launch(launches);
        Ok(snapshot)
    }

    /// Admit a held job (discovered while auto-process was off)
    ///
    /// # Errors
    /// - AppError::InvalidState if the job is running, waiting, or terminal
    pub async fn submit(&self, id: &JobId) -> Result<JobState> {
        let mut launches = Vec::new();
        let admitted = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let job = state.registry.get(id).ok_or_else(|| not_found(id))?;
            if job.state != JobState::Queued || state.admission.is_queued(id) {
                return Err(AppError::InvalidState(format!(
                    "job {id} is {} and cannot be submitted",
                    job.state
                )));
            }
            self.admit(state, id, &mut launches)?
        };
        self.launch(launches);
        Ok(admitted)
    }

    /// Stop a queued or running job. Idempotent on terminal jobs.
    ///
    /// Returns the state the job is in afterwards.
    pub async fn stop(&self, id: &JobId) -> Result<JobState> {
        let now = self.now();
        let mut launches = Vec::new();

        let (terminator, log) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let job = state.registry.get_mut(id).ok_or_else(|| not_found(id))?;
            let from = job.state;
            if from.is_terminal() {
                debug!(job_id = %id, state = %from, "Stop ignored, job already terminal");
                return Ok(from);
            }

            job.log.append(now, separator());
            job.log.append(now, "⏹ STOPPING PROCESS...");
            job.stop(now)?;
            let log = job.log.clone();

            let terminator = if from == JobState::Running {
                let slot = state.runs.remove(id);
                let promoted = state.admission.on_job_terminal();
                self.start_promoted(state, promoted, &mut launches);
                slot.and_then(|slot| {
                    slot.stop.stop();
                    slot.terminator
                })
            } else {
                state.admission.cancel(id);
                None
            };

            info!(job_id = %id, was = %from, "Job stopped");
            self.emit(JobEvent::StateChanged {
                job_id: id.clone(),
                from,
                to: JobState::Stopped,
            });
            (terminator, log)
        };

        if let Some(terminator) = terminator {
            match terminator.terminate() {
                Ok(()) => log.append(self.now(), "Process terminated"),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Terminating worker failed");
                    log.append(self.now(), format!("Error terminating process: {e}"));
                }
            }
        }
        log.append(
            self.now(),
            "Process stopped. Retry it, or delete the file to skip it.",
        );

        self.launch(launches);
        Ok(JobState::Stopped)
    }

    /// Re-admit a stopped or failed job; the log is kept and continues
    ///
    /// # Errors
    /// - AppError::InvalidState unless the job is STOPPED or FAILED
    pub async fn retry(&self, id: &JobId) -> Result<JobState> {
        let now = self.now();
        let mut launches = Vec::new();

        let admitted = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;

            let job = state.registry.get_mut(id).ok_or_else(|| not_found(id))?;
            let from = job.state;
            if !matches!(from, JobState::Stopped | JobState::Failed) {
                return Err(AppError::InvalidState(format!(
                    "job {id} is {from} and cannot be retried"
                )));
            }

            job.log.append(now, separator());
            job.log.append(now, "🔄 RETRYING PROCESS...");
            job.log.append(now, separator());
            job.requeue_for_retry()?;
            let attempt = job.attempt();

            // a stopped run may still be winding down; its slot is stale
            state.runs.remove(id);

            info!(job_id = %id, attempt, "Retrying job");
            self.emit(JobEvent::StateChanged {
                job_id: id.clone(),
                from,
                to: JobState::Queued,
            });
            self.admit(state, id, &mut launches)?
        };

        self.launch(launches);
        Ok(admitted)
    }

    /// Delete the descriptor of a terminal job and drop the job
    ///
    /// A descriptor that is already gone is not an error.
    ///
    /// # Errors
    /// - AppError::JobStillActive if the job is queued or running
    /// - AppError::Descriptor if the file exists but cannot be removed; the job is kept
    pub async fn delete_and_skip(&self, id: &JobId) -> Result<JobSnapshot> {
        let (path, name, log) = {
            let guard = self.inner.state.lock().await;
            let job = guard.registry.get(id).ok_or_else(|| not_found(id))?;
            if !job.state.is_terminal() {
                return Err(AppError::JobStillActive(id.clone()));
            }
            (job.descriptor_path.clone(), job.name.clone(), job.log.clone())
        };

        if self.inner.store.exists(&path).await {
            if let Err(e) = self.inner.store.remove(&path).await {
                warn!(job_id = %id, error = %e, "Deleting descriptor failed");
                log.append(self.now(), format!("✗ Error deleting file: {e}"));
                return Err(e.into());
            }
            log.append(self.now(), format!("✓ Deleted: {name}"));
            log.append(self.now(), "File has been removed and will be skipped.");
        } else {
            log.append(self.now(), "File no longer exists.");
        }

        let removed = self.inner.state.lock().await.registry.remove(id)?;
        info!(job_id = %id, "Job deleted and skipped");
        self.emit(JobEvent::Removed { job_id: id.clone() });
        Ok(removed.snapshot())
    }

    /// Drop a terminal job from the registry; the descriptor is left alone
    ///
    /// # Errors
    /// - AppError::JobStillActive if the job is queued or running
    pub async fn close(&self, id: &JobId) -> Result<JobSnapshot> {
        let removed = self.inner.state.lock().await.registry.remove(id)?;
        info!(job_id = %id, "Job closed");
        self.emit(JobEvent::Removed { job_id: id.clone() });
        Ok(removed.snapshot())
    }

    /// Change the parallelism cap; refused values keep the previous one
    ///
    /// # Errors
    /// - AppError::InvalidCapacity if `capacity` is outside 1..=50
    pub async fn set_capacity(&self, capacity: usize) -> Result<usize> {
        let mut launches = Vec::new();
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let promoted = state.admission.set_capacity(capacity).map_err(|e| {
                warn!(requested = capacity, error = %e, "Capacity change refused");
                e
            })?;
            info!(
                capacity,
                active = state.admission.active_count(),
                "Max parallel processes updated"
            );
            self.start_promoted(state, promoted, &mut launches);
        }
        self.launch(launches);
        Ok(capacity)
    }

    /// Fill free slots from the waiting queue
    pub async fn promote(&self) {
        let mut launches = Vec::new();
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let promoted = state.admission.promote();
            self.start_promoted(state, promoted, &mut launches);
        }
        self.launch(launches);
    }

    /// Stop every queued and running job; returns how many were stopped
    pub async fn stop_all(&self) -> usize {
        let mut targets: Vec<(JobId, JobState)> = {
            let guard = self.inner.state.lock().await;
            guard
                .registry
                .list_active()
                .into_iter()
                .map(|j| (j.id.clone(), j.state))
                .collect()
        };
        // queued first, so stopping runners does not promote them
        targets.sort_by_key(|(_, state)| *state != JobState::Queued);

        let mut stopped = 0;
        for (id, _) in targets {
            match self.stop(&id).await {
                Ok(JobState::Stopped) => stopped += 1,
                Ok(_) => {}
                Err(e) => warn!(job_id = %id, error = %e, "Stop during shutdown failed"),
            }
        }
        info!(stopped, "Stopped all jobs");
        stopped
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn capacity(&self) -> usize {
        self.inner.state.lock().await.admission.capacity()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.admission.active_count()
    }

    /// Waiting queue in admission order
    pub async fn queued(&self) -> Vec<JobId> {
        self.inner
            .state
            .lock()
            .await
            .admission
            .waiting()
            .map(|q| q.job_id.clone())
            .collect()
    }

    pub async fn get(&self, id: &JobId) -> Option<JobSnapshot> {
        self.inner
            .state
            .lock()
            .await
            .registry
            .get(id)
            .map(|j| j.snapshot())
    }

    pub async fn list(&self) -> Vec<JobSnapshot> {
        let guard = self.inner.state.lock().await;
        guard.registry.list().iter().map(|j| j.snapshot()).collect()
    }

    pub async fn list_active(&self) -> Vec<JobSnapshot> {
        let guard = self.inner.state.lock().await;
        guard
            .registry
            .list_active()
            .iter()
            .map(|j| j.snapshot())
            .collect()
    }

    /// Full log of a job, across all its attempts
    pub async fn log(&self, id: &JobId) -> Option<Vec<LogEntry>> {
        let log = self.inner.state.lock().await.registry.get(id)?.log.clone();
        Some(log.snapshot())
    }

    /// Look a job up by id or by file name
    pub async fn resolve(&self, key: &str) -> Option<JobId> {
        let guard = self.inner.state.lock().await;
        guard
            .registry
            .list()
            .into_iter()
            .find(|j| j.id.as_str() == key || j.name == key)
            .map(|j| j.id.clone())
    }

    // ------------------------------------------------------------------
    // Admission and launch (lock held unless noted)
    // ------------------------------------------------------------------

    fn admit(
        &self,
        state: &mut State,
        id: &JobId,
        launches: &mut Vec<RunTicket>,
    ) -> Result<JobState> {
        let job = state.registry.get(id).ok_or_else(|| not_found(id))?;
        let entry = QueuedJob {
            job_id: id.clone(),
            descriptor_path: job.descriptor_path.clone(),
        };
        let log = job.log.clone();

        match state.admission.submit(entry) {
            Admission::Start => {
                launches.push(self.begin_run(state, id)?);
                Ok(JobState::Running)
            }
            Admission::Enqueued { position } => {
                let active = state.admission.active_count();
                let capacity = state.admission.capacity();
                info!(job_id = %id, position, active, capacity, "Queued (at capacity)");
                log.append(
                    self.now(),
                    format!("Queued (at capacity {active}/{capacity}), position {position}"),
                );
                Ok(JobState::Queued)
            }
        }
    }

    /// QUEUED -> RUNNING for a job that already holds a slot
    fn begin_run(&self, state: &mut State, id: &JobId) -> Result<RunTicket> {
        let now = self.now();
        let Some(job) = state.registry.get_mut(id) else {
            state.admission.release();
            return Err(not_found(id));
        };
        if let Err(e) = job.start(now) {
            state.admission.release();
            return Err(e.into());
        }

        let (stop_tx, stop_rx) = stop_channel();
        let ticket = RunTicket {
            job_id: id.clone(),
            name: job.name.clone(),
            descriptor_path: job.descriptor_path.clone(),
            attempt: job.attempt(),
            log: job.log.clone(),
            stop: stop_rx,
        };
        state.runs.insert(
            id.clone(),
            RunSlot {
                attempt: ticket.attempt,
                stop: stop_tx,
                terminator: None,
            },
        );

        info!(
            job_id = %id,
            attempt = ticket.attempt,
            active = state.admission.active_count(),
            capacity = state.admission.capacity(),
            "Started processing"
        );
        self.emit(JobEvent::StateChanged {
            job_id: id.clone(),
            from: JobState::Queued,
            to: JobState::Running,
        });
        Ok(ticket)
    }

    fn start_promoted(
        &self,
        state: &mut State,
        promoted: Vec<QueuedJob>,
        launches: &mut Vec<RunTicket>,
    ) {
        for next in promoted {
            match self.begin_run(state, &next.job_id) {
                Ok(ticket) => launches.push(ticket),
                Err(e) => warn!(job_id = %next.job_id, error = %e, "Promotion skipped"),
            }
        }
    }

    /// Spawn run tasks; called after the lock is released
    fn launch(&self, tickets: Vec<RunTicket>) {
        for ticket in tickets {
            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.drive(ticket).await });
        }
    }

    /// Run one attempt in its own task, so a panic only fails that job
    async fn drive(self, ticket: RunTicket) {
        let runner = self.clone();
        let run_ticket = ticket.clone();
        let run = tokio::spawn(async move {
            runner.inner.controller.run(run_ticket, &runner).await;
        });

        if let Err(join_error) = run.await {
            let reason = if join_error.is_panic() {
                "job task panicked"
            } else {
                "job task cancelled"
            };
            error!(job_id = %ticket.job_id, error = %join_error, "Job run aborted");
            ticket.log.append(
                self.now(),
                format!("✗ Error processing {}: {}", ticket.name, reason),
            );
            self.commit_failure(&ticket, None).await;
        }
    }

    // ------------------------------------------------------------------
    // Run callbacks
    // ------------------------------------------------------------------

    fn is_current(state: &State, ticket: &RunTicket) -> bool {
        state
            .runs
            .get(&ticket.job_id)
            .is_some_and(|slot| slot.attempt == ticket.attempt)
            && state
                .registry
                .get(&ticket.job_id)
                .is_some_and(|j| j.state == JobState::Running && j.attempt() == ticket.attempt)
    }

    /// Record the process of a run; false if the run was stopped meanwhile
    pub(crate) async fn attach_process(
        &self,
        ticket: &RunTicket,
        pid: Option<u32>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> bool {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if !Self::is_current(state, ticket) {
            return false;
        }
        if let Some(slot) = state.runs.get_mut(&ticket.job_id) {
            slot.terminator = Some(terminator);
        }
        if let Some(job) = state.registry.get_mut(&ticket.job_id) {
            job.pid = pid;
        }
        debug!(job_id = %ticket.job_id, pid, "Worker attached");
        true
    }

    /// Commit a process exit. None if the run is no longer current (stopped,
    /// or superseded by a retry); the exit is then discarded.
    pub(crate) async fn commit_exit(&self, ticket: &RunTicket, exit_code: i32) -> Option<JobState> {
        let now = self.now();
        let mut launches = Vec::new();

        let outcome = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if !Self::is_current(state, ticket) {
                return None;
            }

            let job = state.registry.get_mut(&ticket.job_id)?;
            job.log.append(now, separator());
            let committed = if exit_code == 0 {
                job.log.append(now, format!("✓ Success: {}", job.name));
                job.succeed(now)
            } else {
                job.log.append(
                    now,
                    format!("✗ Failed: {} (exit code: {})", job.name, exit_code),
                );
                job.fail(now, Some(exit_code))
            };
            if let Err(e) = committed {
                warn!(job_id = %ticket.job_id, error = %e, "Exit commit rejected");
                return None;
            }
            let to = job.state;
            self.finish_locked(state, ticket, to, &mut launches);
            to
        };

        self.launch(launches);
        Some(outcome)
    }

    /// Commit a run that failed without a usable exit code
    pub(crate) async fn commit_failure(&self, ticket: &RunTicket, exit_code: Option<i32>) -> bool {
        let now = self.now();
        let mut launches = Vec::new();

        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if !Self::is_current(state, ticket) {
                return false;
            }
            let Some(job) = state.registry.get_mut(&ticket.job_id) else {
                return false;
            };
            if let Err(e) = job.fail(now, exit_code) {
                warn!(job_id = %ticket.job_id, error = %e, "Failure commit rejected");
                return false;
            }
            self.finish_locked(state, ticket, JobState::Failed, &mut launches);
        }

        self.launch(launches);
        true
    }

    fn finish_locked(
        &self,
        state: &mut State,
        ticket: &RunTicket,
        to: JobState,
        launches: &mut Vec<RunTicket>,
    ) {
        state.runs.remove(&ticket.job_id);
        info!(job_id = %ticket.job_id, attempt = ticket.attempt, state = %to, "Job finished");
        self.emit(JobEvent::StateChanged {
            job_id: ticket.job_id.clone(),
            from: JobState::Running,
            to,
        });
        let promoted = state.admission.on_job_terminal();
        self.start_promoted(state, promoted, launches);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::descriptor_store::mocks::InMemoryDescriptorStore;
    use crate::port::process::mocks::MockBackend;
    use crate::port::time_provider::mocks::ManualClock;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        supervisor: Supervisor,
        backend: Arc<MockBackend>,
        store: Arc<InMemoryDescriptorStore>,
    }

    fn fixture_with(config: SupervisorConfig, backend: MockBackend) -> Fixture {
        let backend = Arc::new(backend);
        let store = Arc::new(InMemoryDescriptorStore::new());
        let supervisor = Supervisor::new(
            config,
            WorkerCommand::new("worker"),
            backend.clone(),
            store.clone(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
        .unwrap();
        Fixture {
            supervisor,
            backend,
            store,
        }
    }

    fn fixture(capacity: usize) -> Fixture {
        fixture_with(
            SupervisorConfig {
                capacity,
                ..SupervisorConfig::default()
            },
            MockBackend::new(),
        )
    }

    impl Fixture {
        async fn add(&self, name: &str) -> JobId {
            let path = PathBuf::from("/pending").join(name);
            self.store.insert(path.clone(), "{}");
            self.supervisor.discover(&path).await.unwrap().id
        }

        async fn wait_spawned(&self, count: usize) {
            for _ in 0..300 {
                if self.backend.spawn_count() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {count} spawns, saw {}", self.backend.spawn_count());
        }

        async fn wait_state(&self, id: &JobId, want: JobState) {
            for _ in 0..300 {
                if self.supervisor.get(id).await.map(|j| j.state) == Some(want) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job {id} never reached {want}");
        }

        fn exit(&self, id: &JobId, code: i32) {
            self.backend
                .latest_for(Path::new(id.as_str()))
                .unwrap()
                .exit(code);
        }

        async fn count(&self, want: JobState) -> usize {
            self.supervisor
                .list()
                .await
                .iter()
                .filter(|j| j.state == want)
                .count()
        }
    }

    #[tokio::test]
    async fn test_capacity_bounds_running_jobs_and_queue_is_fifo() {
        let f = fixture(2);
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(f.add(&format!("{n}.json")).await);
        }
        f.wait_spawned(2).await;

        assert_eq!(f.count(JobState::Running).await, 2);
        assert_eq!(f.supervisor.queued().await, ids[2..].to_vec());
        assert_eq!(f.supervisor.active_count().await, 2);

        f.exit(&ids[0], 0);
        f.wait_state(&ids[2], JobState::Running).await;
        assert_eq!(f.supervisor.get(&ids[3]).await.unwrap().state, JobState::Queued);
        assert!(f.supervisor.active_count().await <= 2);

        f.exit(&ids[1], 1);
        f.wait_state(&ids[3], JobState::Running).await;
        assert_eq!(f.supervisor.queued().await, vec![ids[4].clone()]);

        let spawned: Vec<String> = f
            .backend
            .processes()
            .iter()
            .filter_map(|p| p.descriptor().map(str::to_string))
            .collect();
        let expected: Vec<String> = ids[..4].iter().map(|id| id.to_string()).collect();
        assert_eq!(spawned, expected);
    }

    #[tokio::test]
    async fn test_duplicate_discovery_is_rejected() {
        let f = fixture(2);
        let path = PathBuf::from("/pending/a.json");
        f.store.insert(path.clone(), "{}");
        f.supervisor.discover(&path).await.unwrap();
        assert!(matches!(
            f.supervisor.discover(&path).await,
            Err(AppError::Conflict(_))
        ));
        assert_eq!(f.supervisor.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_running_terminates_and_promotes() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        let b = f.add("b.json").await;
        f.wait_spawned(1).await;
        f.wait_state(&a, JobState::Running).await;

        assert_eq!(f.supervisor.stop(&a).await.unwrap(), JobState::Stopped);
        f.wait_state(&b, JobState::Running).await;

        let process = f.backend.latest_for(Path::new(a.as_str())).unwrap();
        assert!(process.was_terminated());
        let log = f.supervisor.log(&a).await.unwrap();
        assert!(log.iter().any(|e| e.message == "⏹ STOPPING PROCESS..."));
        assert!(log.iter().any(|e| e.message == "Process terminated"));

        // the killed process exits -1, which must not overwrite STOPPED
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.supervisor.get(&a).await.unwrap().state, JobState::Stopped);
        assert_eq!(f.supervisor.get(&a).await.unwrap().exit_code, None);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_counts_slot_once() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        f.wait_spawned(1).await;

        f.supervisor.stop(&a).await.unwrap();
        f.supervisor.stop(&a).await.unwrap();
        assert_eq!(f.supervisor.active_count().await, 0);
        assert_eq!(f.supervisor.get(&a).await.unwrap().state, JobState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_queued_job_leaves_queue_without_spawning() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        let b = f.add("b.json").await;
        f.wait_spawned(1).await;

        f.supervisor.stop(&b).await.unwrap();
        assert!(f.supervisor.queued().await.is_empty());

        f.exit(&a, 0);
        f.wait_state(&a, JobState::Succeeded).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.backend.spawn_count(), 1);
        assert_eq!(f.supervisor.get(&b).await.unwrap().state, JobState::Stopped);
    }

    #[tokio::test]
    async fn test_trapped_signal_exit_zero_stays_stopped() {
        let f = fixture_with(
            SupervisorConfig {
                capacity: 1,
                ..SupervisorConfig::default()
            },
            MockBackend::new().with_terminate_exit_code(0),
        );
        let path = PathBuf::from("/pending/a.json");
        f.store.insert(path.clone(), r#"{"deleteMe": true}"#);
        let a = f.supervisor.discover(&path).await.unwrap().id;
        f.wait_spawned(1).await;
        f.wait_state(&a, JobState::Running).await;

        f.supervisor.stop(&a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.supervisor.get(&a).await.unwrap().state, JobState::Stopped);
        assert!(f.store.contains(&path), "stopped jobs never apply deleteMe");
    }

    #[tokio::test]
    async fn test_exit_after_stop_is_discarded() {
        let f = fixture(1);
        let a = f.add("a.json").await;

        let ticket = {
            let mut guard = f.supervisor.inner.state.lock().await;
            let state = &mut *guard;
            let slot = state.runs.get(&a).unwrap();
            let job = state.registry.get(&a).unwrap();
            assert_eq!(slot.attempt, job.attempt());
            let (_tx, stop) = stop_channel();
            RunTicket {
                job_id: a.clone(),
                name: job.name.clone(),
                descriptor_path: job.descriptor_path.clone(),
                attempt: slot.attempt,
                log: job.log.clone(),
                stop,
            }
        };

        f.supervisor.stop(&a).await.unwrap();
        assert_eq!(f.supervisor.commit_exit(&ticket, 0).await, None);
        assert!(!f.supervisor.commit_failure(&ticket, None).await);
        assert_eq!(f.supervisor.get(&a).await.unwrap().state, JobState::Stopped);
        assert_eq!(f.supervisor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_retry_requires_terminal_failure_or_stop() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        f.wait_spawned(1).await;
        assert!(matches!(
            f.supervisor.retry(&a).await,
            Err(AppError::InvalidState(_))
        ));

        f.exit(&a, 0);
        f.wait_state(&a, JobState::Succeeded).await;
        assert!(matches!(
            f.supervisor.retry(&a).await,
            Err(AppError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_waits_for_a_free_slot() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        f.wait_spawned(1).await;
        f.supervisor.stop(&a).await.unwrap();

        let b = f.add("b.json").await;
        f.wait_spawned(2).await;

        assert_eq!(f.supervisor.retry(&a).await.unwrap(), JobState::Queued);
        assert_eq!(f.supervisor.queued().await, vec![a.clone()]);
        assert_eq!(f.supervisor.get(&a).await.unwrap().retries, 1);

        f.exit(&b, 0);
        f.wait_state(&a, JobState::Running).await;
        f.wait_spawned(3).await;
    }

    #[tokio::test]
    async fn test_delete_and_skip_removes_file_and_job() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        f.wait_spawned(1).await;

        assert!(matches!(
            f.supervisor.delete_and_skip(&a).await,
            Err(AppError::JobStillActive(_))
        ));

        f.exit(&a, 1);
        f.wait_state(&a, JobState::Failed).await;
        let removed = f.supervisor.delete_and_skip(&a).await.unwrap();
        assert_eq!(removed.state, JobState::Removed);
        assert!(!f.store.contains(Path::new(a.as_str())));
        assert!(f.supervisor.get(&a).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_and_skip_tolerates_missing_file() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        f.wait_spawned(1).await;
        f.supervisor.stop(&a).await.unwrap();
        f.store.remove_externally(Path::new(a.as_str()));

        f.supervisor.delete_and_skip(&a).await.unwrap();
        assert!(f.supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_job() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        f.wait_spawned(1).await;
        f.supervisor.stop(&a).await.unwrap();
        f.store.fail_removals(true);

        assert!(matches!(
            f.supervisor.delete_and_skip(&a).await,
            Err(AppError::Descriptor(_))
        ));
        assert_eq!(f.supervisor.get(&a).await.unwrap().state, JobState::Stopped);
        let log = f.supervisor.log(&a).await.unwrap();
        assert!(log.iter().any(|e| e.message.starts_with("✗ Error deleting file")));
    }

    #[tokio::test]
    async fn test_close_keeps_descriptor() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        f.wait_spawned(1).await;
        assert!(f.supervisor.close(&a).await.is_err());

        f.exit(&a, 0);
        f.wait_state(&a, JobState::Succeeded).await;
        f.supervisor.close(&a).await.unwrap();
        assert!(f.store.contains(Path::new(a.as_str())));
        assert!(f.supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_raising_capacity_promotes_waiting_jobs() {
        let f = fixture(1);
        for n in 0..4 {
            f.add(&format!("{n}.json")).await;
        }
        f.wait_spawned(1).await;

        assert_eq!(f.supervisor.set_capacity(3).await.unwrap(), 3);
        f.wait_spawned(3).await;
        assert_eq!(f.supervisor.active_count().await, 3);
        assert_eq!(f.supervisor.queued().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lowering_capacity_lets_runners_finish() {
        let f = fixture(3);
        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(f.add(&format!("{n}.json")).await);
        }
        f.wait_spawned(3).await;

        f.supervisor.set_capacity(1).await.unwrap();
        assert_eq!(f.count(JobState::Running).await, 3);

        f.exit(&ids[0], 0);
        f.exit(&ids[1], 0);
        f.wait_state(&ids[1], JobState::Succeeded).await;
        assert_eq!(f.supervisor.get(&ids[3]).await.unwrap().state, JobState::Queued);

        f.exit(&ids[2], 0);
        f.wait_state(&ids[3], JobState::Running).await;
    }

    #[tokio::test]
    async fn test_invalid_capacity_is_refused() {
        let f = fixture(4);
        assert!(matches!(
            f.supervisor.set_capacity(0).await,
            Err(AppError::InvalidCapacity { .. })
        ));
        assert!(f.supervisor.set_capacity(51).await.is_err());
        assert_eq!(f.supervisor.capacity().await, 4);
    }

    #[tokio::test]
    async fn test_held_jobs_wait_for_submit() {
        let f = fixture_with(
            SupervisorConfig {
                auto_process: false,
                ..SupervisorConfig::default()
            },
            MockBackend::new(),
        );
        let a = f.add("a.json").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.backend.spawn_count(), 0);
        let log = f.supervisor.log(&a).await.unwrap();
        assert_eq!(log[0].message, "File ready: a.json (manual processing required)");

        assert_eq!(f.supervisor.submit(&a).await.unwrap(), JobState::Running);
        f.wait_spawned(1).await;
        assert!(matches!(
            f.supervisor.submit(&a).await,
            Err(AppError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let f = fixture(1);
        let mut events = f.supervisor.subscribe();
        let a = f.add("a.json").await;
        f.wait_spawned(1).await;
        f.exit(&a, 0);
        f.wait_state(&a, JobState::Succeeded).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                JobEvent::Discovered { job_id: a.clone() },
                JobEvent::StateChanged {
                    job_id: a.clone(),
                    from: JobState::Queued,
                    to: JobState::Running,
                },
                JobEvent::StateChanged {
                    job_id: a.clone(),
                    from: JobState::Running,
                    to: JobState::Succeeded,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_all_clears_queue_and_runners() {
        let f = fixture(2);
        for n in 0..5 {
            f.add(&format!("{n}.json")).await;
        }
        f.wait_spawned(2).await;

        assert_eq!(f.supervisor.stop_all().await, 5);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.backend.spawn_count(), 2);
        assert_eq!(f.count(JobState::Stopped).await, 5);
        assert_eq!(f.supervisor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_resolve_by_name_or_id() {
        let f = fixture(1);
        let a = f.add("a.json").await;
        assert_eq!(f.supervisor.resolve("a.json").await, Some(a.clone()));
        assert_eq!(f.supervisor.resolve(a.as_str()).await, Some(a));
        assert_eq!(f.supervisor.resolve("zzz.json").await, None);
    }
}
