// Job Process Controller - drives one run of one job
//
// Spawn, confirm, stream and filter output, then hand the exit to the
// supervisor, which commits the terminal state under its lock.

use crate::application::constants::{LOG_SEPARATOR_WIDTH, READ_POLL_INTERVAL, REAP_TIMEOUT};
use crate::application::output::{sanitize, FilterConfig, LineAssembler, LineDecision, LineFilter};
use crate::application::signal::StopToken;
use crate::application::supervisor::Supervisor;
use crate::domain::{JobId, JobLog};
use crate::port::{
    DescriptorStore, ProcessBackend, ProcessError, ProcessHandle, ReadOutcome, SpawnSpec,
    TimeProvider,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How to invoke the external worker: `<program> <args...> <descriptor>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Leading argument placed before the descriptor path (e.g. a script)
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The descriptor path is always the last positional argument
    pub fn spawn_spec(&self, descriptor: &Path) -> SpawnSpec {
        let mut args = self.args.clone();
        args.push(descriptor.to_string_lossy().into_owned());
        SpawnSpec {
            program: self.program.clone(),
            args,
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

/// Everything a run task needs; the attempt number identifies the run
#[derive(Clone)]
pub(crate) struct RunTicket {
    pub job_id: JobId,
    pub name: String,
    pub descriptor_path: PathBuf,
    pub attempt: u32,
    pub log: JobLog,
    pub stop: StopToken,
}

enum PumpOutcome {
    Eof,
    Stopped,
    ReadFailed(ProcessError),
}

pub(crate) fn separator() -> String {
    "=".repeat(LOG_SEPARATOR_WIDTH)
}

pub(crate) struct JobProcessController {
    backend: Arc<dyn ProcessBackend>,
    store: Arc<dyn DescriptorStore>,
    time: Arc<dyn TimeProvider>,
    command: WorkerCommand,
    filter: FilterConfig,
    prompts: Vec<String>,
}

impl JobProcessController {
    pub(crate) fn new(
        backend: Arc<dyn ProcessBackend>,
        store: Arc<dyn DescriptorStore>,
        time: Arc<dyn TimeProvider>,
        command: WorkerCommand,
        filter: FilterConfig,
        prompts: Vec<String>,
    ) -> Self {
        Self {
            backend,
            store,
            time,
            command,
            filter,
            prompts,
        }
    }

    pub(crate) fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn note(&self, ticket: &RunTicket, message: impl Into<String>) {
        ticket.log.append(self.time.now_millis(), message);
    }

    /// Run one attempt to completion. Every failure ends in the job log and a
    /// FAILED commit; nothing propagates out of here.
    pub(crate) async fn run(&self, ticket: RunTicket, supervisor: &Supervisor) {
        self.note(&ticket, format!("Starting processing: {}", ticket.name));
        self.note(&ticket, separator());

        if !self.store.exists(&ticket.descriptor_path).await {
            self.note(
                &ticket,
                format!(
                    "✗ Error processing {}: descriptor {} no longer exists",
                    ticket.name,
                    ticket.descriptor_path.display()
                ),
            );
            supervisor.commit_failure(&ticket, None).await;
            return;
        }

        let spec = self.command.spawn_spec(&ticket.descriptor_path);
        info!(
            job_id = %ticket.job_id,
            attempt = ticket.attempt,
            backend = self.backend.name(),
            program = %spec.program,
            "Spawning worker"
        );

        let mut handle = match self.backend.spawn(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(job_id = %ticket.job_id, error = %e, "Worker spawn failed");
                self.note(&ticket, format!("✗ Error processing {}: {}", ticket.name, e));
                supervisor.commit_failure(&ticket, None).await;
                return;
            }
        };

        if !supervisor
            .attach_process(&ticket, handle.pid(), handle.terminator())
            .await
        {
            // stopped while the process was coming up
            if let Err(e) = handle.terminator().terminate() {
                self.note(&ticket, format!("Error terminating process: {e}"));
            }
            self.reap(handle.as_mut(), &ticket).await;
            return;
        }

        if self.backend.confirms_on_spawn() {
            if let Err(e) = handle.write_line().await {
                debug!(job_id = %ticket.job_id, error = %e, "Initial confirmation not delivered");
            }
        }

        match self.pump_output(handle.as_mut(), &ticket).await {
            PumpOutcome::Eof => {}
            PumpOutcome::Stopped => {
                self.reap(handle.as_mut(), &ticket).await;
                return;
            }
            PumpOutcome::ReadFailed(e) => {
                warn!(job_id = %ticket.job_id, error = %e, "Reading worker output failed");
                self.note(&ticket, format!("✗ Error processing {}: {}", ticket.name, e));
                if let Err(e) = handle.terminator().terminate() {
                    debug!(job_id = %ticket.job_id, error = %e, "Terminate after read error failed");
                }
                self.reap(handle.as_mut(), &ticket).await;
                supervisor.commit_failure(&ticket, None).await;
                return;
            }
        }

        let mut stop = ticket.stop.clone();
        let exit_code = tokio::select! {
            exit = handle.wait() => Some(exit),
            _ = stop.stopped() => None,
        };

        match exit_code {
            // stop won; the supervisor already committed STOPPED
            None => self.reap(handle.as_mut(), &ticket).await,
            Some(Ok(code)) => self.on_exit(&ticket, code, supervisor).await,
            Some(Err(e)) => {
                warn!(job_id = %ticket.job_id, error = %e, "Waiting for worker failed");
                self.note(&ticket, format!("✗ Error processing {}: {}", ticket.name, e));
                supervisor.commit_failure(&ticket, None).await;
            }
        }
    }

    async fn on_exit(&self, ticket: &RunTicket, exit_code: i32, supervisor: &Supervisor) {
        let Some(state) = supervisor.commit_exit(ticket, exit_code).await else {
            debug!(job_id = %ticket.job_id, exit_code, "Exit ignored, run no longer current");
            return;
        };
        info!(job_id = %ticket.job_id, exit_code, state = %state, "Worker exited");

        if exit_code == 0 {
            self.apply_delete_flag(ticket).await;
        }
    }

    /// After a successful run, remove the descriptor if it asks for it
    async fn apply_delete_flag(&self, ticket: &RunTicket) {
        let path = &ticket.descriptor_path;
        let flags = match self.store.read_flags(path).await {
            Ok(flags) => flags,
            Err(e) => {
                warn!(job_id = %ticket.job_id, error = %e, "Descriptor check after success failed");
                self.note(ticket, format!("Note: Could not check/delete file: {e}"));
                return;
            }
        };
        if !flags.delete_me {
            return;
        }

        match self.store.remove(path).await {
            Ok(()) => {
                info!(job_id = %ticket.job_id, "Descriptor deleted (deleteMe)");
                self.note(ticket, format!("Deleted: {}", ticket.name));
            }
            Err(e) => {
                warn!(job_id = %ticket.job_id, error = %e, "Descriptor delete failed");
                self.note(ticket, format!("Note: Could not check/delete file: {e}"));
            }
        }
    }

    async fn pump_output(&self, handle: &mut dyn ProcessHandle, ticket: &RunTicket) -> PumpOutcome {
        let mut filter = LineFilter::new(self.filter.clone());
        let mut assembler = LineAssembler::new();
        let mut stop = ticket.stop.clone();

        loop {
            if stop.is_stopped() {
                return PumpOutcome::Stopped;
            }

            let read = tokio::select! {
                read = handle.read(READ_POLL_INTERVAL) => read,
                _ = stop.stopped() => return PumpOutcome::Stopped,
            };

            match read {
                Ok(ReadOutcome::Data(chunk)) => {
                    for line in assembler.push(&chunk) {
                        self.emit(&mut filter, ticket, &line);
                        if self.is_prompt(&line) {
                            self.confirm(handle, ticket).await;
                        }
                    }
                    // prompts usually come without a trailing newline
                    if self.is_prompt(&assembler.partial()) {
                        if let Some(partial) = assembler.take_partial() {
                            self.emit(&mut filter, ticket, &partial);
                        }
                        self.confirm(handle, ticket).await;
                    }
                }
                Ok(ReadOutcome::Idle) => self.flush_partial(&mut assembler, &mut filter, ticket),
                Ok(ReadOutcome::Eof) => {
                    self.flush_partial(&mut assembler, &mut filter, ticket);
                    return PumpOutcome::Eof;
                }
                Err(e) => return PumpOutcome::ReadFailed(e),
            }
        }
    }

    fn emit(&self, filter: &mut LineFilter, ticket: &RunTicket, raw: &str) {
        if let LineDecision::Emit(line) = filter.process(raw) {
            self.note(ticket, line);
        }
    }

    /// A dangling partial that still holds `[` is an unfinished redraw; drop it
    fn flush_partial(&self, assembler: &mut LineAssembler, filter: &mut LineFilter, ticket: &RunTicket) {
        let Some(partial) = assembler.take_partial() else {
            return;
        };
        if let Some(clean) = sanitize(&partial) {
            if !clean.contains('[') {
                self.emit(filter, ticket, &clean);
            }
        }
    }

    fn is_prompt(&self, text: &str) -> bool {
        self.prompts.iter().any(|p| text.contains(p.as_str()))
    }

    async fn confirm(&self, handle: &mut dyn ProcessHandle, ticket: &RunTicket) {
        self.note(ticket, "[Auto-confirming - sending Enter...]");
        if let Err(e) = handle.write_line().await {
            warn!(job_id = %ticket.job_id, error = %e, "Auto-confirm failed");
            self.note(ticket, format!("Could not send Enter: {e}"));
        }
    }

    async fn reap(&self, handle: &mut dyn ProcessHandle, ticket: &RunTicket) {
        match tokio::time::timeout(REAP_TIMEOUT, handle.wait()).await {
            Ok(Ok(code)) => debug!(job_id = %ticket.job_id, exit_code = code, "Stopped worker reaped"),
            Ok(Err(e)) => debug!(job_id = %ticket.job_id, error = %e, "Reaping stopped worker failed"),
            Err(_) => warn!(job_id = %ticket.job_id, "Stopped worker did not exit in time"),
        }
    }
}
