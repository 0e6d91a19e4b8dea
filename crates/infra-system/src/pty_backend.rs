// Pseudo-terminal process backend
// For workers that only print prompts and progress when attached to a tty
use async_trait::async_trait;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use jobwatch_core::port::{
    ProcessBackend, ProcessError, ProcessHandle, ProcessTerminator, ReadOutcome, SpawnSpec,
};

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 120;

const READ_CHUNK: usize = 8192;
const OUTPUT_CHANNEL_DEPTH: usize = 256;

pub struct PtyBackend {
    rows: u16,
    cols: u16,
}

impl PtyBackend {
    pub fn new() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }

    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }
}

impl Default for PtyBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_error(e: impl std::fmt::Display) -> ProcessError {
    ProcessError::Spawn(e.to_string())
}

#[async_trait]
impl ProcessBackend for PtyBackend {
    fn name(&self) -> &'static str {
        "pty"
    }

    fn confirms_on_spawn(&self) -> bool {
        false
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(spawn_error)?;

        let mut command = CommandBuilder::new(&spec.program);
        command.args(&spec.args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        match &spec.working_dir {
            Some(dir) => command.cwd(dir),
            None => {
                if let Ok(dir) = std::env::current_dir() {
                    command.cwd(dir);
                }
            }
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| ProcessError::Spawn(format!("{}: {}", spec.program, e)))?;
        // only the child keeps the slave side open, so EOF follows its exit
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let mut reader = pair.master.try_clone_reader().map_err(spawn_error)?;
        let writer = pair.master.take_writer().map_err(spawn_error)?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    // EIO once the slave side is closed on Linux
                    Err(_) => break,
                }
            }
        });

        let exited = Arc::new(AtomicBool::new(false));
        let waiter_exited = Arc::clone(&exited);
        let waiter = tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(_) => -1,
            };
            waiter_exited.store(true, Ordering::SeqCst);
            code
        });

        info!(pid = ?pid, program = %spec.program, "Spawned worker on pseudo-terminal");

        Ok(Box::new(PtyHandle {
            _master: pair.master,
            writer,
            output: rx,
            waiter: Some(waiter),
            exit_code: None,
            terminator: Arc::new(PtyTerminator {
                killer: Mutex::new(killer),
                exited,
            }),
            pid,
        }))
    }
}

struct PtyHandle {
    // closing the master hangs up the terminal
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    output: mpsc::Receiver<Vec<u8>>,
    waiter: Option<JoinHandle<i32>>,
    exit_code: Option<i32>,
    terminator: Arc<PtyTerminator>,
    pid: Option<u32>,
}

#[async_trait]
impl ProcessHandle for PtyHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminator(&self) -> Arc<dyn ProcessTerminator> {
        self.terminator.clone()
    }

    async fn read(&mut self, wait: Duration) -> Result<ReadOutcome, ProcessError> {
        match timeout(wait, self.output.recv()).await {
            Ok(Some(bytes)) => Ok(ReadOutcome::Data(bytes)),
            Ok(None) => Ok(ReadOutcome::Eof),
            Err(_) => Ok(ReadOutcome::Idle),
        }
    }

    async fn write_line(&mut self) -> Result<(), ProcessError> {
        // a single byte into the terminal buffer does not block
        self.writer
            .write_all(b"\n")
            .and_then(|_| self.writer.flush())
            .map_err(|e| ProcessError::Io(e.to_string()))
    }

    async fn wait(&mut self) -> Result<i32, ProcessError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let waiter = self
            .waiter
            .take()
            .ok_or_else(|| ProcessError::Io("exit status already consumed".to_string()))?;
        let code = waiter
            .await
            .map_err(|e| ProcessError::Io(format!("waiter task failed: {e}")))?;
        debug!(pid = ?self.pid, exit_code = code, "Worker exited");
        self.exit_code = Some(code);
        Ok(code)
    }
}

struct PtyTerminator {
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: Arc<AtomicBool>,
}

impl ProcessTerminator for PtyTerminator {
    fn terminate(&self) -> Result<(), ProcessError> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| ProcessError::Termination("killer lock poisoned".to_string()))?;
        match killer.kill() {
            Ok(()) => Ok(()),
            // raced with a natural exit
            Err(_) if self.exited.load(Ordering::SeqCst) => Ok(()),
            Err(e) => Err(ProcessError::Termination(e.to_string())),
        }
    }
}
