// Pipe process backend
// stdin/stdout/stderr pipes; stdout and stderr are merged into one stream
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use jobwatch_core::port::{
    ProcessBackend, ProcessError, ProcessHandle, ProcessTerminator, ReadOutcome, SpawnSpec,
};

const READ_CHUNK: usize = 4096;
const OUTPUT_CHANNEL_DEPTH: usize = 64;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Plain-pipe backend, the default on Windows
///
/// Sends one line terminator right after spawn, since many workers ask for
/// confirmation before the pipe has produced any output.
pub struct PipeBackend {
    initial_confirmation: bool,
}

impl PipeBackend {
    pub fn new() -> Self {
        Self {
            initial_confirmation: true,
        }
    }

    pub fn with_initial_confirmation(mut self, enabled: bool) -> Self {
        self.initial_confirmation = enabled;
        self
    }
}

impl Default for PipeBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward one pipe into the shared output channel until it closes
async fn forward<R>(mut pipe: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Output pipe closed with error");
                break;
            }
        }
    }
}

#[async_trait]
impl ProcessBackend for PipeBackend {
    fn name(&self) -> &'static str {
        "pipe"
    }

    fn confirms_on_spawn(&self) -> bool {
        self.initial_confirmation
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        // own process group, so a stop reaches the worker's children too
        #[cfg(unix)]
        command.process_group(0);

        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command
            .spawn()
            .map_err(|e| ProcessError::Spawn(format!("{}: {}", spec.program, e)))?;

        let pid = child.id();
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward(stderr, tx));
        }
        let stdin = child.stdin.take();

        info!(pid = ?pid, program = %spec.program, "Spawned worker on pipes");

        let exited = Arc::new(AtomicBool::new(false));
        Ok(Box::new(PipeHandle {
            child,
            stdin,
            output: rx,
            terminator: Arc::new(PidTerminator {
                pid,
                exited: Arc::clone(&exited),
            }),
            exited,
            exit_code: None,
        }))
    }
}

struct PipeHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    output: mpsc::Receiver<Vec<u8>>,
    terminator: Arc<PidTerminator>,
    exited: Arc<AtomicBool>,
    exit_code: Option<i32>,
}

#[async_trait]
impl ProcessHandle for PipeHandle {
    fn pid(&self) -> Option<u32> {
        self.terminator.pid
    }

    fn terminator(&self) -> Arc<dyn ProcessTerminator> {
        self.terminator.clone()
    }

    async fn read(&mut self, wait: Duration) -> Result<ReadOutcome, ProcessError> {
        match timeout(wait, self.output.recv()).await {
            Ok(Some(bytes)) => Ok(ReadOutcome::Data(bytes)),
            // both pipe forwarders finished
            Ok(None) => Ok(ReadOutcome::Eof),
            Err(_) => Ok(ReadOutcome::Idle),
        }
    }

    async fn write_line(&mut self) -> Result<(), ProcessError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ProcessError::Io("stdin is closed".to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| ProcessError::Io(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| ProcessError::Io(e.to_string()))
    }

    async fn wait(&mut self) -> Result<i32, ProcessError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        // closing stdin lets workers that read to EOF finish
        self.stdin.take();
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ProcessError::Io(e.to_string()))?;
        self.exited.store(true, Ordering::SeqCst);

        let code = status.code().unwrap_or(-1);
        debug!(pid = ?self.terminator.pid, exit_code = code, "Worker exited");
        self.exit_code = Some(code);
        Ok(code)
    }
}

/// Kills by pid; a no-op once the process has been reaped
pub(crate) struct PidTerminator {
    pub(crate) pid: Option<u32>,
    pub(crate) exited: Arc<AtomicBool>,
}

impl ProcessTerminator for PidTerminator {
    fn terminate(&self) -> Result<(), ProcessError> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            info!(pid, "Sending SIGTERM to worker process group");
            match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(ProcessError::Termination(format!("SIGTERM failed: {e}"))),
            }
        }

        #[cfg(windows)]
        {
            info!(pid, "Killing worker process tree");
            let output = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .output()
                .map_err(|e| ProcessError::Termination(e.to_string()))?;
            if !output.status.success() {
                return Err(ProcessError::Termination(format!(
                    "taskkill failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            Ok(())
        }
    }
}
