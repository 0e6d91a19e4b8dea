// Process Backend Port
// One capability interface over the two platform primitives (plain pipes, pseudo-terminal)

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Everything needed to launch one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

/// Result of one bounded read from the combined output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Raw bytes, not necessarily line aligned
    Data(Vec<u8>),
    /// Nothing arrived within the wait
    Idle,
    /// Output stream closed
    Eof,
}

/// Process errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("Termination failed: {0}")]
    Termination(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Process backend trait
///
/// Implementations:
/// - PipeBackend: stdin/stdout/stderr pipes
/// - PtyBackend: pseudo-terminal, for workers that only prompt on a tty
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the worker expects one line terminator right after spawn
    fn confirms_on_spawn(&self) -> bool;

    /// Launch a process
    ///
    /// # Errors
    /// - ProcessError::Spawn if the executable or interpreter cannot be launched
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>, ProcessError>;
}

/// A live worker process
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Termination capability, usable while another task is reading
    fn terminator(&self) -> Arc<dyn ProcessTerminator>;

    /// Wait at most `wait` for output
    async fn read(&mut self, wait: Duration) -> Result<ReadOutcome, ProcessError>;

    /// Send one line terminator to the process input
    async fn write_line(&mut self) -> Result<(), ProcessError>;

    /// Wait for exit and return the exit code (-1 when killed by a signal)
    async fn wait(&mut self) -> Result<i32, ProcessError>;
}

/// Non-graceful termination of a process
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self) -> Result<(), ProcessError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    pub const MOCK_PID: u32 = 4242;

    enum MockEvent {
        Output(Vec<u8>),
        Exit(i32),
    }

    /// Test-side view of one spawned mock process
    pub struct MockProcess {
        spec: SpawnSpec,
        tx: mpsc::UnboundedSender<MockEvent>,
        terminated: AtomicBool,
        lines_written: AtomicUsize,
        terminate_exit_code: i32,
    }

    impl MockProcess {
        pub fn spec(&self) -> &SpawnSpec {
            &self.spec
        }

        /// Last positional argument (the descriptor path)
        pub fn descriptor(&self) -> Option<&str> {
            self.spec.args.last().map(String::as_str)
        }

        /// Write raw text to the combined output stream
        pub fn emit(&self, text: &str) {
            let _ = self.tx.send(MockEvent::Output(text.as_bytes().to_vec()));
        }

        /// Close output and exit with `code`
        pub fn exit(&self, code: i32) {
            let _ = self.tx.send(MockEvent::Exit(code));
        }

        pub fn was_terminated(&self) -> bool {
            self.terminated.load(Ordering::SeqCst)
        }

        pub fn lines_written(&self) -> usize {
            self.lines_written.load(Ordering::SeqCst)
        }
    }

    /// Scripted output applied to every spawn
    #[derive(Debug, Clone)]
    struct MockScript {
        output: Vec<String>,
        exit_code: i32,
    }

    /// Mock process backend
    ///
    /// By default processes stay alive until the test calls `exit` or the
    /// supervisor terminates them.
    pub struct MockBackend {
        confirms_on_spawn: bool,
        terminate_exit_code: i32,
        script: Option<MockScript>,
        spawn_failures: Mutex<HashSet<String>>,
        processes: Mutex<Vec<Arc<MockProcess>>>,
    }

    impl Default for MockBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self {
                confirms_on_spawn: false,
                terminate_exit_code: -1,
                script: None,
                spawn_failures: Mutex::new(HashSet::new()),
                processes: Mutex::new(Vec::new()),
            }
        }

        /// Every process writes `output` (verbatim chunks) and then exits with `exit_code`
        pub fn scripted(output: &[&str], exit_code: i32) -> Self {
            Self {
                script: Some(MockScript {
                    output: output.iter().map(|s| s.to_string()).collect(),
                    exit_code,
                }),
                ..Self::new()
            }
        }

        pub fn with_initial_confirmation(mut self) -> Self {
            self.confirms_on_spawn = true;
            self
        }

        /// Exit code reported after termination (a worker that traps the signal)
        pub fn with_terminate_exit_code(mut self, code: i32) -> Self {
            self.terminate_exit_code = code;
            self
        }

        pub fn fail_spawn_for(&self, descriptor: &Path) {
            self.spawn_failures
                .lock()
                .unwrap()
                .insert(descriptor.to_string_lossy().into_owned());
        }

        pub fn processes(&self) -> Vec<Arc<MockProcess>> {
            self.processes.lock().unwrap().clone()
        }

        pub fn spawn_count(&self) -> usize {
            self.processes.lock().unwrap().len()
        }

        /// Most recent process spawned for `descriptor`
        pub fn latest_for(&self, descriptor: &Path) -> Option<Arc<MockProcess>> {
            let wanted = descriptor.to_string_lossy();
            self.processes
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|p| p.descriptor() == Some(wanted.as_ref()))
                .cloned()
        }
    }

    #[async_trait]
    impl ProcessBackend for MockBackend {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn confirms_on_spawn(&self) -> bool {
            self.confirms_on_spawn
        }

        async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
            if let Some(descriptor) = spec.args.last() {
                if self.spawn_failures.lock().unwrap().contains(descriptor) {
                    return Err(ProcessError::Spawn(format!(
                        "No such file or directory: {}",
                        spec.program
                    )));
                }
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let process = Arc::new(MockProcess {
                spec: spec.clone(),
                tx,
                terminated: AtomicBool::new(false),
                lines_written: AtomicUsize::new(0),
                terminate_exit_code: self.terminate_exit_code,
            });

            if let Some(script) = &self.script {
                for chunk in &script.output {
                    process.emit(chunk);
                }
                process.exit(script.exit_code);
            }

            self.processes.lock().unwrap().push(Arc::clone(&process));
            Ok(Box::new(MockHandle {
                process,
                rx,
                exit: None,
            }))
        }
    }

    struct MockHandle {
        process: Arc<MockProcess>,
        rx: mpsc::UnboundedReceiver<MockEvent>,
        exit: Option<i32>,
    }

    #[async_trait]
    impl ProcessHandle for MockHandle {
        fn pid(&self) -> Option<u32> {
            Some(MOCK_PID)
        }

        fn terminator(&self) -> Arc<dyn ProcessTerminator> {
            Arc::new(MockTerminator {
                process: Arc::clone(&self.process),
            })
        }

        async fn read(&mut self, wait: Duration) -> Result<ReadOutcome, ProcessError> {
            if self.exit.is_some() {
                return Ok(ReadOutcome::Eof);
            }
            match tokio::time::timeout(wait, self.rx.recv()).await {
                Ok(Some(MockEvent::Output(bytes))) => Ok(ReadOutcome::Data(bytes)),
                Ok(Some(MockEvent::Exit(code))) => {
                    self.exit = Some(code);
                    Ok(ReadOutcome::Eof)
                }
                Ok(None) => {
                    self.exit = Some(-1);
                    Ok(ReadOutcome::Eof)
                }
                Err(_) => Ok(ReadOutcome::Idle),
            }
        }

        async fn write_line(&mut self) -> Result<(), ProcessError> {
            self.process.lines_written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&mut self) -> Result<i32, ProcessError> {
            if let Some(code) = self.exit {
                return Ok(code);
            }
            while let Some(event) = self.rx.recv().await {
                if let MockEvent::Exit(code) = event {
                    self.exit = Some(code);
                    return Ok(code);
                }
            }
            Ok(-1)
        }
    }

    struct MockTerminator {
        process: Arc<MockProcess>,
    }

    impl ProcessTerminator for MockTerminator {
        fn terminate(&self) -> Result<(), ProcessError> {
            self.process.terminated.store(true, Ordering::SeqCst);
            self.process.exit(self.process.terminate_exit_code);
            Ok(())
        }
    }
}
