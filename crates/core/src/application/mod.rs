// Application Layer - Use Cases and Business Logic

pub mod admission;
pub mod constants;
pub mod controller;
pub mod output;
pub mod registry;
pub mod signal;
pub mod supervisor;
pub mod watcher;

// Re-exports
pub use admission::{Admission, AdmissionManager, QueuedJob};
pub use controller::WorkerCommand;
pub use output::{FilterConfig, LineAssembler, LineDecision, LineFilter};
pub use registry::JobRegistry;
pub use signal::{stop_channel, StopSender, StopToken};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use watcher::{DirectoryWatcher, WatchController, WatcherConfig};
