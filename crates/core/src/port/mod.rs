// Port Layer - Interfaces for external dependencies

pub mod descriptor_store;
pub mod process;
pub mod time_provider;

// Re-exports
pub use descriptor_store::{DescriptorError, DescriptorStore};
pub use process::{
    ProcessBackend, ProcessError, ProcessHandle, ProcessTerminator, ReadOutcome, SpawnSpec,
};
pub use time_provider::TimeProvider;
