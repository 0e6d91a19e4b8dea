// Domain Layer - Pure business logic and entities

pub mod descriptor;
pub mod error;
pub mod event;
pub mod job;

// Re-exports
pub use descriptor::DescriptorFlags;
pub use error::DomainError;
pub use event::JobEvent;
pub use job::{Job, JobId, JobLog, JobSnapshot, JobState, LogEntry};
