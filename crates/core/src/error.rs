// Central Error Type for the Application

use crate::domain::JobId;
use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Invalid capacity {requested}: must be between {min} and {max}")]
    InvalidCapacity {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("Job still active: {0}")]
    JobStillActive(JobId),

    #[error("Process error: {0}")]
    Process(#[from] crate::port::ProcessError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] crate::port::DescriptorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
