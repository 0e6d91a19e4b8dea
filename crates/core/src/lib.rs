// jobwatch Core - Domain Logic & Ports
// NO process or filesystem dependencies: adapters live in infra-system

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
