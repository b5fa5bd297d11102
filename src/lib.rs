pub mod application;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod executions;
pub mod filters;
pub mod metrics;
pub mod services;
pub mod types;
pub mod worker;

// Re-export main types
pub use error::{StoreError, StoreResult};
pub use executions::ExecutionRepo;
pub use types::*;

// Re-export init API for convenience
pub use application::{initialize, Application, InitBuilder, InitOptions};
