//! Application error types.

use thiserror::Error;

use courier_core::TransportError;
use courier_framework::PersistenceError;

use crate::config::ConfigError;

/// Errors that end or prevent an application run.
///
/// Handler failures are not among them: those go to the error handlers and
/// the loop keeps running.
#[derive(Error, Debug)]
pub enum ApplicationError {
    /// The update source failed fatally or ran out of retries.
    #[error("Update source error: {0}")]
    Transport(#[from] TransportError),

    /// Loading or flushing persistent data failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `run` was called on an application that is running or has already
    /// run.
    #[error("Application is already running")]
    AlreadyRunning,

    /// A handler cannot be registered with this application.
    #[error("Invalid handler: {0}")]
    InvalidHandler(String),
}

/// Result type for application operations.
pub type ApplicationResult<T> = Result<T, ApplicationError>;
