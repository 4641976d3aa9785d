//! Error types for the execution core.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds named by the execution core's error-handling design.
///
/// Implements the usual error traits via `thiserror`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load program '{path}': {source}")]
    LoadProgram { path: String, source: io::Error },

    #[error("failed to compile program '{path}': {log}")]
    CompileProgram { path: String, log: String },

    #[error("kernel not found: '{0}'")]
    KernelNotFound(String),

    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("invalid graph: {0}")]
    GraphInvalid(String),

    #[error("task '{name}' setup failed: {source}")]
    TaskSetupFailed { name: String, source: Box<Error> },

    #[error("task '{name}' process failed: {source}")]
    TaskProcessFailed { name: String, source: Box<Error> },

    #[error("transport error: {0}")]
    TransportFailed(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0}")]
    Ocl(#[from] ocl::Error),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(desc: String) -> Error {
        Error::Other(desc)
    }
}

impl<'a> From<&'a str> for Error {
    fn from(desc: &'a str) -> Error {
        Error::Other(desc.to_string())
    }
}
