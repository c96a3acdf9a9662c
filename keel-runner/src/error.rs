//! Error types for the agent
//!
//! Two layers:
//! - [`BackendError`] is what a container backend call can fail with.
//! - [`BuildError`] is what a build stage can fail with; it maps onto the
//!   terminal [`RunResult`] of a run.

use keel_core::domain::job::{FailureKind, RunResult};
use thiserror::Error;

use crate::signal::Interrupt;

/// Errors reported by the container backend client
#[derive(Debug, Error)]
pub enum BackendError {
    /// Container or network does not exist
    #[error("No such object: {0}")]
    NoSuchObject(String),

    /// Image or tag does not exist locally or in the repository
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// The backend refused the request as malformed (e.g. invalid reference format)
    #[error("Request rejected by backend: {0}")]
    Rejected(String),

    /// Daemon or network unavailable; the caller may retry
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The call was abandoned because the run was interrupted
    #[error("{0}")]
    Interrupted(Interrupt),
}

impl BackendError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoSuchObject(_) | Self::ImageNotFound(_))
    }
}

impl From<Interrupt> for BackendError {
    fn from(interrupt: Interrupt) -> Self {
        Self::Interrupted(interrupt)
    }
}

/// Errors that end a build stage
#[derive(Debug, Error)]
pub enum BuildError {
    /// Allow-list violation, malformed reference, missing field
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    ImageNotFound(String),

    #[error("{0}")]
    Backend(String),

    #[error("exit code {0}")]
    ScriptFailure(i64),

    #[error("{0}")]
    Interrupted(Interrupt),
}

impl BuildError {
    /// Converts the error into the terminal result of a run
    pub fn into_run_result(self) -> RunResult {
        match self {
            BuildError::Config(msg) => RunResult::failed(FailureKind::Configuration, msg),
            BuildError::ImageNotFound(msg) => RunResult::failed(FailureKind::Content, msg),
            BuildError::Backend(msg) => RunResult::failed(FailureKind::Backend, msg),
            BuildError::ScriptFailure(code) => {
                RunResult::failed(FailureKind::Script, format!("exit code {}", code))
            }
            BuildError::Interrupted(Interrupt::Canceled) => RunResult::cancelled(),
            BuildError::Interrupted(Interrupt::TimedOut) => RunResult::timed_out(),
        }
    }
}

impl From<BackendError> for BuildError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ImageNotFound(msg) => BuildError::ImageNotFound(msg),
            BackendError::Rejected(msg) => BuildError::Config(msg),
            BackendError::Interrupted(interrupt) => BuildError::Interrupted(interrupt),
            other => BuildError::Backend(other.to_string()),
        }
    }
}

impl From<Interrupt> for BuildError {
    fn from(interrupt: Interrupt) -> Self {
        BuildError::Interrupted(interrupt)
    }
}

/// Result type alias for build stages
pub type Result<T> = std::result::Result<T, BuildError>;
