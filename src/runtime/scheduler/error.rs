//! Recoverable errors of the job system.
//!
//! Contract violations (a hook reporting `NotStarted`, a job restarting or
//! waiting on itself) are not represented here: they panic.

use super::job::JobId;

/// Errors surfaced by the manager and by job lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum JobsError {
    /// An OS thread could not be created.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The calling thread already belongs to a live manager.
    #[error("a job manager is already registered on this thread")]
    AlreadyRegistered,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `reset_job` refuses to leave the error state.
    #[error("{0} is in the error state and cannot be reset")]
    ResetFromError(JobId),

    /// The job never stopped running (its manager shut down first).
    #[error("{0} is still running")]
    StillRunning(JobId),
}

pub type Result<T> = std::result::Result<T, JobsError>;
