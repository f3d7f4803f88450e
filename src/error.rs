use std::path::PathBuf;

use thiserror::Error;

/// Resource dimension a backend may or may not know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Cpu,
    Gpu,
    Memory,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Cpu => write!(f, "ncpu"),
            Resource::Gpu => write!(f, "ngpu"),
            Resource::Memory => write!(f, "memory"),
        }
    }
}

/// Coarse classification of a [`QueueError`], so callers can react to the
/// category without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input handed to `submit` (or a call the queue can no longer honor).
    InvalidInput,
    /// The backend configuration itself is wrong or incomplete.
    Misconfigured,
    /// A scheduler executable could not be found on the search path.
    Discovery,
    /// The scheduler status command kept failing after every retry.
    TransientScheduler,
    /// The scheduler refused a submission.
    Submission,
    /// The scheduler cancel command failed.
    Cancellation,
    /// The backend has no notion of the requested resource.
    Unsupported,
    Io,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Submit: directory {} does not exist", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("Run script {} does not exist", .0.display())]
    RunScriptMissing(PathBuf),

    #[error("Run script {} does not have execution permissions", .0.display())]
    RunScriptNotExecutable(PathBuf),

    #[error("Got {commands} commands for {dirs} directories")]
    CommandCountMismatch { dirs: usize, commands: usize },

    #[error("Queue has been stopped and accepts no more work")]
    Stopped,

    #[error("Cannot change {0} after the queue has started its workers")]
    AlreadyStarted(Resource),

    #[error("The {0} needs to be defined")]
    MissingConfig(&'static str),

    #[error("Parameters {0} and {1} are mutually exclusive")]
    ConflictingOptions(&'static str, &'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Could not determine which devices to use: {0}")]
    NoDevices(String),

    #[error("Could not find required executable [{name}]")]
    ExecutableNotFound {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("Status query `{command}` failed after {attempts} attempts: {message}")]
    StatusQuery {
        command: String,
        attempts: u32,
        message: String,
    },

    #[error("Submission `{command}` failed: {message}")]
    Submit { command: String, message: String },

    #[error("Cancellation `{command}` failed: {message}")]
    Cancel { command: String, message: String },

    #[error("{backend} queues do not support {resource}")]
    Unsupported {
        backend: &'static str,
        resource: Resource,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::DirectoryNotFound(_)
            | QueueError::RunScriptMissing(_)
            | QueueError::RunScriptNotExecutable(_)
            | QueueError::CommandCountMismatch { .. }
            | QueueError::Stopped
            | QueueError::AlreadyStarted(_) => ErrorKind::InvalidInput,
            QueueError::MissingConfig(_)
            | QueueError::ConflictingOptions(..)
            | QueueError::InvalidConfig(_)
            | QueueError::NoDevices(_) => ErrorKind::Misconfigured,
            QueueError::ExecutableNotFound { .. } => ErrorKind::Discovery,
            QueueError::StatusQuery { .. } => ErrorKind::TransientScheduler,
            QueueError::Submit { .. } => ErrorKind::Submission,
            QueueError::Cancel { .. } => ErrorKind::Cancellation,
            QueueError::Unsupported { .. } => ErrorKind::Unsupported,
            QueueError::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
