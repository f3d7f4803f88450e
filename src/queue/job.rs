use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a directory inside a local queue.
///
/// Transitions only go `Queued -> Running -> Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    Queued,
    Running,
    Completed,
}

impl QueueState {
    pub fn is_in_progress(self) -> bool {
        matches!(self, QueueState::Queued | QueueState::Running)
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueState::Queued => write!(f, "queued"),
            QueueState::Running => write!(f, "running"),
            QueueState::Completed => write!(f, "completed"),
        }
    }
}

/// Status vocabulary reported by external schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    Pending,
    OutOfMemory,
}

impl JobStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Pending)
    }

    pub fn describe(self) -> &'static str {
        match self {
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Timeout => "Timeout",
            JobStatus::Cancelled => "Cancelled",
            JobStatus::Pending => "Pending",
            JobStatus::OutOfMemory => "Out of memory error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// A compute slot a local worker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// GPU index, exported to the job as `CUDA_VISIBLE_DEVICES`
    Gpu(u32),
    /// Unbound CPU slot
    Cpu,
}

impl Device {
    pub fn gpu_index(self) -> Option<u32> {
        match self {
            Device::Gpu(index) => Some(index),
            Device::Cpu => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Gpu(index) => write!(f, "gpu:{}", index),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// How a finished run ended.
///
/// The queue state is `Completed` in every case; this is the only place the
/// difference between a clean exit and a failure is visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        reason: String,
    },
    /// The backend only observed the completion sentinel.
    Unknown,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

/// One submitted directory and its run command.
#[derive(Debug, Clone)]
pub struct Job {
    /// Absolute job directory. This is the job key.
    pub dir: PathBuf,
    /// Command the job script invokes (the run script path by default)
    pub command: String,
    pub state: QueueState,
    pub device: Option<Device>,
    pub outcome: Option<RunOutcome>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(dir: PathBuf, command: String) -> Self {
        Self {
            dir,
            command,
            state: QueueState::Queued,
            device: None,
            outcome: None,
            submitted_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// A directory drained from a queue by `retrieve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedJob {
    pub dir: PathBuf,
    pub outcome: RunOutcome,
    pub finished_at: DateTime<Utc>,
}

impl CompletedJob {
    pub fn unknown(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            outcome: RunOutcome::Unknown,
            finished_at: Utc::now(),
        }
    }
}
