pub mod config;
pub mod error;
pub mod local;
pub mod queue;
pub mod scheduler;
pub mod script;
pub mod shutdown;

pub use config::{
    LocalCpuConfig, LocalGpuConfig, RetryPolicy, SchedulerConfig, ScriptConfig, WaitOptions,
};
pub use error::{ErrorKind, QueueError, Result};
pub use local::LocalQueue;
pub use queue::{CompletedJob, Device, JobQueue, JobStatus, QueueState, RunOutcome, SENTINEL};
pub use scheduler::{LsfQueue, PbsQueue, SchedulerQueue, SgeQueue};
