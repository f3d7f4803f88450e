//! The contract every backend implements.
//!
//! A caller configures one concrete queue, calls [`JobQueue::submit`] one or
//! more times, then either polls [`JobQueue::inprogress`] /
//! [`JobQueue::retrieve`] itself or blocks in [`JobQueue::wait`].
//!
//! # Components
//!
//! - [`JobQueue`]: submit / retrieve / inprogress / stop plus resource accessors
//! - [`registry`]: sentinel files and the registry of submitted directories
//! - [`wait`]: the poll loop shared by every backend
//! - [`job`]: job, state and outcome types

pub mod job;
pub mod registry;
pub mod wait;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::WaitOptions;
use crate::error::Result;

pub use job::{CompletedJob, Device, Job, JobStatus, QueueState, RunOutcome};
pub use registry::{DirectoryRegistry, SENTINEL};

/// Callback receiving the number of unfinished jobs during [`JobQueue::wait`].
pub type ReportFn<'a> = dyn FnMut(usize) + Send + 'a;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Queue every directory for execution.
    ///
    /// Each directory must exist and, unless `commands` overrides it, contain
    /// an executable run script. All checks happen before anything is
    /// queued. Stale completion sentinels are removed.
    async fn submit(&self, dirs: &[PathBuf], commands: Option<&[String]>) -> Result<()>;

    /// Drain the jobs that finished since the previous call, with outcome.
    async fn retrieve_completed(&self) -> Result<Vec<CompletedJob>>;

    /// Drain the directories that finished since the previous call.
    ///
    /// A directory being returned here says nothing about whether its run
    /// succeeded; use [`JobQueue::retrieve_completed`] for that.
    async fn retrieve(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .retrieve_completed()
            .await?
            .into_iter()
            .map(|job| job.dir)
            .collect())
    }

    /// Number of directories still queued or running.
    async fn inprogress(&self) -> Result<usize>;

    /// Best-effort cancellation of everything this queue submitted.
    ///
    /// A local queue abandons its in-flight runs: they keep running to
    /// completion but stay `Running` in the queue, and directories still
    /// queued are never started. Neither is ever counted as finished.
    async fn stop(&self) -> Result<()>;

    /// Whether `stop` has ended this queue's own execution of its work, so
    /// the remaining count can no longer reach zero.
    fn is_stopped(&self) -> bool {
        false
    }

    /// Every directory ever submitted through this queue.
    fn registry(&self) -> &DirectoryRegistry;

    /// Submitted directories without a completion sentinel.
    fn not_completed(&self) -> usize {
        self.registry().not_completed()
    }

    /// Block until no work remains, returning everything drained meanwhile.
    ///
    /// Also returns, after a final drain, once the queue is stopped with work
    /// left; [`JobQueue::not_completed`] tells what never finished.
    async fn wait(
        &self,
        opts: &WaitOptions,
        report: Option<&mut ReportFn<'_>>,
    ) -> Result<Vec<CompletedJob>> {
        wait::wait_until_idle(self, opts, report).await
    }

    fn ncpu(&self) -> Result<u32>;
    fn set_ncpu(&mut self, ncpu: u32) -> Result<()>;
    fn ngpu(&self) -> Result<u32>;
    fn set_ngpu(&mut self, ngpu: u32) -> Result<()>;
    /// Memory per job in MiB.
    fn memory(&self) -> Result<u64>;
    fn set_memory(&mut self, memory: u64) -> Result<()>;
}
