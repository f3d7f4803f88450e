use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::local::executor::JobExecutor;
use crate::local::table::JobTable;
use crate::queue::Device;

/// How long a worker blocks on an empty queue before re-checking shutdown.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// A directory waiting for a worker.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub dir: PathBuf,
    pub command: String,
}

/// Receiving end of the pending queue, shared by every worker.
pub type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<PendingJob>>>;

enum Next {
    Job(PendingJob),
    Idle,
    Closed,
}

/// One worker bound to one device.
///
/// The device is held for the whole run of a job and implicitly returned
/// when the worker goes back to the queue, so the number of workers caps
/// the number of concurrent jobs.
pub struct Worker {
    pub device: Device,
    pub pending: SharedReceiver,
    pub table: Arc<RwLock<JobTable>>,
    pub executor: JobExecutor,
    pub token: CancellationToken,
}

impl Worker {
    pub async fn run(self) {
        tracing::debug!(device = %self.device, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = self.next_job() => next,
            };

            let job = match next {
                Next::Job(job) => job,
                Next::Idle => continue,
                Next::Closed => break,
            };

            if !self.table.write().await.mark_running(&job.dir, self.device) {
                tracing::debug!(dir = %job.dir.display(), "Skipping job that is no longer queued");
                continue;
            }

            match self.device {
                Device::Cpu => tracing::info!(dir = %job.dir.display(), "Running"),
                device => tracing::info!(dir = %job.dir.display(), %device, "Running on device"),
            }

            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    tracing::warn!(dir = %job.dir.display(), "Abandoning in-flight job on shutdown");
                    break;
                }
                result = self.executor.execute(&job.dir, &job.command, self.device) => result,
            };

            if let Some(output) = &result.output {
                tracing::debug!(dir = %job.dir.display(), output = %output, "Job output");
            }
            match &result.error {
                None => tracing::info!(dir = %job.dir.display(), "Completed"),
                Some(error) => tracing::error!(
                    dir = %job.dir.display(),
                    exit_code = ?result.exit_code,
                    error = %error,
                    "Error in job"
                ),
            }

            self.table
                .write()
                .await
                .mark_completed(&job.dir, result.outcome);
        }

        tracing::info!(device = %self.device, "Shutting down worker");
    }

    async fn next_job(&self) -> Next {
        let mut pending = self.pending.lock().await;
        match tokio::time::timeout(POLL_TIMEOUT, pending.recv()).await {
            Ok(Some(job)) => Next::Job(job),
            Ok(None) => Next::Closed,
            Err(_) => Next::Idle,
        }
    }
}
