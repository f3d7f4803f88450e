use crate::config::WaitOptions;
use crate::error::Result;
use crate::queue::{CompletedJob, JobQueue, ReportFn};

/// Poll `queue` until nothing is left in progress.
///
/// Each round counts the remaining work (backend status or sentinel files),
/// reports it when due, drains completions, then sleeps. The round that sees
/// zero remaining still drains once before returning, and so does the first
/// round after the queue is stopped.
pub async fn wait_until_idle<Q: JobQueue + ?Sized>(
    queue: &Q,
    opts: &WaitOptions,
    mut report: Option<&mut ReportFn<'_>>,
) -> Result<Vec<CompletedJob>> {
    let (sleep, report_every) = opts.schedule();
    let mut drained = Vec::new();
    let mut polls = 1;

    loop {
        let remaining = if opts.use_sentinel {
            queue.not_completed()
        } else {
            queue.inprogress().await?
        };

        if let Some(every) = report_every {
            if polls >= every {
                match report.as_deref_mut() {
                    Some(callback) => callback(remaining),
                    None => tracing::info!(
                        backend = queue.backend(),
                        remaining,
                        "{} jobs are pending completion",
                        remaining
                    ),
                }
                polls = 1;
            } else {
                polls += 1;
            }
        }

        drained.extend(queue.retrieve_completed().await?);

        if remaining == 0 {
            return Ok(drained);
        }
        if queue.is_stopped() {
            tracing::warn!(
                backend = queue.backend(),
                remaining,
                "Queue stopped with {} jobs unfinished",
                remaining
            );
            return Ok(drained);
        }
        tokio::time::sleep(sleep).await;
    }
}
