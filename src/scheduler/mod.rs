//! Queues backed by an external batch scheduler.
//!
//! Concurrency belongs to the scheduler; these queues only translate
//! submit / inprogress / stop into command lines and parse what comes back.
//!
//! # Components
//!
//! - [`SchedulerQueue`]: the [`JobQueue`] implementation shared by every scheduler
//! - [`SchedulerDialect`]: directives, command lines and output parsing of one scheduler
//! - [`CommandRunner`]: how command lines are executed ([`SystemRunner`] by default)
//! - [`lsf`], [`sge`], [`pbs`]: the supported dialects
//!
//! # Completion
//!
//! Schedulers do not push completions. [`JobQueue::retrieve`] reports
//! directories whose sentinel appeared since the previous call, with an
//! unknown outcome.

pub mod lsf;
pub mod pbs;
pub mod runner;
pub mod sge;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::Instrument;

use crate::config::{RetryPolicy, SchedulerConfig};
use crate::error::{QueueError, Result};
use crate::queue::registry::{clear_sentinel, resolve_commands, resolve_dirs};
use crate::queue::{CompletedJob, DirectoryRegistry, JobQueue};
use crate::script::JobScript;

pub use lsf::Lsf;
pub use pbs::Pbs;
pub use runner::{Binaries, CommandOutput, CommandRunner, Executables, Invocation, SystemRunner};
pub use sge::Sge;

pub type LsfQueue = SchedulerQueue<Lsf>;
pub type SgeQueue = SchedulerQueue<Sge>;
pub type PbsQueue = SchedulerQueue<Pbs>;

/// What a dialect needs to build status and cancel command lines.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub binaries: &'a Binaries,
    pub config: &'a SchedulerConfig,
    pub jobname: &'a str,
    pub user: &'a str,
    /// Ids returned by the submit command, for schedulers that print them
    pub job_ids: &'a [String],
}

/// The scheduler-specific half of a [`SchedulerQueue`].
pub trait SchedulerDialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn executables(&self) -> Executables;

    /// Whether submit and status queries need at least one queue name.
    fn requires_queue(&self) -> bool {
        true
    }

    /// Directive lines written after the interpreter line of the job script.
    fn directives(&self, config: &SchedulerConfig, jobname: &str, workdir: &Path) -> Vec<String>;

    fn submit(&self, binaries: &Binaries, jobscript: &Path) -> Invocation;

    /// Job id printed by the submit command, if this scheduler tracks them.
    fn job_id(&self, _stdout: &str) -> Option<String> {
        None
    }

    /// One status query per queue searched.
    fn status(&self, ctx: &QueryContext<'_>) -> Vec<Invocation>;

    /// Queued and running jobs listed in the output of one status query.
    fn count(&self, stdout: &str, jobname: &str) -> usize;

    fn cancel(&self, ctx: &QueryContext<'_>) -> Vec<Invocation>;
}

/// Number of result lines after `header_lines` of table header.
pub fn count_result_lines(stdout: &str, header_lines: usize) -> usize {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count()
        .saturating_sub(header_lines)
}

/// `H:MM:SS`
pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Directory basename plus a random five-digit suffix.
pub fn auto_jobname(dir: &Path) -> String {
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "job".to_string());
    let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("{}_{:05}", base, suffix)
}

/// Login name of the user running this process.
pub fn current_user() -> Result<String> {
    let uid = nix::unistd::getuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.name),
        _ => std::env::var("USER").map_err(|_| {
            QueueError::InvalidConfig(format!("could not determine the user name of uid {}", uid))
        }),
    }
}

/// A [`JobQueue`] driving an external scheduler through its executables.
pub struct SchedulerQueue<D> {
    dialect: D,
    config: SchedulerConfig,
    binaries: Binaries,
    runner: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
    user: String,
    jobname: Mutex<Option<String>>,
    job_ids: Mutex<Vec<String>>,
    registry: DirectoryRegistry,
    span: tracing::Span,
}

impl<D: SchedulerDialect> SchedulerQueue<D> {
    /// Locate the scheduler executables on `PATH`, failing if any is missing.
    pub fn new(dialect: D, config: SchedulerConfig) -> Result<Self> {
        let binaries = Binaries::discover(&dialect.executables())?;
        Self::with_runner(dialect, config, binaries, Arc::new(SystemRunner))
    }

    pub fn with_runner(
        dialect: D,
        config: SchedulerConfig,
        binaries: Binaries,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let user = current_user()?;
        let span = tracing::info_span!("queue", backend = dialect.name());
        Ok(Self {
            jobname: Mutex::new(config.jobname.clone()),
            dialect,
            config,
            binaries,
            runner,
            retry: RetryPolicy::default(),
            user,
            job_ids: Mutex::new(Vec::new()),
            registry: DirectoryRegistry::new(),
            span,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Job name used for status and cancel queries, once known.
    pub fn jobname(&self) -> Option<String> {
        lock(&self.jobname).clone()
    }

    pub fn job_ids(&self) -> Vec<String> {
        lock(&self.job_ids).clone()
    }

    /// Track jobs submitted elsewhere so `stop` cancels them by id.
    pub fn adopt_job_ids(&self, ids: impl IntoIterator<Item = String>) {
        lock(&self.job_ids).extend(ids);
    }

    fn ensure_jobname(&self, dir: &Path) -> String {
        lock(&self.jobname)
            .get_or_insert_with(|| {
                let name = auto_jobname(dir);
                tracing::info!(jobname = %name, "Generated job name");
                name
            })
            .clone()
    }

    fn check_queue(&self) -> Result<()> {
        if self.dialect.requires_queue() && self.config.queues.is_empty() {
            return Err(QueueError::MissingConfig("queue"));
        }
        Ok(())
    }

    async fn submit_all(&self, dirs: &[PathBuf], commands: Option<&[String]>) -> Result<()> {
        self.check_queue()?;
        let dirs = resolve_dirs(dirs)?;
        let commands = resolve_commands(&dirs, commands, &self.config.script.runscript)?;

        for (dir, command) in dirs.iter().zip(&commands) {
            tracing::info!(dir = %dir.display(), "Queueing");
            let jobname = self.ensure_jobname(dir);
            clear_sentinel(dir);

            let jobscript = dir.join(&self.config.script.jobscript);
            JobScript::from_config(dir, command, &self.config.script)
                .with_directives(self.dialect.directives(&self.config, &jobname, dir))
                .with_prerun(self.config.prerun.clone())
                .write(&jobscript)?;

            let invocation = self.dialect.submit(&self.binaries, &jobscript);
            let output = self
                .runner
                .run(&invocation)
                .await
                .map_err(|e| QueueError::Submit {
                    command: invocation.to_string(),
                    message: e.to_string(),
                })?;
            if !output.success {
                tracing::error!(dir = %dir.display(), stderr = %output.stderr, "Submission failed");
                return Err(QueueError::Submit {
                    command: invocation.to_string(),
                    message: output.failure_message(),
                });
            }
            tracing::debug!(stdout = %output.stdout, "Submitted");
            if let Some(id) = self.dialect.job_id(&output.stdout) {
                tracing::info!(job_id = %id, "Job id");
                lock(&self.job_ids).push(id);
            }
            self.registry.register(std::slice::from_ref(dir));
        }
        Ok(())
    }

    /// Run a status query, retrying failures with a fixed delay.
    async fn query_with_retry(&self, invocation: &Invocation) -> Result<String> {
        let mut attempt = 1;
        loop {
            let message = match self.runner.run(invocation).await {
                Ok(output) if output.success => {
                    tracing::debug!(stdout = %output.stdout, "Status query");
                    return Ok(output.stdout);
                }
                Ok(output) => output.failure_message(),
                Err(e) => e.to_string(),
            };
            if attempt >= self.retry.attempts {
                return Err(QueueError::StatusQuery {
                    command: invocation.to_string(),
                    attempts: attempt,
                    message,
                });
            }
            tracing::warn!(attempt, error = %message, "Status query failed, retrying");
            tokio::time::sleep(self.retry.delay).await;
            attempt += 1;
        }
    }

    async fn count_in_progress(&self) -> Result<usize> {
        let Some(jobname) = self.jobname() else {
            tracing::debug!("Nothing submitted yet");
            return Ok(0);
        };
        self.check_queue()?;
        let job_ids = self.job_ids();
        let ctx = QueryContext {
            binaries: &self.binaries,
            config: &self.config,
            jobname: &jobname,
            user: &self.user,
            job_ids: &job_ids,
        };
        let mut total = 0;
        for invocation in self.dialect.status(&ctx) {
            let stdout = self.query_with_retry(&invocation).await?;
            total += self.dialect.count(&stdout, &jobname);
        }
        Ok(total)
    }

    async fn cancel_all(&self) -> Result<()> {
        let Some(jobname) = self.jobname() else {
            tracing::debug!("Nothing submitted, nothing to cancel");
            return Ok(());
        };
        let job_ids = self.job_ids();
        let ctx = QueryContext {
            binaries: &self.binaries,
            config: &self.config,
            jobname: &jobname,
            user: &self.user,
            job_ids: &job_ids,
        };
        for invocation in self.dialect.cancel(&ctx) {
            tracing::info!(command = %invocation, "Cancelling");
            let output = self
                .runner
                .run(&invocation)
                .await
                .map_err(|e| QueueError::Cancel {
                    command: invocation.to_string(),
                    message: e.to_string(),
                })?;
            if !output.success {
                return Err(QueueError::Cancel {
                    command: invocation.to_string(),
                    message: output.failure_message(),
                });
            }
            tracing::debug!(stdout = %output.stdout, "Cancelled");
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl<D: SchedulerDialect + 'static> JobQueue for SchedulerQueue<D> {
    fn backend(&self) -> &'static str {
        self.dialect.name()
    }

    async fn submit(&self, dirs: &[PathBuf], commands: Option<&[String]>) -> Result<()> {
        self.submit_all(dirs, commands)
            .instrument(self.span.clone())
            .await
    }

    async fn retrieve_completed(&self) -> Result<Vec<CompletedJob>> {
        Ok(self
            .registry
            .drain_finished()
            .iter()
            .map(|dir| CompletedJob::unknown(dir))
            .collect())
    }

    async fn inprogress(&self) -> Result<usize> {
        self.count_in_progress()
            .instrument(self.span.clone())
            .await
    }

    async fn stop(&self) -> Result<()> {
        self.cancel_all().instrument(self.span.clone()).await
    }

    fn registry(&self) -> &DirectoryRegistry {
        &self.registry
    }

    fn ncpu(&self) -> Result<u32> {
        Ok(self.config.ncpu)
    }

    fn set_ncpu(&mut self, ncpu: u32) -> Result<()> {
        self.config.ncpu = ncpu;
        Ok(())
    }

    fn ngpu(&self) -> Result<u32> {
        Ok(self.config.ngpu)
    }

    fn set_ngpu(&mut self, ngpu: u32) -> Result<()> {
        self.config.ngpu = ngpu;
        Ok(())
    }

    fn memory(&self) -> Result<u64> {
        Ok(self.config.memory)
    }

    fn set_memory(&mut self, memory: u64) -> Result<()> {
        self.config.memory = memory;
        Ok(())
    }
}
