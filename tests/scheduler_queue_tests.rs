
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobqueues::scheduler::{
    Binaries, CommandOutput, CommandRunner, Invocation, Lsf, Pbs, SchedulerDialect, Sge,
};
use jobqueues::{
    ErrorKind, JobQueue, QueueError, RetryPolicy, RunOutcome, SchedulerConfig, SchedulerQueue,
    WaitOptions,
};
use test_harness::{is_done, touch_sentinel, JobDirs};

/// Replays canned outputs and records every invocation.
#[derive(Default)]
struct ScriptedRunner {
    responses: Mutex<VecDeque<std::io::Result<CommandOutput>>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, response: CommandOutput) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    fn push_io_error(&self) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(std::io::Error::other("connection reset")));
    }

    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::ok("")))
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(10),
    }
}

fn queue_with<D: SchedulerDialect>(
    dialect: D,
    config: SchedulerConfig,
    runner: &Arc<ScriptedRunner>,
) -> SchedulerQueue<D> {
    let binaries = Binaries::unresolved(&dialect.executables());
    SchedulerQueue::with_runner(dialect, config, binaries, runner.clone())
        .unwrap()
        .with_retry(fast_retry())
}

fn lsf_queue(runner: &Arc<ScriptedRunner>) -> SchedulerQueue<Lsf> {
    queue_with(
        Lsf,
        SchedulerConfig::lsf()
            .with_queue("gpu_queue")
            .with_jobname("sim"),
        runner,
    )
}

#[tokio::test]
async fn test_status_query_retries_then_counts() {
    let runner = ScriptedRunner::new();
    let queue = lsf_queue(&runner);
    runner.push(CommandOutput::failed(255, "LSF is down"));
    runner.push_io_error();
    runner.push(CommandOutput::ok(
        "JOBID USER STAT QUEUE\n101 alice RUN gpu_queue\n102 alice PEND gpu_queue\n",
    ));

    assert_eq!(queue.inprogress().await.unwrap(), 2);
    let calls = runner.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c == &calls[0]));
    assert_eq!(calls[0].args[..2], ["-J".to_string(), "sim".to_string()]);
}

#[tokio::test]
async fn test_status_query_gives_up_after_three_attempts() {
    let runner = ScriptedRunner::new();
    let queue = lsf_queue(&runner);
    for _ in 0..3 {
        runner.push(CommandOutput::failed(255, "LSF is down"));
    }

    let err = queue.inprogress().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransientScheduler);
    assert!(matches!(err, QueueError::StatusQuery { attempts: 3, .. }));
    assert_eq!(runner.calls().len(), 3);
}

#[tokio::test]
async fn test_status_sums_every_queue() {
    let runner = ScriptedRunner::new();
    let config = SchedulerConfig::sge()
        .with_queue("gpu.q")
        .with_queue("cpu.q")
        .with_jobname("sim");
    let queue = queue_with(Sge, config, &runner);
    let header = "job-ID prior name user state\n------------------------------\n";
    runner.push(CommandOutput::ok(format!("{}1 0.5 sim alice r\n", header)));
    runner.push(CommandOutput::ok(format!(
        "{}2 0.5 sim alice qw\n3 0.5 sim alice qw\n",
        header
    )));

    assert_eq!(queue.inprogress().await.unwrap(), 3);
    let calls = runner.calls();
    assert_eq!(calls[0].args.last().unwrap(), "gpu.q");
    assert_eq!(calls[1].args.last().unwrap(), "cpu.q");
}

#[tokio::test]
async fn test_submit_writes_script_and_invokes_scheduler() {
    let runner = ScriptedRunner::new();
    let queue = lsf_queue(&runner);
    let jobs = JobDirs::new(2, "true");

    queue.submit(&jobs.dirs, None).await.unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    for (call, dir) in calls.iter().zip(&jobs.dirs) {
        let jobscript = dir.join("job.sh");
        assert_eq!(call.program.to_str(), Some("bsub"));
        assert_eq!(call.stdin.as_deref(), Some(jobscript.as_path()));

        let text = std::fs::read_to_string(&jobscript).unwrap();
        assert!(text.starts_with("#!/bin/bash\n#\n#BSUB -J sim\n"));
        assert!(text.contains("#BSUB -q \"gpu_queue\""));
        assert!(text.contains(&format!("#BSUB -cwd {}", dir.display())));
        assert!(text.contains("trap 'touch "));
        assert!(text.contains(&dir.join("run.sh").display().to_string()));
    }
    assert_eq!(queue.registry().dirs(), jobs.dirs);
}

#[tokio::test]
async fn test_submit_clears_stale_sentinel_and_prerun_runs_first() {
    let runner = ScriptedRunner::new();
    let mut config = SchedulerConfig::lsf()
        .with_queue("gpu_queue")
        .with_jobname("sim");
    config.prerun = vec!["module load cuda".to_string()];
    let queue = queue_with(Lsf, config, &runner);
    let jobs = JobDirs::new(1, "true");
    touch_sentinel(&jobs.dirs[0]);

    queue.submit(&jobs.dirs, None).await.unwrap();

    assert!(!is_done(&jobs.dirs[0]));
    let text = std::fs::read_to_string(jobs.dirs[0].join("job.sh")).unwrap();
    let prerun = text.find("module load cuda").unwrap();
    let cd = text.find("\ncd ").unwrap();
    assert!(prerun < cd);
}

#[tokio::test]
async fn test_queue_is_required_for_lsf() {
    let runner = ScriptedRunner::new();
    let queue = queue_with(Lsf, SchedulerConfig::lsf(), &runner);
    let jobs = JobDirs::new(1, "true");

    let err = queue.submit(&jobs.dirs, None).await.unwrap_err();

    assert!(matches!(err, QueueError::MissingConfig("queue")));
    assert_eq!(err.kind(), ErrorKind::Misconfigured);
    assert!(runner.calls().is_empty());
    assert!(!jobs.dirs[0].join("job.sh").exists());
}

#[tokio::test]
async fn test_rejected_submission_is_reported() {
    let runner = ScriptedRunner::new();
    let queue = lsf_queue(&runner);
    let jobs = JobDirs::new(1, "true");
    runner.push(CommandOutput::failed(255, "Queue <gpu_queue> does not exist"));

    let err = queue.submit(&jobs.dirs, None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Submission);
    assert!(err.to_string().contains("does not exist"));
    assert!(queue.registry().is_empty());
}

#[tokio::test]
async fn test_missing_run_script_fails_before_any_submission() {
    let runner = ScriptedRunner::new();
    let queue = lsf_queue(&runner);
    let jobs = JobDirs::new(1, "true");
    let bare = jobs.empty_dir("bare");

    let err = queue
        .submit(&[jobs.dirs[0].clone(), bare], None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_job_name_generated_from_first_directory() {
    let runner = ScriptedRunner::new();
    let queue = queue_with(Lsf, SchedulerConfig::lsf().with_queue("gpu_queue"), &runner);
    let jobs = JobDirs::new(2, "true");
    assert!(queue.jobname().is_none());

    queue.submit(&jobs.dirs, None).await.unwrap();

    let jobname = queue.jobname().unwrap();
    assert!(jobname.starts_with("job0_"));
    for dir in &jobs.dirs {
        let text = std::fs::read_to_string(dir.join("job.sh")).unwrap();
        assert!(text.contains(&format!("#BSUB -J {}\n", jobname)));
    }
}

#[tokio::test]
async fn test_nothing_submitted_is_idle() {
    let runner = ScriptedRunner::new();
    let queue = queue_with(Lsf, SchedulerConfig::lsf().with_queue("gpu_queue"), &runner);

    assert_eq!(queue.inprogress().await.unwrap(), 0);
    queue.stop().await.unwrap();
    assert!(queue.retrieve().await.unwrap().is_empty());
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_stop_cancels_by_name_and_reports_failure() {
    let runner = ScriptedRunner::new();
    let queue = lsf_queue(&runner);
    queue.stop().await.unwrap();
    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program.to_str(), Some("bkill"));
    assert_eq!(calls[0].args[..2], ["-J".to_string(), "sim".to_string()]);

    runner.push(CommandOutput::failed(255, "No matching job found"));
    let err = queue.stop().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancellation);
}

#[tokio::test]
async fn test_pbs_tracks_job_ids() {
    let runner = ScriptedRunner::new();
    let queue = queue_with(Pbs, SchedulerConfig::pbs(), &runner);
    let jobs = JobDirs::new(2, "true");
    runner.push(CommandOutput::ok("101.server\n"));
    runner.push(CommandOutput::ok("102.server\n"));

    queue.submit(&jobs.dirs, None).await.unwrap();
    assert_eq!(queue.job_ids(), vec!["101.server", "102.server"]);

    let jobname = queue.jobname().unwrap();
    let listed = &jobname[..jobname.len().min(15)];
    runner.push(CommandOutput::ok(format!(
        "Job id  Name  User\n------\n101.server {} alice\n",
        listed
    )));
    assert_eq!(queue.inprogress().await.unwrap(), 1);

    queue.stop().await.unwrap();
    let cancels: Vec<String> = runner
        .calls()
        .iter()
        .filter(|c| c.program.to_str() == Some("qdel"))
        .map(|c| c.to_string())
        .collect();
    assert_eq!(cancels, vec!["qdel 101.server", "qdel 102.server"]);
}

#[tokio::test]
async fn test_retrieve_reports_finished_directories_once() {
    let runner = ScriptedRunner::new();
    let queue = lsf_queue(&runner);
    let jobs = JobDirs::new(2, "true");
    queue.submit(&jobs.dirs, None).await.unwrap();

    assert!(queue.retrieve().await.unwrap().is_empty());
    assert_eq!(queue.not_completed(), 2);

    touch_sentinel(&jobs.dirs[1]);
    let completed = queue.retrieve_completed().await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].dir, jobs.dirs[1]);
    assert_eq!(completed[0].outcome, RunOutcome::Unknown);
    assert!(queue.retrieve().await.unwrap().is_empty());
    assert_eq!(queue.not_completed(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sentinel_wait_on_scheduler_queue() {
    let runner = ScriptedRunner::new();
    let queue = lsf_queue(&runner);
    let jobs = JobDirs::new(2, "true");
    queue.submit(&jobs.dirs, None).await.unwrap();

    let dirs = jobs.dirs.clone();
    tokio::spawn(async move {
        for dir in dirs {
            tokio::time::sleep(Duration::from_millis(100)).await;
            touch_sentinel(&dir);
        }
    });

    let opts = WaitOptions::sentinel().with_poll_interval(Duration::from_millis(50));
    let completed = queue.wait(&opts, None).await.unwrap();

    assert_eq!(completed.len(), 2);
    // Sentinel mode never asks the scheduler
    assert!(runner
        .calls()
        .iter()
        .all(|c| c.program.to_str() == Some("bsub")));
}

#[tokio::test]
async fn test_resource_accessors_are_read_write() {
    let runner = ScriptedRunner::new();
    let mut queue = lsf_queue(&runner);
    assert_eq!(queue.ncpu().unwrap(), 1);
    assert_eq!(queue.ngpu().unwrap(), 1);
    assert_eq!(queue.memory().unwrap(), 4000);

    queue.set_ncpu(8).unwrap();
    queue.set_ngpu(2).unwrap();
    queue.set_memory(16000).unwrap();
    assert_eq!(queue.ncpu().unwrap(), 8);
    assert_eq!(queue.ngpu().unwrap(), 2);
    assert_eq!(queue.memory().unwrap(), 16000);
    assert_eq!(queue.backend(), "lsf");
}
