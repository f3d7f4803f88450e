
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use jobqueues::queue::ReportFn;
use jobqueues::{
    Device, ErrorKind, JobQueue, LocalCpuConfig, LocalGpuConfig, LocalQueue, QueueError,
    QueueState, RunOutcome, ScriptConfig, WaitOptions,
};
use test_harness::{
    assert_eventually, fast_wait, is_done, max_overlap, read_timestamp, touch_sentinel,
    write_script, JobDirs,
};

fn cpu_queue(slots: u32) -> LocalQueue {
    LocalQueue::cpu(LocalCpuConfig::default().with_slots(1, slots)).unwrap()
}

/// Whether an inherited device filter would hide any of `devices`.
fn devices_visible(devices: &[u32]) -> bool {
    match std::env::var("CUDA_VISIBLE_DEVICES") {
        Err(_) => true,
        Ok(visible) => devices
            .iter()
            .all(|d| visible.split(',').any(|v| v.trim() == d.to_string())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_gpus_run_four_jobs_two_at_a_time() {
    if !devices_visible(&[0, 1]) {
        return;
    }
    let jobs = JobDirs::new(
        4,
        "date +%s%N > start\necho $CUDA_VISIBLE_DEVICES > device\nsleep 0.5\ndate +%s%N > end",
    );
    let queue = Arc::new(LocalQueue::gpu(LocalGpuConfig::default().with_ngpu(2)).unwrap());
    queue.submit(&jobs.dirs, None).await.unwrap();
    assert_eq!(queue.devices().unwrap(), &[Device::Gpu(0), Device::Gpu(1)]);

    // Sample the running count while the jobs execute
    let sampler = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut max_running = 0;
            while queue.inprogress().await.unwrap() > 0 {
                max_running = max_running.max(queue.running().await);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            max_running
        })
    };

    let completed = queue.wait(&fast_wait(), None).await.unwrap();
    assert!(jobs.all_done(), "wait returned before every sentinel existed");
    assert_eq!(completed.len(), 4);
    assert!(completed.iter().all(|c| c.outcome.is_success()));
    assert!(sampler.await.unwrap() <= 2);

    let intervals: Vec<(u128, u128)> = jobs
        .dirs
        .iter()
        .map(|d| (read_timestamp(d, "start"), read_timestamp(d, "end")))
        .collect();
    assert!(max_overlap(&intervals) <= 2);

    for dir in &jobs.dirs {
        let device = std::fs::read_to_string(dir.join("device")).unwrap();
        assert!(matches!(device.trim(), "0" | "1"), "unexpected device {}", device);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_run_still_completes_with_sentinel() {
    let jobs = JobDirs::new(1, "exit 1");
    let queue = cpu_queue(1);
    queue.submit(&jobs.dirs, None).await.unwrap();

    let completed = queue.wait(&fast_wait(), None).await.unwrap();

    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].dir, jobs.dirs[0]);
    assert!(matches!(
        completed[0].outcome,
        RunOutcome::Failed {
            exit_code: Some(1),
            ..
        }
    ));
    assert!(is_done(&jobs.dirs[0]));
    assert_eq!(queue.inprogress().await.unwrap(), 0);
}

#[tokio::test]
async fn test_ngpu_and_devices_fail_construction() {
    let config = LocalGpuConfig::default()
        .with_ngpu(2)
        .with_devices(vec![0, 1]);
    let err = LocalQueue::gpu(config).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Misconfigured);
}

#[tokio::test]
async fn test_missing_run_script_rejected_before_queueing() {
    let jobs = JobDirs::new(1, "true");
    let bare = jobs.empty_dir("bare");
    let queue = cpu_queue(1);

    let err = queue
        .submit(&[jobs.dirs[0].clone(), bare.clone()], None)
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::RunScriptMissing(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(queue.inprogress().await.unwrap(), 0);
    assert!(queue.state(&jobs.dirs[0]).await.is_none());
    assert!(queue.registry().is_empty());
    // Workers never started
    assert!(queue.devices().is_none());
}

#[tokio::test]
async fn test_non_executable_run_script_rejected() {
    let jobs = JobDirs::new(0, "");
    let dir = jobs.empty_dir("job");
    write_script(&dir, "run.sh", "true", 0o644);
    let queue = cpu_queue(1);

    let err = queue.submit(&[dir.clone()], None).await.unwrap_err();

    assert!(matches!(err, QueueError::RunScriptNotExecutable(_)));
    assert!(queue.state(&dir).await.is_none());
}

#[tokio::test]
async fn test_missing_directory_rejected() {
    let jobs = JobDirs::new(0, "");
    let queue = cpu_queue(1);

    let err = queue
        .submit(&[jobs.root.path().join("nope")], None)
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::DirectoryNotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_sentinel_cleared_on_resubmit() {
    let jobs = JobDirs::new(1, "sleep 0.5");
    let dir = jobs.dirs[0].clone();
    touch_sentinel(&dir);
    let queue = cpu_queue(1);

    queue.submit(&jobs.dirs, None).await.unwrap();

    assert!(!is_done(&dir));
    assert_eq!(queue.inprogress().await.unwrap(), 1);
    assert_eq!(queue.not_completed(), 1);

    queue.wait(&fast_wait(), None).await.unwrap();
    assert!(is_done(&dir));
    assert_eq!(queue.not_completed(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retrieve_returns_each_directory_once() {
    let jobs = JobDirs::new(2, "sleep 0.2");
    let queue = cpu_queue(2);
    queue.submit(&jobs.dirs, None).await.unwrap();

    let completed = queue.wait(&fast_wait(), None).await.unwrap();

    let mut dirs: Vec<PathBuf> = completed.into_iter().map(|c| c.dir).collect();
    dirs.sort();
    assert_eq!(dirs, jobs.dirs);
    assert!(queue.retrieve().await.unwrap().is_empty());
    assert!(queue.retrieve().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manual_polling() {
    let jobs = JobDirs::new(3, "sleep 0.1");
    let queue = cpu_queue(1);
    queue.submit(&jobs.dirs, None).await.unwrap();
    assert_eq!(queue.inprogress().await.unwrap(), 3);

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while seen.len() < 3 && tokio::time::Instant::now() < deadline {
        seen.extend(queue.retrieve().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    seen.sort();
    assert_eq!(seen, jobs.dirs);
    assert_eq!(queue.inprogress().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sentinel_mode_wait() {
    let jobs = JobDirs::new(2, "sleep 0.2");
    let queue = cpu_queue(2);
    queue.submit(&jobs.dirs, None).await.unwrap();

    let opts = WaitOptions::sentinel().with_poll_interval(Duration::from_millis(50));
    let mut completed = queue.wait(&opts, None).await.unwrap();
    assert!(jobs.all_done());
    assert_eq!(queue.not_completed(), 0);

    // Sentinels can appear just before the table records the completion
    assert_eventually(
        || async { queue.inprogress().await.unwrap() == 0 },
        Duration::from_secs(5),
        "jobs still in progress after their sentinels appeared",
    )
    .await;
    completed.extend(queue.retrieve_completed().await.unwrap());
    assert_eq!(completed.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_report_callback_receives_remaining_count() {
    let jobs = JobDirs::new(2, "sleep 0.3");
    let queue = cpu_queue(1);
    queue.submit(&jobs.dirs, None).await.unwrap();

    let mut reports = Vec::new();
    let mut record = |remaining: usize| reports.push(remaining);
    let opts = fast_wait().with_report_interval(Duration::from_millis(100));
    queue
        .wait(&opts, Some(&mut record as &mut ReportFn<'_>))
        .await
        .unwrap();

    assert!(!reports.is_empty());
    assert_eq!(reports.last(), Some(&0));
    assert!(reports.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_command_overrides_replace_run_script() {
    let jobs = JobDirs::new(0, "");
    let a = jobs.empty_dir("a");
    let b = jobs.empty_dir("b");
    let queue = cpu_queue(2);

    let commands = vec!["echo a > out".to_string(), "echo b > out".to_string()];
    queue
        .submit(&[a.clone(), b.clone()], Some(commands.as_slice()))
        .await
        .unwrap();
    queue.wait(&fast_wait(), None).await.unwrap();

    assert_eq!(std::fs::read_to_string(a.join("out")).unwrap(), "a\n");
    assert_eq!(std::fs::read_to_string(b.join("out")).unwrap(), "b\n");

    let err = queue
        .submit(&[a], Some(&commands[..]))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::CommandCountMismatch { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resubmitting_running_directory_is_noop() {
    let jobs = JobDirs::new(1, "echo run >> runs\nsleep 0.5");
    let queue = cpu_queue(2);
    queue.submit(&jobs.dirs, None).await.unwrap();
    queue.submit(&jobs.dirs, None).await.unwrap();
    assert_eq!(queue.inprogress().await.unwrap(), 1);

    let completed = queue.wait(&fast_wait(), None).await.unwrap();
    assert_eq!(completed.len(), 1);
    let runs = std::fs::read_to_string(jobs.dirs[0].join("runs")).unwrap();
    assert_eq!(runs.lines().count(), 1);

    // Finished and retrieved: a new submit runs it again
    queue.submit(&jobs.dirs, None).await.unwrap();
    queue.wait(&fast_wait(), None).await.unwrap();
    let runs = std::fs::read_to_string(jobs.dirs[0].join("runs")).unwrap();
    assert_eq!(runs.lines().count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_outputs_collected_into_datadir() {
    let jobs = JobDirs::new(1, "echo frames > traj.xtc\necho log > run.log");
    let datadir = jobs.root.path().join("data");
    let config = LocalCpuConfig::default()
        .with_slots(1, 1)
        .with_script(ScriptConfig::default().with_datadir(&datadir));
    let queue = LocalQueue::cpu(config).unwrap();

    queue.submit(&jobs.dirs, None).await.unwrap();
    queue.wait(&fast_wait(), None).await.unwrap();

    assert!(datadir.join("job0").join("traj.xtc").exists());
    assert!(jobs.dirs[0].join("run.log").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_rejects_further_submissions() {
    let jobs = JobDirs::new(1, "sleep 2");
    let queue = cpu_queue(1);
    queue.submit(&jobs.dirs, None).await.unwrap();
    assert_eventually(
        || async { queue.state(&jobs.dirs[0]).await == Some(QueueState::Running) },
        Duration::from_secs(5),
        "job never started",
    )
    .await;

    queue.stop().await.unwrap();
    queue.stop().await.unwrap();

    let err = queue.submit(&jobs.dirs, None).await.unwrap_err();
    assert!(matches!(err, QueueError::Stopped));
    // The abandoned child keeps running and still touches its sentinel
    assert_eventually(
        || async { is_done(&jobs.dirs[0]) },
        Duration::from_secs(10),
        "abandoned job never finished",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_setters_refused_after_start() {
    let jobs = JobDirs::new(1, "true");
    let mut queue = cpu_queue(1);
    queue.set_memory(512).unwrap();
    queue.submit(&jobs.dirs, None).await.unwrap();

    let err = queue.set_ncpu(1).unwrap_err();
    assert!(matches!(err, QueueError::AlreadyStarted(_)));
    assert_eq!(queue.memory().unwrap(), 512);
    assert_eq!(queue.ngpu().unwrap_err().kind(), ErrorKind::Unsupported);
    queue.wait(&fast_wait(), None).await.unwrap();
}

#[tokio::test]
async fn test_queue_as_trait_object() {
    let queues: Vec<Box<dyn JobQueue>> = vec![
        Box::new(cpu_queue(1)) as Box<dyn JobQueue>,
        Box::new(LocalQueue::gpu(LocalGpuConfig::default().with_devices(vec![0])).unwrap()),
    ];
    let backends: Vec<&str> = queues.iter().map(|q| q.backend()).collect();
    assert_eq!(backends, vec!["local-cpu", "local-gpu"]);
    for queue in &queues {
        assert_eq!(queue.inprogress().await.unwrap(), 0);
        assert!(queue.retrieve().await.unwrap().is_empty());
        queue.stop().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_default_run_script_in_directory_with_space() {
    let jobs = JobDirs::new(0, "");
    let dir = jobs.empty_dir("my job");
    write_script(&dir, "run.sh", "echo ran > out", 0o755);
    let queue = cpu_queue(1);

    queue.submit(&[dir.clone()], None).await.unwrap();
    let completed = queue.wait(&fast_wait(), None).await.unwrap();

    assert_eq!(completed.len(), 1);
    assert!(
        completed[0].outcome.is_success(),
        "run failed: {:?}",
        completed[0].outcome
    );
    assert_eq!(std::fs::read_to_string(dir.join("out")).unwrap(), "ran\n");
    assert!(is_done(&dir));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sentinel_written_for_directory_with_dollar_sign() {
    let jobs = JobDirs::new(0, "");
    let dir = jobs.empty_dir("job$x");
    write_script(&dir, "run.sh", "echo ran > out", 0o755);
    let queue = cpu_queue(1);

    queue.submit(&[dir.clone()], None).await.unwrap();
    let opts = WaitOptions::sentinel().with_poll_interval(Duration::from_millis(50));
    tokio::time::timeout(Duration::from_secs(10), queue.wait(&opts, None))
        .await
        .expect("sentinel never appeared")
        .unwrap();

    assert!(is_done(&dir));
    assert!(!jobs.root.path().join("job").exists());
    assert_eq!(std::fs::read_to_string(dir.join("out")).unwrap(), "ran\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_returns_once_stopped_with_work_left() {
    let jobs = JobDirs::new(2, "sleep 2");
    let queue = cpu_queue(1);
    queue.submit(&jobs.dirs, None).await.unwrap();
    assert_eventually(
        || async { queue.running().await == 1 },
        Duration::from_secs(5),
        "job never started",
    )
    .await;

    queue.stop().await.unwrap();
    let completed = tokio::time::timeout(Duration::from_secs(5), queue.wait(&fast_wait(), None))
        .await
        .expect("wait blocked on a stopped queue")
        .unwrap();

    assert!(completed.is_empty());
    assert!(queue.is_stopped());
    // The abandoned run and the never-started one both stay unfinished
    assert_eq!(queue.inprogress().await.unwrap(), 2);
}
