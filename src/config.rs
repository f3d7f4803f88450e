use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by every backend that writes a job script.
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Name of the run script each job directory must contain
    pub runscript: String,
    /// Name of the generated job script written into each job directory
    pub jobscript: String,
    /// Where completed outputs are collected. `None` leaves them in place.
    pub datadir: Option<PathBuf>,
    /// File names or globs moved into `<datadir>/<job basename>/`
    pub copy: Vec<String>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            runscript: "run.sh".to_string(),
            jobscript: "job.sh".to_string(),
            datadir: None,
            copy: vec!["*.xtc".to_string()],
        }
    }
}

impl ScriptConfig {
    pub fn with_datadir(mut self, datadir: impl Into<PathBuf>) -> Self {
        self.datadir = Some(datadir.into());
        self
    }

    pub fn with_copy(mut self, copy: Vec<String>) -> Self {
        self.copy = copy;
        self
    }

    pub fn with_runscript(mut self, runscript: impl Into<String>) -> Self {
        self.runscript = runscript.into();
        self
    }
}

/// Configuration for the local GPU queue.
///
/// `ngpu` and `devices` are mutually exclusive. With neither set, the
/// visible GPUs of the machine are detected at startup.
#[derive(Debug, Clone, Default)]
pub struct LocalGpuConfig {
    /// Use the first `ngpu` devices of the machine
    pub ngpu: Option<u32>,
    /// Explicit device indexes to run on
    pub devices: Option<Vec<u32>>,
    /// Memory per job in MiB. Derived from system memory when unset.
    pub memory: Option<u64>,
    pub script: ScriptConfig,
}

impl LocalGpuConfig {
    pub fn with_ngpu(mut self, ngpu: u32) -> Self {
        self.ngpu = Some(ngpu);
        self
    }

    pub fn with_devices(mut self, devices: Vec<u32>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_script(mut self, script: ScriptConfig) -> Self {
        self.script = script;
        self
    }
}

/// Configuration for the local CPU queue.
///
/// The pool holds `maxcpu / ncpu` unbound slots.
#[derive(Debug, Clone)]
pub struct LocalCpuConfig {
    /// CPU threads per job
    pub ncpu: u32,
    /// CPU threads available to the whole queue
    pub maxcpu: u32,
    /// Memory per job in MiB. Derived from system memory when unset.
    pub memory: Option<u64>,
    pub script: ScriptConfig,
}

impl Default for LocalCpuConfig {
    fn default() -> Self {
        Self {
            ncpu: 1,
            maxcpu: logical_cpus(),
            memory: None,
            script: ScriptConfig::default(),
        }
    }
}

impl LocalCpuConfig {
    pub fn with_slots(mut self, ncpu: u32, maxcpu: u32) -> Self {
        self.ncpu = ncpu;
        self.maxcpu = maxcpu;
        self
    }

    pub fn with_script(mut self, script: ScriptConfig) -> Self {
        self.script = script;
        self
    }
}

/// Number of logical CPUs of this machine (at least 1).
pub fn logical_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LsfVersion {
    #[default]
    V9,
    V10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMode {
    Shared,
    ExclusiveProcess,
}

/// GPU requirement options understood by LSF 10 (`#BSUB -gpu`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LsfGpuOptions {
    pub mode: Option<GpuMode>,
    pub mps: Option<bool>,
    pub j_exclusive: Option<bool>,
}

impl LsfGpuOptions {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.mps.is_none() && self.j_exclusive.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LsfOptions {
    pub version: LsfVersion,
    /// Application profile (`#BSUB -app`)
    pub app: Option<String>,
    pub gpu_options: LsfGpuOptions,
}

#[derive(Debug, Clone, Default)]
pub struct PbsOptions {
    /// Select nodes from a single named cluster
    pub cluster: Option<String>,
    /// Local scratch in MiB
    pub scratch_local: Option<u64>,
}

/// Configuration for queues backed by an external batch scheduler.
///
/// Use [`SchedulerConfig::lsf`], [`SchedulerConfig::sge`] or
/// [`SchedulerConfig::pbs`] to start from the defaults of a scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Job name used to filter status and cancel queries. Generated from the
    /// first submitted directory when unset.
    pub jobname: Option<String>,
    /// Queue(s) or partition(s) to run on
    pub queues: Vec<String>,
    /// CPUs per job
    pub ncpu: u32,
    /// GPUs per job
    pub ngpu: u32,
    /// Memory per job in MiB
    pub memory: u64,
    pub walltime: Option<Duration>,
    /// Extra resource strings, one directive each
    pub resources: Vec<String>,
    /// Environment variables propagated to the running node (comma-separated)
    pub envvars: Option<String>,
    /// Shell commands run on the node before the job (e.g. loading modules)
    pub prerun: Vec<String>,
    pub outputstream: Option<String>,
    pub errorstream: Option<String>,
    pub lsf: LsfOptions,
    pub pbs: PbsOptions,
    pub script: ScriptConfig,
}

impl SchedulerConfig {
    fn base() -> Self {
        Self {
            jobname: None,
            queues: Vec::new(),
            ncpu: 1,
            ngpu: 1,
            memory: 4000,
            walltime: None,
            resources: Vec::new(),
            envvars: Some("ACEMD_HOME".to_string()),
            prerun: Vec::new(),
            outputstream: None,
            errorstream: None,
            lsf: LsfOptions::default(),
            pbs: PbsOptions::default(),
            script: ScriptConfig::default(),
        }
    }

    pub fn lsf() -> Self {
        Self {
            outputstream: Some("lsf.%J.out".to_string()),
            errorstream: Some("lsf.%J.err".to_string()),
            ..Self::base()
        }
    }

    pub fn sge() -> Self {
        Self {
            outputstream: Some("$REQUEST.oJID[.TASKID]".to_string()),
            errorstream: Some("$REQUEST.eJID[.TASKID]".to_string()),
            ..Self::base()
        }
    }

    pub fn pbs() -> Self {
        Self {
            ngpu: 0,
            memory: 1000,
            walltime: Some(Duration::from_secs(3600)),
            envvars: Some("ACEMD_HOME,HTMD_LICENSE_FILE".to_string()),
            ..Self::base()
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push(queue.into());
        self
    }

    pub fn with_jobname(mut self, jobname: impl Into<String>) -> Self {
        self.jobname = Some(jobname.into());
        self
    }

    pub fn with_script(mut self, script: ScriptConfig) -> Self {
        self.script = script;
        self
    }
}

/// How [`JobQueue::wait`](crate::queue::JobQueue::wait) polls.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Count remaining work from sentinel files instead of asking the backend
    pub use_sentinel: bool,
    pub poll_interval: Duration,
    /// Report the remaining count this often. Rounded to a multiple of
    /// `poll_interval`; a shorter value also shortens the poll interval.
    pub report_interval: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            use_sentinel: false,
            poll_interval: Duration::from_secs(5),
            report_interval: None,
        }
    }
}

impl WaitOptions {
    pub fn sentinel() -> Self {
        Self {
            use_sentinel: true,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = Some(interval);
        self
    }

    /// Effective sleep between polls and how many polls pass between reports.
    pub fn schedule(&self) -> (Duration, Option<u32>) {
        match self.report_interval {
            None => (self.poll_interval, None),
            Some(report) if report > self.poll_interval => {
                let polls = report.as_secs_f64() / self.poll_interval.as_secs_f64();
                (self.poll_interval, Some((polls.round() as u32).max(1)))
            }
            Some(report) => (report, Some(1)),
        }
    }
}

/// Bounded retry applied to scheduler status queries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}
