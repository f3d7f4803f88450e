use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use jobqueues::config::LsfVersion;
use jobqueues::scheduler::{Lsf, Pbs, SchedulerDialect, Sge};
use jobqueues::shutdown::install_shutdown_handler;
use jobqueues::{
    CompletedJob, JobQueue, LocalCpuConfig, LocalGpuConfig, LocalQueue, RunOutcome,
    SchedulerConfig, SchedulerQueue, ScriptConfig, WaitOptions,
};

#[derive(Parser, Debug)]
#[command(name = "jobqueues")]
#[command(version)]
#[command(about = "Run directories of simulation jobs locally or on a batch scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit job directories and wait for them to finish
    Run(RunArgs),

    /// Cancel a job group on an external scheduler
    Cancel(CancelArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    LocalGpu,
    LocalCpu,
    Lsf,
    Sge,
    Pbs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchedulerBackend {
    Lsf,
    Sge,
    Pbs,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Backend to run the jobs on
    backend: Backend,

    /// Job directories, each containing the run script
    #[arg(required = true)]
    dirs: Vec<PathBuf>,

    // === Local Options ===
    /// Number of GPUs to use (first N devices)
    #[arg(long, conflicts_with = "devices")]
    ngpu: Option<u32>,

    /// Explicit GPU indexes (comma-separated)
    #[arg(long, value_delimiter = ',')]
    devices: Option<Vec<u32>>,

    /// CPUs per job
    #[arg(long)]
    ncpu: Option<u32>,

    /// CPU threads the local CPU queue may use in total
    #[arg(long)]
    maxcpu: Option<u32>,

    /// Memory per job in MiB
    #[arg(long)]
    memory: Option<u64>,

    // === Script Options ===
    /// Name of the run script inside every job directory
    #[arg(long, default_value = "run.sh")]
    runscript: String,

    /// Move finished outputs into <DATADIR>/<job directory name>/
    #[arg(long)]
    datadir: Option<PathBuf>,

    /// Globs of the outputs moved into the data directory
    #[arg(long, value_delimiter = ',', default_value = "*.xtc")]
    copy: Vec<String>,

    // === Scheduler Options ===
    /// Scheduler queue (repeatable)
    #[arg(long = "queue", short = 'q')]
    queues: Vec<String>,

    /// Job name used by status and cancel queries
    #[arg(long)]
    jobname: Option<String>,

    /// Wall-clock limit per job, in seconds
    #[arg(long)]
    walltime: Option<u64>,

    /// Use LSF 10 GPU request syntax
    #[arg(long)]
    lsf10: bool,

    // === Wait Options ===
    /// Count remaining work from sentinel files instead of the backend
    #[arg(long)]
    sentinel: bool,

    /// Seconds between polls
    #[arg(long, default_value = "5")]
    poll_secs: u64,

    /// Seconds between progress reports
    #[arg(long)]
    report_secs: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

// =============================================================================
// Cancel Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CancelArgs {
    /// Scheduler the jobs were submitted to
    backend: SchedulerBackend,

    /// Job name the jobs were submitted under
    #[arg(long)]
    jobname: String,

    /// Scheduler queue (repeatable)
    #[arg(long = "queue", short = 'q')]
    queues: Vec<String>,

    /// Job ids to cancel (PBS cancels by id only)
    #[arg(long = "job-id", value_delimiter = ',')]
    job_ids: Vec<String>,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RunOutput {
    completed: Vec<CompletedJob>,
    failed: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn outcome_to_string(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Succeeded => "OK".to_string(),
        RunOutcome::Failed {
            exit_code: Some(code),
            ..
        } => format!("FAILED({})", code),
        RunOutcome::Failed { .. } => "FAILED".to_string(),
        RunOutcome::Unknown => "DONE".to_string(),
    }
}

fn script_config(args: &RunArgs) -> ScriptConfig {
    let script = ScriptConfig::default()
        .with_runscript(args.runscript.clone())
        .with_copy(args.copy.clone());
    match &args.datadir {
        Some(datadir) => script.with_datadir(datadir),
        None => script,
    }
}

fn scheduler_config(mut config: SchedulerConfig, args: &RunArgs) -> SchedulerConfig {
    config.queues = args.queues.clone();
    config.jobname = args.jobname.clone();
    if let Some(ncpu) = args.ncpu {
        config.ncpu = ncpu;
    }
    if let Some(ngpu) = args.ngpu {
        config.ngpu = ngpu;
    }
    if let Some(memory) = args.memory {
        config.memory = memory;
    }
    if let Some(walltime) = args.walltime {
        config.walltime = Some(Duration::from_secs(walltime));
    }
    if args.lsf10 {
        config.lsf.version = LsfVersion::V10;
    }
    config.with_script(script_config(args))
}

fn build_queue(args: &RunArgs) -> Result<Box<dyn JobQueue>, Box<dyn std::error::Error>> {
    let queue: Box<dyn JobQueue> = match args.backend {
        Backend::LocalGpu => {
            let config = LocalGpuConfig {
                ngpu: args.ngpu,
                devices: args.devices.clone(),
                memory: args.memory,
                script: script_config(args),
            };
            Box::new(LocalQueue::gpu(config)?)
        }
        Backend::LocalCpu => {
            let defaults = LocalCpuConfig::default();
            let config = LocalCpuConfig {
                ncpu: args.ncpu.unwrap_or(defaults.ncpu),
                maxcpu: args.maxcpu.unwrap_or(defaults.maxcpu),
                memory: args.memory,
                script: script_config(args),
            };
            Box::new(LocalQueue::cpu(config)?)
        }
        Backend::Lsf => Box::new(SchedulerQueue::new(
            Lsf,
            scheduler_config(SchedulerConfig::lsf(), args),
        )?),
        Backend::Sge => Box::new(SchedulerQueue::new(
            Sge,
            scheduler_config(SchedulerConfig::sge(), args),
        )?),
        Backend::Pbs => Box::new(SchedulerQueue::new(
            Pbs,
            scheduler_config(SchedulerConfig::pbs(), args),
        )?),
    };
    Ok(queue)
}

fn print_completed(
    completed: Vec<CompletedJob>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let failed = completed
        .iter()
        .filter(|job| matches!(job.outcome, RunOutcome::Failed { .. }))
        .count();

    match format {
        OutputFormat::Json => {
            let output = RunOutput { completed, failed };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if completed.is_empty() {
                println!("No jobs completed.");
                return Ok(());
            }
            println!("{:<12} {:<20} DIRECTORY", "RESULT", "FINISHED");
            println!("{}", "-".repeat(78));
            for job in &completed {
                println!(
                    "{:<12} {:<20} {}",
                    outcome_to_string(&job.outcome),
                    job.finished_at.format("%Y-%m-%d %H:%M:%S"),
                    job.dir.display()
                );
            }
            if failed > 0 {
                println!();
                println!("{} of {} jobs failed", failed, completed.len());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn run_jobs(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let queue = build_queue(&args)?;
    let token = install_shutdown_handler()?;

    queue.submit(&args.dirs, None).await?;

    let mut opts = WaitOptions {
        use_sentinel: args.sentinel,
        ..Default::default()
    }
    .with_poll_interval(Duration::from_secs(args.poll_secs));
    if let Some(report) = args.report_secs {
        opts = opts.with_report_interval(Duration::from_secs(report));
    }

    let completed = tokio::select! {
        result = queue.wait(&opts, None) => result?,
        _ = token.cancelled() => {
            queue.stop().await?;
            let completed = queue.retrieve_completed().await?;
            eprintln!("Stopped with {} jobs unfinished", queue.not_completed());
            completed
        }
    };

    print_completed(completed, &args.output)
}

async fn cancel_with<D: SchedulerDialect + 'static>(
    dialect: D,
    config: SchedulerConfig,
    job_ids: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let queue = SchedulerQueue::new(dialect, config)?;
    queue.adopt_job_ids(job_ids);
    queue.stop().await?;
    Ok(())
}

async fn cancel_jobs(args: CancelArgs) -> Result<(), Box<dyn std::error::Error>> {
    let configure = |config: SchedulerConfig| {
        let mut config = config.with_jobname(args.jobname.clone());
        config.queues = args.queues.clone();
        config
    };
    let job_ids = args.job_ids.clone();
    match args.backend {
        SchedulerBackend::Lsf => {
            cancel_with(Lsf, configure(SchedulerConfig::lsf()), job_ids).await?
        }
        SchedulerBackend::Sge => {
            cancel_with(Sge, configure(SchedulerConfig::sge()), job_ids).await?
        }
        SchedulerBackend::Pbs => {
            if job_ids.is_empty() {
                return Err("PBS jobs are cancelled by id, pass --job-id".into());
            }
            cancel_with(Pbs, configure(SchedulerConfig::pbs()), job_ids).await?
        }
    }
    println!("Cancelled jobs named {}", args.jobname);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| format!("failed to initialize logging: {}", e))?;

    match args.command {
        Commands::Run(run_args) => run_jobs(run_args).await?,
        Commands::Cancel(cancel_args) => cancel_jobs(cancel_args).await?,
    }

    Ok(())
}
