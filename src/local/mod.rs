//! Local execution engine.
//!
//! The only backend that runs jobs itself:
//! - **Device pool**: one slot per GPU index, or `maxcpu / ncpu` CPU slots
//! - **Workers**: one task per slot, pulling from a shared pending queue
//! - **Completion**: every run ends `Completed`, success or not
//!
//! # Components
//!
//! - [`LocalQueue`]: the [`JobQueue`] implementation
//! - [`devices`]: device selection, visibility filtering, memory defaults
//! - [`table`]: path-keyed job state behind a lock
//! - [`executor`]: writes the job script and runs it as a child process
//! - [`worker`]: the per-device pull loop
//!
//! # Execution Flow
//!
//! 1. The first `submit` resolves the device pool and spawns the workers
//! 2. `submit` validates every directory, clears stale sentinels, marks each
//!    directory `Queued` and pushes it onto the pending queue
//! 3. A free worker takes it, marks it `Running`, runs the job script bound
//!    to its device and marks it `Completed`
//! 4. `retrieve` drains `Completed` entries; `inprogress` counts the rest
//!
//! # Failures
//!
//! A script exiting non-zero is logged and still ends `Completed`; the
//! [`RunOutcome`](crate::queue::RunOutcome) returned by
//! [`JobQueue::retrieve_completed`] is the only place the failure shows.

pub mod devices;
pub mod executor;
pub mod table;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{logical_cpus, LocalCpuConfig, LocalGpuConfig, ScriptConfig};
use crate::error::{QueueError, Resource, Result};
use crate::queue::registry::{clear_sentinel, resolve_commands, resolve_dirs};
use crate::queue::{CompletedJob, Device, DirectoryRegistry, Job, JobQueue, QueueState};
use crate::script::DEVICE_VISIBILITY_VAR;

use self::executor::JobExecutor;
use self::table::JobTable;
use self::worker::{PendingJob, Worker};

#[derive(Debug, Clone)]
enum Pool {
    Gpu {
        ngpu: Option<u32>,
        devices: Option<Vec<u32>>,
    },
    Cpu {
        ncpu: u32,
        maxcpu: u32,
    },
}

/// Started workers and what they were started with.
struct Workers {
    tx: mpsc::UnboundedSender<PendingJob>,
    devices: Vec<Device>,
    memory: u64,
}

/// Queue that runs jobs on this machine, one per device slot.
pub struct LocalQueue {
    pool: Pool,
    memory: Option<u64>,
    script: ScriptConfig,
    table: Arc<RwLock<JobTable>>,
    registry: DirectoryRegistry,
    workers: OnceCell<Workers>,
    token: CancellationToken,
    span: tracing::Span,
}

impl LocalQueue {
    /// GPU queue. Fails immediately if both `ngpu` and `devices` are set.
    pub fn gpu(config: LocalGpuConfig) -> Result<Self> {
        if config.ngpu.is_some() && config.devices.is_some() {
            return Err(QueueError::ConflictingOptions("ngpu", "devices"));
        }
        Ok(Self::with_pool(
            Pool::Gpu {
                ngpu: config.ngpu,
                devices: config.devices,
            },
            config.memory,
            config.script,
        ))
    }

    /// CPU queue with `maxcpu / ncpu` unbound slots.
    pub fn cpu(config: LocalCpuConfig) -> Result<Self> {
        devices::cpu_slots(config.ncpu, config.maxcpu, logical_cpus())?;
        Ok(Self::with_pool(
            Pool::Cpu {
                ncpu: config.ncpu,
                maxcpu: config.maxcpu,
            },
            config.memory,
            config.script,
        ))
    }

    fn with_pool(pool: Pool, memory: Option<u64>, script: ScriptConfig) -> Self {
        let backend = match pool {
            Pool::Gpu { .. } => "local-gpu",
            Pool::Cpu { .. } => "local-cpu",
        };
        Self {
            pool,
            memory,
            script,
            table: Arc::new(RwLock::new(JobTable::new())),
            registry: DirectoryRegistry::new(),
            workers: OnceCell::new(),
            token: CancellationToken::new(),
            span: tracing::info_span!("queue", backend),
        }
    }

    /// Devices the workers are bound to, once started.
    pub fn devices(&self) -> Option<&[Device]> {
        self.workers.get().map(|w| w.devices.as_slice())
    }

    /// Current state of a submitted directory.
    pub async fn state(&self, dir: &Path) -> Option<QueueState> {
        self.table.read().await.state(dir)
    }

    /// Jobs currently holding a device.
    pub async fn running(&self) -> usize {
        self.table.read().await.running()
    }

    /// Resolve the device pool this queue would start with.
    pub async fn resolve_devices(&self) -> Result<Vec<Device>> {
        match &self.pool {
            Pool::Gpu { ngpu, devices: listed } => {
                let detected = if ngpu.is_none() && listed.is_none() {
                    devices::detect_gpus().await
                } else {
                    None
                };
                let indexes = devices::resolve_gpu_devices(*ngpu, listed.as_deref(), detected)?;
                let visible = std::env::var(DEVICE_VISIBILITY_VAR).ok();
                let indexes = devices::filter_visible(indexes, visible.as_deref());
                if indexes.is_empty() {
                    return Err(QueueError::NoDevices(
                        "no usable GPU devices remain".to_string(),
                    ));
                }
                Ok(devices::gpu_pool(&indexes))
            }
            Pool::Cpu { ncpu, maxcpu } => {
                let slots = devices::cpu_slots(*ncpu, *maxcpu, logical_cpus())?;
                Ok(devices::cpu_pool(slots))
            }
        }
    }

    fn default_memory(&self, started: Option<usize>) -> Result<u64> {
        let total = devices::total_memory_mib()?;
        Ok(match &self.pool {
            Pool::Gpu { ngpu, devices: listed } => {
                let count = started
                    .or(ngpu.map(|n| n as usize))
                    .or(listed.as_ref().map(Vec::len))
                    .unwrap_or(0);
                devices::memory_per_device(total, count)
            }
            Pool::Cpu { ncpu, .. } => devices::memory_per_cpu_share(total, *ncpu, logical_cpus()),
        })
    }

    async fn start(&self) -> Result<&Workers> {
        self.workers
            .get_or_try_init(|| async {
                let devices = self.resolve_devices().await?;
                let memory = match self.memory {
                    Some(memory) => memory,
                    None => self.default_memory(Some(devices.len()))?,
                };
                match &self.pool {
                    Pool::Gpu { .. } => tracing::info!(
                        devices = ?devices.iter().filter_map(|d| d.gpu_index()).collect::<Vec<_>>(),
                        memory,
                        "Using GPU devices"
                    ),
                    Pool::Cpu { ncpu, maxcpu } => tracing::info!(
                        slots = devices.len(),
                        maxcpu,
                        ncpu,
                        memory,
                        "Using CPU devices"
                    ),
                }

                let (tx, rx) = mpsc::unbounded_channel();
                let pending = Arc::new(Mutex::new(rx));
                let executor = JobExecutor::new(self.script.clone());
                // Workers are detached; each exits on its own once the token is cancelled
                for &device in &devices {
                    let worker = Worker {
                        device,
                        pending: pending.clone(),
                        table: self.table.clone(),
                        executor: executor.clone(),
                        token: self.token.clone(),
                    };
                    tokio::spawn(worker.run().instrument(self.span.clone()));
                }

                Ok::<_, QueueError>(Workers {
                    tx,
                    devices,
                    memory,
                })
            })
            .await
    }

    async fn enqueue(&self, dirs: &[PathBuf], commands: Option<&[String]>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(QueueError::Stopped);
        }
        let dirs = resolve_dirs(dirs)?;
        let commands = resolve_commands(&dirs, commands, &self.script.runscript)?;
        let workers = self.start().await?;

        self.registry.register(&dirs);
        let mut table = self.table.write().await;
        for (dir, command) in dirs.into_iter().zip(commands) {
            if table.is_active(&dir) {
                tracing::debug!(dir = %dir.display(), "Already queued, not queueing again");
                continue;
            }
            tracing::info!(dir = %dir.display(), "Queueing");
            clear_sentinel(&dir);
            table.enqueue(Job::new(dir.clone(), command.clone()));
            workers
                .tx
                .send(PendingJob { dir, command })
                .map_err(|_| QueueError::Stopped)?;
        }
        Ok(())
    }

    fn ensure_configurable(&self, resource: Resource) -> Result<()> {
        if self.workers.initialized() {
            Err(QueueError::AlreadyStarted(resource))
        } else {
            Ok(())
        }
    }

    fn unsupported(&self, resource: Resource) -> QueueError {
        QueueError::Unsupported {
            backend: self.backend(),
            resource,
        }
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    fn backend(&self) -> &'static str {
        match self.pool {
            Pool::Gpu { .. } => "local-gpu",
            Pool::Cpu { .. } => "local-cpu",
        }
    }

    async fn submit(&self, dirs: &[PathBuf], commands: Option<&[String]>) -> Result<()> {
        self.enqueue(dirs, commands)
            .instrument(self.span.clone())
            .await
    }

    async fn retrieve_completed(&self) -> Result<Vec<CompletedJob>> {
        Ok(self.table.write().await.drain_completed())
    }

    async fn inprogress(&self) -> Result<usize> {
        Ok(self.table.read().await.in_progress())
    }

    async fn stop(&self) -> Result<()> {
        if !self.token.is_cancelled() {
            self.span.in_scope(|| tracing::info!("Stopping local workers"));
            self.token.cancel();
        }
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    fn registry(&self) -> &DirectoryRegistry {
        &self.registry
    }

    fn ncpu(&self) -> Result<u32> {
        match self.pool {
            Pool::Cpu { ncpu, .. } => Ok(ncpu),
            Pool::Gpu { .. } => Err(self.unsupported(Resource::Cpu)),
        }
    }

    fn set_ncpu(&mut self, value: u32) -> Result<()> {
        self.ensure_configurable(Resource::Cpu)?;
        let Pool::Cpu { maxcpu, .. } = self.pool else {
            return Err(self.unsupported(Resource::Cpu));
        };
        devices::cpu_slots(value, maxcpu, logical_cpus())?;
        self.pool = Pool::Cpu {
            ncpu: value,
            maxcpu,
        };
        Ok(())
    }

    fn ngpu(&self) -> Result<u32> {
        if let Pool::Cpu { .. } = self.pool {
            return Err(self.unsupported(Resource::Gpu));
        }
        if let Some(started) = self.devices() {
            return Ok(started.len() as u32);
        }
        match &self.pool {
            Pool::Gpu { ngpu: Some(n), .. } => Ok(*n),
            Pool::Gpu {
                devices: Some(devices),
                ..
            } => Ok(devices.len() as u32),
            _ => Err(QueueError::NoDevices(
                "GPUs are detected on the first submit".to_string(),
            )),
        }
    }

    fn set_ngpu(&mut self, value: u32) -> Result<()> {
        self.ensure_configurable(Resource::Gpu)?;
        match self.pool {
            Pool::Cpu { .. } => return Err(self.unsupported(Resource::Gpu)),
            Pool::Gpu {
                devices: Some(_), ..
            } => return Err(QueueError::ConflictingOptions("ngpu", "devices")),
            Pool::Gpu { devices: None, .. } => {}
        }
        self.pool = Pool::Gpu {
            ngpu: Some(value),
            devices: None,
        };
        Ok(())
    }

    fn memory(&self) -> Result<u64> {
        if let Some(memory) = self.memory {
            return Ok(memory);
        }
        if let Some(workers) = self.workers.get() {
            return Ok(workers.memory);
        }
        self.default_memory(None)
    }

    fn set_memory(&mut self, value: u64) -> Result<()> {
        self.ensure_configurable(Resource::Memory)?;
        self.memory = Some(value);
        Ok(())
    }
}
