//! Device pool resolution and memory defaults for local queues.

use sysinfo::System;
use tokio::process::Command;

use crate::error::{QueueError, Result};
use crate::queue::Device;
use crate::script::DEVICE_VISIBILITY_VAR;

/// Pick the GPU indexes a queue runs on.
///
/// `ngpu` selects the first N devices, `devices` names them explicitly and
/// `detected` is only consulted when neither is given.
pub fn resolve_gpu_devices(
    ngpu: Option<u32>,
    devices: Option<&[u32]>,
    detected: Option<Vec<u32>>,
) -> Result<Vec<u32>> {
    match (ngpu, devices) {
        (Some(_), Some(_)) => Err(QueueError::ConflictingOptions("ngpu", "devices")),
        (Some(n), None) => Ok((0..n).collect()),
        (None, Some(devices)) => Ok(devices.to_vec()),
        (None, None) => detected.ok_or_else(|| {
            QueueError::NoDevices(
                "no GPUs detected, specify them with `ngpu` or `devices`".to_string(),
            )
        }),
    }
}

/// Drop devices hidden by an inherited visibility variable.
///
/// A value that is not a list of indexes (e.g. GPU UUIDs) is left to the
/// driver and filters nothing.
pub fn filter_visible(devices: Vec<u32>, visible: Option<&str>) -> Vec<u32> {
    let Some(visible) = visible else {
        return devices;
    };
    let allowed: Option<Vec<u32>> = visible
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect();
    let Some(allowed) = allowed else {
        return devices;
    };

    let (kept, dropped): (Vec<u32>, Vec<u32>) =
        devices.into_iter().partition(|d| allowed.contains(d));
    if !dropped.is_empty() {
        tracing::warn!(
            dropped = ?dropped,
            visible,
            "Ignoring devices not listed in {}",
            DEVICE_VISIBILITY_VAR
        );
    }
    kept
}

/// Indexes reported by `nvidia-smi`, or `None` if it is absent or fails.
pub async fn detect_gpus() -> Option<Vec<u32>> {
    let smi = which::which("nvidia-smi").ok()?;
    let output = Command::new(smi)
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        tracing::debug!(status = ?output.status.code(), "nvidia-smi failed");
        return None;
    }
    let indexes: Vec<u32> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    if indexes.is_empty() {
        None
    } else {
        Some(indexes)
    }
}

/// Number of unbound slots a CPU queue runs.
pub fn cpu_slots(ncpu: u32, maxcpu: u32, available: u32) -> Result<usize> {
    if ncpu == 0 {
        return Err(QueueError::InvalidConfig("ncpu must be positive".to_string()));
    }
    if ncpu > maxcpu {
        return Err(QueueError::InvalidConfig(format!(
            "The ncpu ({}) cannot be greater than the maxcpu ({})",
            ncpu, maxcpu
        )));
    }
    if maxcpu > available {
        tracing::warn!(
            maxcpu,
            available,
            "maxcpu higher than the CPU threads available, oversubscribing"
        );
    }
    Ok((maxcpu / ncpu) as usize)
}

pub fn gpu_pool(indexes: &[u32]) -> Vec<Device> {
    indexes.iter().copied().map(Device::Gpu).collect()
}

pub fn cpu_pool(slots: usize) -> Vec<Device> {
    vec![Device::Cpu; slots]
}

/// Total system memory in MiB.
pub fn total_memory_mib() -> Result<u64> {
    let mut system = System::new();
    system.refresh_memory();
    match system.total_memory() {
        0 => Err(QueueError::InvalidConfig(
            "could not read the total system memory".to_string(),
        )),
        bytes => Ok(bytes / (1024 * 1024)),
    }
}

/// Memory per job when every device slot runs at once.
pub fn memory_per_device(total_mib: u64, devices: usize) -> u64 {
    if devices == 0 {
        total_mib
    } else {
        total_mib / devices as u64
    }
}

/// Memory share of a job using `ncpu` of `cpus` threads.
pub fn memory_per_cpu_share(total_mib: u64, ncpu: u32, cpus: u32) -> u64 {
    let share = (ncpu as f64 / cpus.max(1) as f64).clamp(0.0, 1.0);
    (total_mib as f64 * share).floor() as u64
}
