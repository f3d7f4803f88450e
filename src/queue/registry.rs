//! Filesystem-side completion tracking.
//!
//! Every generated job script touches [`SENTINEL`] in its job directory when
//! it exits, so completion can be observed without asking any backend.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::unistd::{access, AccessFlags};

use crate::error::{QueueError, Result};
use crate::script::shell_quote;

/// File name of the per-directory completion marker.
pub const SENTINEL: &str = "jobqueues.done";

pub fn sentinel_path(dir: &Path) -> PathBuf {
    dir.join(SENTINEL)
}

pub fn is_done(dir: &Path) -> bool {
    sentinel_path(dir).exists()
}

/// Remove a stale sentinel so a rerun is not reported complete immediately.
pub fn clear_sentinel(dir: &Path) {
    let path = sentinel_path(dir);
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(&path) {
        Ok(()) => tracing::debug!(dir = %dir.display(), "Removed existing {} sentinel", SENTINEL),
        Err(e) => tracing::warn!(
            dir = %dir.display(),
            error = %e,
            "Could not remove {} sentinel",
            SENTINEL
        ),
    }
}

/// Absolute form of every directory, failing on the first one that is missing.
pub fn resolve_dirs<P: AsRef<Path>>(dirs: &[P]) -> Result<Vec<PathBuf>> {
    dirs.iter()
        .map(|d| {
            let d = d.as_ref();
            if !d.is_dir() {
                return Err(QueueError::DirectoryNotFound(d.to_path_buf()));
            }
            Ok(std::path::absolute(d)?)
        })
        .collect()
}

/// Locate the run script of `dir` and check that it can be executed.
pub fn resolve_run_script(dir: &Path, runscript: &str) -> Result<PathBuf> {
    let script = dir.join(runscript);
    if !script.is_file() {
        return Err(QueueError::RunScriptMissing(script));
    }
    if access(&script, AccessFlags::X_OK).is_err() {
        return Err(QueueError::RunScriptNotExecutable(script));
    }
    Ok(script)
}

/// Commands for each directory: the caller's overrides, or each directory's
/// run script quoted for the shell. Every check happens before anything is
/// queued.
pub fn resolve_commands(
    dirs: &[PathBuf],
    commands: Option<&[String]>,
    runscript: &str,
) -> Result<Vec<String>> {
    match commands {
        Some(commands) if commands.len() != dirs.len() => Err(QueueError::CommandCountMismatch {
            dirs: dirs.len(),
            commands: commands.len(),
        }),
        Some(commands) => Ok(commands.to_vec()),
        None => dirs
            .iter()
            .map(|d| {
                resolve_run_script(d, runscript).map(|p| shell_quote(&p.display().to_string()))
            })
            .collect(),
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    dirs: Vec<PathBuf>,
    reported: HashSet<PathBuf>,
}

/// Ordered set of every directory a queue instance has been given.
///
/// Used to count unfinished work from sentinel files and, for backends
/// without their own completion feed, to report newly finished directories.
#[derive(Debug, Default)]
pub struct DirectoryRegistry {
    inner: Mutex<RegistryInner>,
}

impl DirectoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record directories. Re-registering a directory keeps its original
    /// position and makes it reportable again.
    pub fn register(&self, dirs: &[PathBuf]) {
        let mut inner = self.lock();
        for dir in dirs {
            inner.reported.remove(dir);
            if !inner.dirs.contains(dir) {
                inner.dirs.push(dir.clone());
            }
        }
    }

    pub fn dirs(&self) -> Vec<PathBuf> {
        self.lock().dirs.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().dirs.is_empty()
    }

    /// Number of registered directories without a sentinel file.
    pub fn not_completed(&self) -> usize {
        self.lock().dirs.iter().filter(|d| !is_done(d)).count()
    }

    /// Directories whose sentinel appeared since the previous call.
    pub fn drain_finished(&self) -> Vec<PathBuf> {
        let mut inner = self.lock();
        let finished: Vec<PathBuf> = inner
            .dirs
            .iter()
            .filter(|d| !inner.reported.contains(*d) && is_done(d))
            .cloned()
            .collect();
        inner.reported.extend(finished.iter().cloned());
        finished
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // The registry holds plain data; a poisoned lock still has a usable value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
