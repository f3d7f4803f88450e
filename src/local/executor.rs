use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::ScriptConfig;
use crate::queue::registry::sentinel_path;
use crate::queue::{Device, RunOutcome};
use crate::script::JobScript;

/// Result of running one job script
#[derive(Debug)]
pub struct ExecutionResult {
    pub dir: PathBuf,
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Writes a job's script bound to a device and runs it as a child process.
///
/// The child is not killed when the future is dropped, so a worker that
/// stops mid-run leaves it to finish on its own.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    config: ScriptConfig,
}

impl JobExecutor {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }

    pub fn jobscript_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.config.jobscript)
    }

    /// Run `command` inside `dir` on `device`.
    pub async fn execute(&self, dir: &Path, command: &str, device: Device) -> ExecutionResult {
        let jobscript = self.jobscript_path(dir);
        let script = JobScript::from_config(dir, command, &self.config).with_device(device);
        if let Err(e) = script.write(&jobscript) {
            return Self::launch_failed(dir, format!("could not write job script: {}", e));
        }

        tracing::debug!(dir = %dir.display(), script = %jobscript.display(), "Launching job script");

        let result = Command::new(&jobscript)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) => Self::process_output(dir, output),
            Err(e) => Self::launch_failed(dir, e.to_string()),
        }
    }

    fn process_output(dir: &Path, output: std::process::Output) -> ExecutionResult {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        let (outcome, error) = if output.status.success() {
            (RunOutcome::Succeeded, None)
        } else {
            let reason = if stderr.is_empty() {
                format!("Exit code: {:?}", exit_code)
            } else {
                stderr.clone()
            };
            (
                RunOutcome::Failed {
                    exit_code,
                    reason: reason.clone(),
                },
                Some(reason),
            )
        };

        ExecutionResult {
            dir: dir.to_path_buf(),
            outcome,
            exit_code,
            output: if stdout.is_empty() {
                None
            } else {
                Some(stdout)
            },
            error,
        }
    }

    /// The script never ran, so its trap never fired: mark the directory
    /// done ourselves so sentinel-based waiting does not hang on it.
    fn launch_failed(dir: &Path, reason: String) -> ExecutionResult {
        if let Err(e) = std::fs::write(sentinel_path(dir), b"") {
            tracing::warn!(dir = %dir.display(), error = %e, "Could not create sentinel");
        }
        ExecutionResult {
            dir: dir.to_path_buf(),
            outcome: RunOutcome::Failed {
                exit_code: None,
                reason: reason.clone(),
            },
            exit_code: None,
            output: None,
            error: Some(reason),
        }
    }
}
