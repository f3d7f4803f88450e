use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{QueueError, Result};

/// Names of the executables a scheduler is driven through.
#[derive(Debug, Clone, Copy)]
pub struct Executables {
    pub submit: &'static str,
    pub status: &'static str,
    pub cancel: &'static str,
    /// Cluster information tool; only checked for presence.
    pub info: Option<&'static str>,
}

/// Executables located on `PATH`.
#[derive(Debug, Clone)]
pub struct Binaries {
    pub submit: PathBuf,
    pub status: PathBuf,
    pub cancel: PathBuf,
    pub info: Option<PathBuf>,
}

impl Binaries {
    /// Locate every executable, failing on the first one missing.
    pub fn discover(executables: &Executables) -> Result<Self> {
        Ok(Self {
            submit: find_binary(executables.submit)?,
            status: find_binary(executables.status)?,
            cancel: find_binary(executables.cancel)?,
            info: executables.info.map(find_binary).transpose()?,
        })
    }

    /// Bare names, left for the runner to resolve.
    pub fn unresolved(executables: &Executables) -> Self {
        Self {
            submit: PathBuf::from(executables.submit),
            status: PathBuf::from(executables.status),
            cancel: PathBuf::from(executables.cancel),
            info: executables.info.map(PathBuf::from),
        }
    }
}

fn find_binary(name: &str) -> Result<PathBuf> {
    let path = which::which(name).map_err(|source| QueueError::ExecutableNotFound {
        name: name.to_string(),
        source,
    })?;
    tracing::debug!(name, path = %path.display(), "Found executable");
    Ok(path)
}

/// One scheduler command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File fed to the command's standard input
    pub stdin: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(stdin) = &self.stdin {
            write!(f, " < {}", stdin.display())?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Human-readable reason for a failed command.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("Exit code: {:?}", self.code)
        } else {
            stderr.to_string()
        }
    }
}

/// Runs scheduler executables.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<CommandOutput>;
}

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
        let stdin = match &invocation.stdin {
            Some(path) => Stdio::from(std::fs::File::open(path)?),
            None => Stdio::null(),
        };
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
