//! Job script generation.
//!
//! Every backend runs the same body: a trap that touches the completion
//! sentinel on exit, an optional device export, `cd` into the job directory,
//! the run command, and an optional move of outputs into the data directory.
//! External schedulers prepend their directive block.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::ScriptConfig;
use crate::error::Result;
use crate::queue::registry::sentinel_path;
use crate::queue::Device;

/// Environment variable restricting a job to its GPU.
pub const DEVICE_VISIBILITY_VAR: &str = "CUDA_VISIBLE_DEVICES";

#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputCollection {
    target: PathBuf,
    patterns: Vec<String>,
}

/// Description of one job script.
#[derive(Debug, Clone)]
pub struct JobScript {
    workdir: PathBuf,
    command: String,
    device: Option<Device>,
    directives: Vec<String>,
    prerun: Vec<String>,
    collect: Option<OutputCollection>,
}

impl JobScript {
    /// `workdir` must be absolute.
    pub fn new(workdir: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            command: command.into(),
            device: None,
            directives: Vec::new(),
            prerun: Vec::new(),
            collect: None,
        }
    }

    /// Build the script for `workdir` with the output collection of `config`.
    pub fn from_config(workdir: &Path, command: &str, config: &ScriptConfig) -> Self {
        let script = Self::new(workdir, command);
        match &config.datadir {
            Some(datadir) => script.collect_into(datadir, config.copy.clone()),
            None => script,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Scheduler directive lines, written verbatim after the interpreter line.
    pub fn with_directives(mut self, directives: Vec<String>) -> Self {
        self.directives = directives;
        self
    }

    /// Shell commands run before changing into the job directory.
    pub fn with_prerun(mut self, prerun: Vec<String>) -> Self {
        self.prerun = prerun;
        self
    }

    /// Move files matching `patterns` into `<datadir>/<job basename>/` once
    /// the run command returns. Relative data directories are resolved
    /// against the current directory.
    pub fn collect_into(mut self, datadir: &Path, patterns: Vec<String>) -> Self {
        let datadir = std::path::absolute(datadir).unwrap_or_else(|_| datadir.to_path_buf());
        let target = match self.workdir.file_name() {
            Some(name) => datadir.join(name),
            None => datadir,
        };
        self.collect = if target == self.workdir || patterns.is_empty() {
            None
        } else {
            Some(OutputCollection { target, patterns })
        };
        self
    }

    pub fn sentinel(&self) -> PathBuf {
        sentinel_path(&self.workdir)
    }

    /// Directory outputs are moved into, if any.
    pub fn collection_target(&self) -> Option<&Path> {
        self.collect.as_ref().map(|c| c.target.as_path())
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#!/bin/bash\n");

        if !self.directives.is_empty() {
            out.push_str("#\n");
            for directive in &self.directives {
                out.push_str(directive);
                out.push('\n');
            }
        }

        let touch = format!(
            "touch {}",
            shell_quote(&self.sentinel().display().to_string())
        );
        out.push_str(&format!("\ntrap {} EXIT SIGTERM\n\n", shell_quote(&touch)));

        for call in &self.prerun {
            out.push_str(call);
            out.push('\n');
        }

        if let Some(index) = self.device.and_then(Device::gpu_index) {
            out.push_str(&format!("export {}={}\n\n", DEVICE_VISIBILITY_VAR, index));
        }

        out.push_str(&format!(
            "cd {}\n",
            shell_quote(&self.workdir.display().to_string())
        ));
        out.push_str(&self.command);
        out.push('\n');

        if let Some(collect) = &self.collect {
            out.push_str(&format!(
                "\nmv {} {}\n",
                collect.patterns.join(" "),
                shell_quote(&collect.target.display().to_string())
            ));
        }

        out
    }

    /// Write the script to `path` with owner-only permissions, creating the
    /// output collection directory first.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(target) = self.collection_target() {
            std::fs::create_dir_all(target)?;
        }
        std::fs::write(path, self.render())?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
        Ok(())
    }
}

/// Quote `s` for a POSIX shell unless it only contains safe characters.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./,:@%+=".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
