//! IBM Spectrum LSF.

use std::path::Path;

use super::runner::{Binaries, Executables, Invocation};
use super::{count_result_lines, QueryContext, SchedulerDialect};
use crate::config::{GpuMode, LsfGpuOptions, LsfVersion, SchedulerConfig};

#[derive(Debug, Clone, Copy, Default)]
pub struct Lsf;

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// `-gpu` requirement string for LSF 10, defaulting to exclusive-process mode.
pub fn gpu_requirement(ngpu: u32, options: &LsfGpuOptions) -> String {
    let mode = match options.mode {
        Some(GpuMode::Shared) => "shared",
        Some(GpuMode::ExclusiveProcess) | None => "exclusive_process",
    };
    let mut parts = vec![format!("num={}", ngpu), format!("mode={}", mode)];
    if let Some(mps) = options.mps {
        parts.push(format!("mps={}", yes_no(mps)));
    }
    if let Some(j_exclusive) = options.j_exclusive {
        parts.push(format!("j_exclusive={}", yes_no(j_exclusive)));
    }
    parts.join(":")
}

/// `-W` takes `[hours:]minutes`; partial minutes round up.
fn walltime_minutes(walltime: std::time::Duration) -> String {
    let minutes = walltime.as_secs().div_ceil(60).max(1);
    format!("{}:{:02}", minutes / 60, minutes % 60)
}

impl SchedulerDialect for Lsf {
    fn name(&self) -> &'static str {
        "lsf"
    }

    fn executables(&self) -> Executables {
        Executables {
            submit: "bsub",
            status: "bjobs",
            cancel: "bkill",
            info: Some("bqueues"),
        }
    }

    fn directives(&self, config: &SchedulerConfig, jobname: &str, workdir: &Path) -> Vec<String> {
        let workdir = workdir.display();
        let mut lines = vec![
            format!("#BSUB -J {}", jobname),
            format!("#BSUB -q \"{}\"", config.queues.join(" ")),
            format!("#BSUB -n {}", config.ncpu),
        ];
        if let Some(app) = &config.lsf.app {
            lines.push(format!("#BSUB -app {}", app));
        }
        if config.ngpu != 0 {
            match config.lsf.version {
                LsfVersion::V9 => {
                    if !config.lsf.gpu_options.is_empty() {
                        tracing::warn!("GPU options are ignored by LSF 9");
                    }
                    lines.push(format!(
                        "#BSUB -R \"select[ngpus>0] rusage[ngpus_excl_p={}]\"",
                        config.ngpu
                    ));
                }
                LsfVersion::V10 => lines.push(format!(
                    "#BSUB -gpu \"{}\"",
                    gpu_requirement(config.ngpu, &config.lsf.gpu_options)
                )),
            }
        }
        for resource in &config.resources {
            lines.push(format!("#BSUB -R \"{}\"", resource));
        }
        // LSF limits memory in KB
        lines.push(format!("#BSUB -M {}", config.memory * 1024));
        lines.push(format!("#BSUB -cwd {}", workdir));
        lines.push(format!("#BSUB -outdir {}", workdir));
        if let Some(out) = &config.outputstream {
            lines.push(format!("#BSUB -o {}", out));
        }
        if let Some(err) = &config.errorstream {
            lines.push(format!("#BSUB -e {}", err));
        }
        if let Some(envvars) = &config.envvars {
            lines.push(format!("#BSUB --env {}", envvars));
        }
        if let Some(walltime) = config.walltime {
            lines.push(format!("#BSUB -W {}", walltime_minutes(walltime)));
        }
        lines
    }

    fn submit(&self, binaries: &Binaries, jobscript: &Path) -> Invocation {
        Invocation::new(&binaries.submit).stdin(jobscript)
    }

    fn status(&self, ctx: &QueryContext<'_>) -> Vec<Invocation> {
        ctx.config
            .queues
            .iter()
            .map(|queue| {
                Invocation::new(&ctx.binaries.status).args([
                    "-J",
                    ctx.jobname,
                    "-u",
                    ctx.user,
                    "-q",
                    queue.as_str(),
                ])
            })
            .collect()
    }

    fn count(&self, stdout: &str, _jobname: &str) -> usize {
        count_result_lines(stdout, 1)
    }

    fn cancel(&self, ctx: &QueryContext<'_>) -> Vec<Invocation> {
        let base = Invocation::new(&ctx.binaries.cancel).args(["-J", ctx.jobname, "-u", ctx.user]);
        if ctx.config.queues.is_empty() {
            return vec![base];
        }
        ctx.config
            .queues
            .iter()
            .map(|queue| base.clone().args(["-q", queue.as_str()]))
            .collect()
    }
}
