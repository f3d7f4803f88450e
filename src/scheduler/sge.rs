//! Sun / Univa Grid Engine.

use std::path::Path;

use super::runner::{Binaries, Executables, Invocation};
use super::{count_result_lines, format_hms, QueryContext, SchedulerDialect};
use crate::config::SchedulerConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct Sge;

impl Sge {
    fn per_queue(program: &Path, ctx: &QueryContext<'_>) -> Vec<Invocation> {
        ctx.config
            .queues
            .iter()
            .map(|queue| {
                Invocation::new(program).args([
                    "-N",
                    ctx.jobname,
                    "-u",
                    ctx.user,
                    "-q",
                    queue.as_str(),
                ])
            })
            .collect()
    }
}

impl SchedulerDialect for Sge {
    fn name(&self) -> &'static str {
        "sge"
    }

    fn executables(&self) -> Executables {
        Executables {
            submit: "qsub",
            status: "qstat",
            cancel: "qdel",
            info: Some("qhost"),
        }
    }

    fn directives(&self, config: &SchedulerConfig, jobname: &str, workdir: &Path) -> Vec<String> {
        let mut lines = vec![
            format!("#$ -N {}", jobname),
            format!("#$ -q \"{}\"", config.queues.join(",")),
            format!("#$ -pe thread {}", config.ncpu),
            format!("#$ -l ngpus={}", config.ngpu),
            format!("#$ -l h_vmem={}M", config.memory),
            format!("#$ -wd {}", workdir.display()),
        ];
        if let Some(out) = &config.outputstream {
            lines.push(format!("#$ -o {}", out));
        }
        if let Some(err) = &config.errorstream {
            lines.push(format!("#$ -e {}", err));
        }
        if let Some(envvars) = &config.envvars {
            lines.push(format!("#$ -v {}", envvars));
        }
        if let Some(walltime) = config.walltime {
            lines.push(format!("#$ -l h_rt={}", format_hms(walltime)));
        }
        lines
    }

    fn submit(&self, binaries: &Binaries, jobscript: &Path) -> Invocation {
        Invocation::new(&binaries.submit).stdin(jobscript)
    }

    fn status(&self, ctx: &QueryContext<'_>) -> Vec<Invocation> {
        Self::per_queue(&ctx.binaries.status, ctx)
    }

    /// `qstat` prints a column header and a dashed rule.
    fn count(&self, stdout: &str, _jobname: &str) -> usize {
        count_result_lines(stdout, 2)
    }

    fn cancel(&self, ctx: &QueryContext<'_>) -> Vec<Invocation> {
        Self::per_queue(&ctx.binaries.cancel, ctx)
    }
}
