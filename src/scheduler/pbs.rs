//! PBS Professional.

use std::path::Path;

use super::runner::{Binaries, Executables, Invocation};
use super::{format_hms, QueryContext, SchedulerDialect};
use crate::config::SchedulerConfig;

/// `qstat` truncates job names to this many characters.
pub const QSTAT_NAME_WIDTH: usize = 15;

#[derive(Debug, Clone, Copy, Default)]
pub struct Pbs;

/// Names from a comma-separated list whose variable is set and non-empty.
pub fn propagated_vars<F>(envvars: &str, lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    envvars
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter(|name| lookup(*name).is_some_and(|value| !value.is_empty()))
        .map(str::to_string)
        .collect()
}

fn truncated(jobname: &str) -> &str {
    match jobname.char_indices().nth(QSTAT_NAME_WIDTH) {
        Some((idx, _)) => &jobname[..idx],
        None => jobname,
    }
}

impl SchedulerDialect for Pbs {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn executables(&self) -> Executables {
        Executables {
            submit: "qsub",
            status: "qstat",
            cancel: "qdel",
            info: None,
        }
    }

    fn requires_queue(&self) -> bool {
        false
    }

    fn directives(&self, config: &SchedulerConfig, jobname: &str, _workdir: &Path) -> Vec<String> {
        let mut select = format!(
            "#PBS -l select=1:ncpus={}:ngpus={}:mem={}MB",
            config.ncpu, config.ngpu, config.memory
        );
        if let Some(scratch) = config.pbs.scratch_local {
            select.push_str(&format!(":scratch_local={}MB", scratch));
        }
        if let Some(cluster) = &config.pbs.cluster {
            select.push_str(&format!(":cl_{}=True", cluster));
        }

        let mut lines = vec![format!("#PBS -N {}", jobname), select];
        if let Some(queue) = config.queues.first() {
            if config.queues.len() > 1 {
                tracing::warn!(queue = %queue, "PBS submits to a single queue, using the first");
            }
            lines.push(format!("#PBS -q {}", queue));
        }
        if let Some(walltime) = config.walltime {
            lines.push(format!("#PBS -l walltime={}", format_hms(walltime)));
        }
        if let Some(envvars) = &config.envvars {
            let vars = propagated_vars(envvars, |name| std::env::var(name).ok());
            if !vars.is_empty() {
                lines.push(format!("#PBS -v {}", vars.join(",")));
            }
        }
        lines
    }

    fn submit(&self, binaries: &Binaries, jobscript: &Path) -> Invocation {
        Invocation::new(&binaries.submit).arg(jobscript.display().to_string())
    }

    fn job_id(&self, stdout: &str) -> Option<String> {
        stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    fn status(&self, ctx: &QueryContext<'_>) -> Vec<Invocation> {
        let mut query = Invocation::new(&ctx.binaries.status).args(["-u", ctx.user]);
        if let Some(queue) = ctx.config.queues.first() {
            query = query.arg(queue.as_str());
        }
        vec![query]
    }

    fn count(&self, stdout: &str, jobname: &str) -> usize {
        let name = truncated(jobname);
        stdout
            .lines()
            .filter(|line| line.split_whitespace().any(|field| field == name))
            .count()
    }

    fn cancel(&self, ctx: &QueryContext<'_>) -> Vec<Invocation> {
        ctx.job_ids
            .iter()
            .map(|id| Invocation::new(&ctx.binaries.cancel).arg(id.as_str()))
            .collect()
    }
}
