use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::queue::{CompletedJob, Device, Job, QueueState, RunOutcome};

/// Path-keyed job state shared by the caller and the workers.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<PathBuf, Job>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job. Returns false if its directory is already queued or
    /// running, so a directory is never handed to two workers.
    pub fn enqueue(&mut self, job: Job) -> bool {
        if self.is_active(&job.dir) {
            return false;
        }
        self.jobs.insert(job.dir.clone(), job);
        true
    }

    pub fn get(&self, dir: &Path) -> Option<&Job> {
        self.jobs.get(dir)
    }

    pub fn state(&self, dir: &Path) -> Option<QueueState> {
        self.jobs.get(dir).map(|j| j.state)
    }

    pub fn is_active(&self, dir: &Path) -> bool {
        self.state(dir).is_some_and(QueueState::is_in_progress)
    }

    /// `Queued -> Running`. Returns false for any other starting state.
    pub fn mark_running(&mut self, dir: &Path, device: Device) -> bool {
        match self.jobs.get_mut(dir) {
            Some(job) if job.state == QueueState::Queued => {
                job.state = QueueState::Running;
                job.device = Some(device);
                true
            }
            _ => false,
        }
    }

    /// `Running -> Completed`, whatever the outcome of the run.
    pub fn mark_completed(&mut self, dir: &Path, outcome: RunOutcome) -> bool {
        match self.jobs.get_mut(dir) {
            Some(job) if job.state == QueueState::Running => {
                job.state = QueueState::Completed;
                job.outcome = Some(outcome);
                job.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Jobs queued or running.
    pub fn in_progress(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.state.is_in_progress())
            .count()
    }

    pub fn running(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.state == QueueState::Running)
            .count()
    }

    /// Remove and return completed jobs, oldest completion first.
    pub fn drain_completed(&mut self) -> Vec<CompletedJob> {
        let done: Vec<PathBuf> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.state == QueueState::Completed)
            .map(|(dir, _)| dir.clone())
            .collect();

        let mut completed: Vec<CompletedJob> = done
            .into_iter()
            .filter_map(|dir| self.jobs.remove(&dir))
            .map(|job| CompletedJob {
                dir: job.dir,
                outcome: job.outcome.unwrap_or(RunOutcome::Unknown),
                finished_at: job.completed_at.unwrap_or_else(Utc::now),
            })
            .collect();
        completed.sort_by_key(|c| c.finished_at);
        completed
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
