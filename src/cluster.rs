//! Cluster submission annotation.
//!
//! A task can be annotated with a [`Submission`] describing how its commands
//! should be sent through a job queue. Graph resolution never looks inside the
//! annotation, it only carries it through to the plan and the run context.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run commands directly on the local machine.
    #[default]
    Local,
    /// Submit commands through the job queue.
    Hpc,
    /// Log the job queue prefix but run locally, for testing HPC workflows.
    MockHpc,
}

/// Job queue settings for a single task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub mode: RunMode,
    pub project: String,
    pub partition: String,
    pub cores: u32,
    /// Wall time in the queue's `d-hh:mm:ss` notation.
    pub time: String,
    pub job_name: String,
    pub threads: u32,
}

impl Submission {
    pub fn new(project: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            mode: RunMode::Hpc,
            project: project.into(),
            partition: "core".into(),
            cores: 1,
            time: "01:00:00".into(),
            job_name: job_name.into(),
            threads: 1,
        }
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    pub fn time(mut self, time: impl Into<String>) -> Self {
        self.time = time.into();
        self
    }

    pub fn threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    /// The allocation prefix placed in front of a command.
    pub fn command_prefix(&self) -> String {
        format!(
            "salloc -A {} -p {} -n {} -t {} -J {} srun -n 1 -c {}",
            self.project, self.partition, self.cores, self.time, self.job_name, self.threads
        )
    }

    /// Wraps `command` for the configured mode.
    pub fn wrap(&self, command: &str) -> String {
        match self.mode {
            RunMode::Hpc => format!("{} {}", self.command_prefix(), command),
            RunMode::Local | RunMode::MockHpc => command.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_by_mode() {
        let sub = Submission::new("proj123", "align").cores(4).threads(4);

        assert_eq!(
            sub.wrap("echo hi"),
            "salloc -A proj123 -p core -n 4 -t 01:00:00 -J align srun -n 1 -c 4 echo hi"
        );
        assert_eq!(sub.clone().mode(RunMode::MockHpc).wrap("echo hi"), "echo hi");
        assert_eq!(sub.mode(RunMode::Local).wrap("echo hi"), "echo hi");
    }
}
