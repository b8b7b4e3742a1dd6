use std::process::Command;

use anyhow::Context as _;
use camino::Utf8Path;

use crate::cluster::{RunMode, Submission};
use crate::error::WorkflowError;
use crate::params::Params;
use crate::target::{Storage, TargetRef};
use crate::task::TaskRef;

/// The context passed to a task body while it runs.
///
/// It exposes the task's parameters, the targets bound to its ports, the
/// storage those targets live in, and a helper for running shell commands
/// which honors the task's cluster submission annotation.
pub struct RunContext<'a> {
    pub(crate) task: TaskRef<'a>,
    pub(crate) storage: &'a dyn Storage,
    pub(crate) workdir: Option<&'a Utf8Path>,
    /// Tracing span assigned to this task.
    pub(crate) span: tracing::Span,
}

impl<'a> RunContext<'a> {
    pub fn task(&self) -> TaskRef<'a> {
        self.task
    }

    pub fn name(&self) -> &'a str {
        self.task.name()
    }

    pub fn params(&self) -> &'a Params {
        self.task.params()
    }

    pub fn storage(&self) -> &'a dyn Storage {
        self.storage
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn input(&self, port: &str) -> Result<TargetRef, WorkflowError> {
        self.task.input(port)
    }

    pub fn inputs(&self, port: &str) -> Result<Vec<TargetRef>, WorkflowError> {
        self.task.inputs(port)
    }

    pub fn output(&self, port: &str) -> Result<TargetRef, WorkflowError> {
        self.task.output(port)
    }

    /// Reads the artifact bound to the input `port` as UTF-8 text.
    pub fn read_input(&self, port: &str) -> anyhow::Result<String> {
        let target = self.input(port)?;
        Ok(target.read_to_string(self.storage)?)
    }

    /// Writes `data` to the artifact of the output `port`.
    pub fn write_output(&self, port: &str, data: impl AsRef<[u8]>) -> anyhow::Result<()> {
        let target = self.output(port)?;
        target.write(self.storage, data)?;
        Ok(())
    }

    /// Runs `command` through `sh -c` and returns its standard output.
    ///
    /// In HPC mode the command is prefixed with the job queue allocation from
    /// the task's [`Submission`]. A non-zero exit status is an error carrying
    /// the captured standard error.
    pub fn execute(&self, command: &str) -> anyhow::Result<String> {
        let command = match self.task.submission() {
            Some(submission) => self.wrap(submission, command),
            None => command.to_string(),
        };

        tracing::info!(task = self.name(), %command, "executing command");

        let mut process = Command::new("sh");
        process.arg("-c").arg(&command);

        if let Some(dir) = self.workdir {
            process.current_dir(dir);
        }

        let output = process
            .output()
            .with_context(|| format!("Couldn't start command: {command}"))?;

        if !output.status.success() {
            anyhow::bail!(
                "Command failed with {}: {}\n{}",
                output.status,
                command,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn wrap(&self, submission: &Submission, command: &str) -> String {
        if submission.mode == RunMode::MockHpc {
            tracing::info!(
                task = self.name(),
                prefix = %submission.command_prefix(),
                "mock HPC mode, running locally"
            );
        }

        submission.wrap(command)
    }
}
