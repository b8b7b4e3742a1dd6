use std::fmt::{self, Display};

use thiserror::Error;

/// The direction of a port, used when reporting unknown or mismatched ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// A required input port was never connected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("task '{task}': required input port '{port}' is not bound")]
pub struct BindingError {
    pub task: String,
    pub port: String,
}

/// The port bindings form a directed cycle.
///
/// `path` lists the task names along the cycle, with the first task repeated
/// at the end, e.g. `["A", "B", "A"]`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cycle detected in task graph: {}", .path.join(" -> "))]
pub struct CycleError {
    pub path: Vec<String>,
}

/// Structural inconsistency discovered while wiring or resolving a graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphValidationError {
    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error("task '{task}': port '{port}' is bound to a task that is not registered in this run")]
    ForeignTask { task: String, port: String },

    #[error("task '{task}' has no {direction} port named '{port}'")]
    UnknownPort {
        task: String,
        port: String,
        direction: Direction,
    },

    #[error("task '{task}': port '{port}' is a {actual} port, expected {expected}")]
    PortKind {
        task: String,
        port: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("task '{0}' is not registered in this run")]
    UnknownTask(String),

    #[error("terminal task is not registered in this run")]
    ForeignTerminal,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("task name '{0}' is already used in this run")]
    DuplicateName(String),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Validation(#[from] GraphValidationError),

    #[error("task '{task}': output port '{port}' failed to produce a target:\n{source}")]
    Output {
        task: String,
        port: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("workflow definition failed:\n{0}")]
    Definition(anyhow::Error),

    #[error("a run cannot hold more than {0} tasks")]
    Capacity(usize),
}

impl From<BindingError> for WorkflowError {
    fn from(err: BindingError) -> Self {
        WorkflowError::Validation(err.into())
    }
}

impl WorkflowError {
    /// Returns the binding error if this is one.
    pub fn as_binding(&self) -> Option<&BindingError> {
        match self {
            WorkflowError::Validation(GraphValidationError::Binding(err)) => Some(err),
            _ => None,
        }
    }
}

/// A storage collaborator failed while handling a target.
#[derive(Debug, Error)]
#[error("target '{target}': {source}")]
pub struct StorageError {
    pub target: String,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error("Task '{task}' is missing artifact '{target}'")]
    MissingArtifact { task: String, target: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to hand off plan to '{0}':\n{1}")]
    Remote(String, std::io::Error),

    #[error("Failed to serialize plan:\n{0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}':\n{1}")]
    Read(String, std::io::Error),

    #[error("Couldn't parse config file '{0}':\n{1}")]
    Parse(String, serde_json::Error),

    #[error("Invalid log level '{0}'")]
    LogLevel(String),

    #[error("Worker count must be at least 1")]
    Workers,
}
