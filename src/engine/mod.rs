//! The boundary between resolved graphs and the engines executing them.
//!
//! An engine only needs two answers from every task: what it depends on and
//! what it produces. [`EngineTask`] provides both by delegating to the
//! port-derived [`TaskRef::dependencies`] and [`TaskRef::artifacts`].

mod context;
mod remote;
mod runner;

use crate::error::{BindingError, RunError, WorkflowError};
use crate::resolver::Graph;
use crate::target::{Storage, TargetRef};
use crate::task::{TaskId, TaskRef};

pub use crate::engine::context::RunContext;
pub use crate::engine::remote::RemoteEngine;
pub use crate::engine::runner::{Audit, AuditRecord, LocalEngine, Status};

/// Something able to execute a resolved graph.
pub trait Engine {
    fn execute(&self, graph: &Graph) -> Result<Report, RunError>;
}

/// Outcome of handing a graph to an engine.
#[derive(Debug, Default)]
pub struct Report {
    /// Per-task records, empty when execution happens elsewhere.
    pub audit: Audit,
}

/// The shape an engine expects from a task.
pub trait EngineTask {
    /// Tasks that must be complete before this one can run.
    fn requires(&self) -> Result<Vec<TaskId>, BindingError>;

    /// Artifacts this task produces.
    fn produces(&self) -> Result<Vec<TargetRef>, WorkflowError>;

    /// A task is complete when every artifact exists in `storage`.
    fn complete(&self, storage: &dyn Storage) -> Result<bool, RunError> {
        for target in self.produces()? {
            if !target.exists(storage)? {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

impl EngineTask for TaskRef<'_> {
    fn requires(&self) -> Result<Vec<TaskId>, BindingError> {
        self.dependencies()
    }

    fn produces(&self) -> Result<Vec<TargetRef>, WorkflowError> {
        self.artifacts()
    }
}
