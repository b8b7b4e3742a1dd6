use serde::{Deserialize, Serialize};

use crate::cluster::Submission;
use crate::error::WorkflowError;
use crate::params::Params;
use crate::resolver::Graph;
use crate::target::TargetRef;

/// Serializable hand-off of a resolved graph to an execution engine.
///
/// Tasks are listed in topological order. Each entry carries exactly what an
/// engine needs: what the task depends on and what it produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<PlannedTask>,
    pub terminals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub name: String,
    pub kind: String,
    pub params: Params,
    pub dependencies: Vec<String>,
    pub artifacts: Vec<TargetRef>,
    pub external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<Submission>,
}

impl Plan {
    /// Evaluates every output port of the graph and collects the plan.
    pub fn from_graph(graph: &Graph) -> Result<Self, WorkflowError> {
        let mut tasks = Vec::with_capacity(graph.len());

        for task in graph.tasks() {
            let dependencies = graph
                .dependencies(task.id())
                .into_iter()
                .filter_map(|id| graph.task(id))
                .map(|dep| dep.name().to_string())
                .collect();

            tasks.push(PlannedTask {
                name: task.name().to_string(),
                kind: task.kind().name().to_string(),
                params: task.params().clone(),
                dependencies,
                artifacts: task.artifacts()?,
                external: task.kind().is_external(),
                submission: task.submission().cloned(),
            });
        }

        let terminals = graph
            .terminals()
            .iter()
            .filter_map(|&id| graph.task(id))
            .map(|task| task.name().to_string())
            .collect();

        Ok(Plan { tasks, terminals })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
