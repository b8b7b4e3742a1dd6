use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::WorkflowError;
use crate::params::Params;
use crate::port::OutputRef;
use crate::target::TargetRef;
use crate::task::{TaskId, TaskNode, TaskRef, TaskType};

/// Source of run identities, so handles never alias across registries.
static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

/// Tasks registered during one run, addressable by id and by name.
///
/// A registry is owned by exactly one [`Blueprint`](crate::Blueprint) and
/// later by the resolved [`Graph`](crate::Graph). There is no process-wide
/// registry, so independent runs never see each other's names.
pub struct Registry {
    run: u64,
    nodes: Vec<TaskNode>,
    names: HashMap<Arc<str>, TaskId>,
    /// Targets of output ports evaluated so far. Cleared whenever a binding
    /// changes.
    targets: Mutex<HashMap<OutputRef, TargetRef>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            run: NEXT_RUN.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            names: HashMap::new(),
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(
        &mut self,
        name: &str,
        kind: Arc<TaskType>,
        params: Params,
    ) -> Result<TaskId, WorkflowError> {
        if self.names.contains_key(name) {
            return Err(WorkflowError::DuplicateName(name.to_string()));
        }

        let id = TaskId::new(self.run, self.nodes.len())
            .ok_or_else(|| WorkflowError::Capacity(self.nodes.len()))?;
        let name: Arc<str> = name.into();

        self.nodes.push(TaskNode::new(name.clone(), kind, params));
        self.names.insert(name, id);

        Ok(id)
    }

    /// Whether `id` was issued by this registry.
    pub fn contains(&self, id: TaskId) -> bool {
        id.run == self.run && id.index() < self.nodes.len()
    }

    pub fn task(&self, id: TaskId) -> Option<TaskRef<'_>> {
        if !self.contains(id) {
            return None;
        }

        Some(TaskRef {
            registry: self,
            id,
            node: &self.nodes[id.index()],
        })
    }

    /// Looks a task up by its unique name.
    pub fn find(&self, name: &str) -> Option<TaskRef<'_>> {
        self.names.get(name).and_then(|&id| self.task(id))
    }

    pub(crate) fn node_mut(&mut self, id: TaskId) -> Option<&mut TaskNode> {
        if !self.contains(id) {
            return None;
        }

        self.targets
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        self.nodes.get_mut(id.index())
    }

    pub(crate) fn cached(&self, output: &OutputRef) -> Option<TargetRef> {
        self.lock_targets().get(output).cloned()
    }

    pub(crate) fn cache(&self, output: OutputRef, target: TargetRef) {
        self.lock_targets().insert(output, target);
    }

    fn lock_targets(&self) -> MutexGuard<'_, HashMap<OutputRef, TargetRef>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All tasks in registration order.
    pub fn iter(&self) -> impl Iterator<Item = TaskRef<'_>> {
        self.nodes.iter().zip(0u32..).map(move |(node, index)| TaskRef {
            registry: self,
            id: TaskId {
                run: self.run,
                index,
            },
            node,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
