//! Graph resolution.
//!
//! Starting from the terminal tasks, the resolver walks the dependency
//! relation derived from port bindings, checks that every required port is
//! bound and that no cycle exists, and produces an immutable [`Graph`]. The
//! result is all-or-nothing: on any error no graph is returned.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write};

use petgraph::Direction as EdgeDirection;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{CycleError, Direction, GraphValidationError, WorkflowError};
use crate::registry::Registry;
use crate::task::{TaskId, TaskRef};

/// A resolved, acyclic, fully bound task graph.
///
/// Nodes are the tasks reachable from the terminals; edges point from a
/// consumer to the producer it depends on.
pub struct Graph {
    registry: Registry,
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    order: Vec<TaskId>,
    terminals: Vec<TaskId>,
}

impl Graph {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// A task of this graph.
    pub fn task(&self, id: TaskId) -> Option<TaskRef<'_>> {
        if !self.contains(id) {
            return None;
        }

        self.registry.task(id)
    }

    /// A task of this graph looked up by name.
    pub fn find(&self, name: &str) -> Option<TaskRef<'_>> {
        self.registry.find(name).filter(|task| self.contains(task.id()))
    }

    /// Tasks in topological order: every task comes after all of its
    /// dependencies. Ties follow port declaration order, so the order is
    /// reproducible across runs of the same definition.
    pub fn tasks(&self) -> impl Iterator<Item = TaskRef<'_>> {
        self.order.iter().filter_map(|&id| self.registry.task(id))
    }

    pub fn order(&self) -> &[TaskId] {
        &self.order
    }

    pub fn terminals(&self) -> &[TaskId] {
        &self.terminals
    }

    /// Consumer → producer pairs.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.graph
            .raw_edges()
            .iter()
            .map(|edge| (self.graph[edge.source()], self.graph[edge.target()]))
            .collect()
    }

    /// Direct dependencies of a task, in the order they were discovered.
    pub fn dependencies(&self, id: TaskId) -> Vec<TaskId> {
        let Some(&node) = self.index.get(&id) else {
            return Vec::new();
        };

        // petgraph yields neighbors in reverse insertion order.
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(node, EdgeDirection::Outgoing)
            .map(|n| self.graph[n])
            .collect();
        deps.reverse();
        deps
    }

    /// Tasks depending directly on `id`.
    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        let Some(&node) = self.index.get(&id) else {
            return Vec::new();
        };

        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(node, EdgeDirection::Incoming)
            .map(|n| self.graph[n])
            .collect();
        deps.reverse();
        deps
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_mermaid(f, &self.registry, self.tasks(), &self.terminals)
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("tasks", &self.tasks().map(|t| t.name()).collect::<Vec<_>>())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

/// Walks the bindings from `terminals` and builds the resolved graph.
pub(crate) fn resolve(registry: Registry, terminals: Vec<TaskId>) -> Result<Graph, WorkflowError> {
    let mut walk = Walk {
        registry: &registry,
        visited: HashSet::new(),
        active: HashSet::new(),
        stack: Vec::new(),
        order: Vec::new(),
        edges: Vec::new(),
    };

    for &terminal in &terminals {
        if !registry.contains(terminal) {
            return Err(GraphValidationError::ForeignTerminal.into());
        }

        walk.visit(terminal)?;
    }

    let Walk { order, edges, .. } = walk;

    let mut graph = DiGraph::with_capacity(order.len(), edges.len());
    let mut index = HashMap::with_capacity(order.len());

    for &id in &order {
        index.insert(id, graph.add_node(id));
    }

    for (consumer, producer) in edges {
        graph.add_edge(index[&consumer], index[&producer], ());
    }

    debug_assert!(petgraph::algo::toposort(&graph, None).is_ok());

    tracing::info!(
        tasks = order.len(),
        edges = graph.edge_count(),
        "resolved task graph"
    );

    let mut seen = HashSet::new();
    let mut terminals = terminals;
    terminals.retain(|&id| seen.insert(id));

    Ok(Graph {
        registry,
        graph,
        index,
        order,
        terminals,
    })
}

struct Walk<'a> {
    registry: &'a Registry,
    visited: HashSet<TaskId>,
    /// Ids of the tasks on `stack`.
    active: HashSet<TaskId>,
    /// Tasks currently being visited, outermost first, each with its
    /// dependencies and the position of the next one to follow.
    stack: Vec<(TaskId, Vec<TaskId>, usize)>,
    /// Post-order, producers before consumers.
    order: Vec<TaskId>,
    edges: Vec<(TaskId, TaskId)>,
}

impl Walk<'_> {
    /// Depth-first walk from `root` over an explicit stack, so the depth of a
    /// pipeline is not limited by the call stack.
    fn visit(&mut self, root: TaskId) -> Result<(), WorkflowError> {
        if self.visited.contains(&root) {
            return Ok(());
        }

        self.enter(root)?;

        while let Some((id, dependencies, cursor)) = self.stack.last_mut() {
            let id = *id;

            let Some(&dependency) = dependencies.get(*cursor) else {
                self.stack.pop();
                self.active.remove(&id);
                self.visited.insert(id);
                self.order.push(id);
                continue;
            };

            *cursor += 1;
            self.edges.push((id, dependency));

            if self.visited.contains(&dependency) {
                continue;
            }

            if self.active.contains(&dependency) {
                let start = self
                    .stack
                    .iter()
                    .position(|(s, ..)| *s == dependency)
                    .unwrap_or(0);
                let mut path: Vec<String> = self.stack[start..]
                    .iter()
                    .map(|(s, ..)| self.name(*s))
                    .collect();
                path.push(self.name(dependency));
                return Err(CycleError { path }.into());
            }

            self.enter(dependency)?;
        }

        Ok(())
    }

    fn enter(&mut self, id: TaskId) -> Result<(), WorkflowError> {
        let registry = self.registry;
        let task = registry
            .task(id)
            .ok_or_else(|| GraphValidationError::UnknownTask(format!("{id:?}")))?;

        let dependencies = task
            .dependencies()
            .map_err(GraphValidationError::Binding)?;

        self.check_outputs(task)?;

        tracing::debug!(
            task = task.name(),
            dependencies = dependencies.len(),
            "visiting task"
        );

        self.active.insert(id);
        self.stack.push((id, dependencies, 0));
        Ok(())
    }

    /// Every bound output reference must belong to a task of this run and
    /// name a declared output port.
    fn check_outputs(&self, task: TaskRef<'_>) -> Result<(), GraphValidationError> {
        for (port, refs) in task.bindings() {
            for output in refs {
                let Some(owner) = self.registry.task(output.owner()) else {
                    return Err(GraphValidationError::ForeignTask {
                        task: task.name().to_string(),
                        port: port.name.to_string(),
                    });
                };

                let declared = owner
                    .kind()
                    .port(output.port())
                    .is_some_and(|p| !p.is_input());

                if !declared {
                    return Err(GraphValidationError::UnknownPort {
                        task: owner.name().to_string(),
                        port: output.port().to_string(),
                        direction: Direction::Output,
                    });
                }
            }
        }

        Ok(())
    }

    fn name(&self, id: TaskId) -> String {
        self.registry
            .task(id)
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| format!("{id:?}"))
    }
}

/// Renders tasks and their bindings as a Mermaid diagram, data flowing from
/// producers to consumers.
pub(crate) fn write_mermaid<'a>(
    f: &mut impl Write,
    registry: &'a Registry,
    tasks: impl Iterator<Item = TaskRef<'a>>,
    terminals: &[TaskId],
) -> fmt::Result {
    let tasks: Vec<_> = tasks.collect();

    writeln!(f, "graph LR")?;

    for task in &tasks {
        let name = task.name().replace('"', "\\\"");
        let kind = task.kind().name().replace('"', "\\\"");
        writeln!(f, "    {}[\"{} ({})\"]", task.id().index(), name, kind)?;

        if terminals.contains(&task.id()) {
            writeln!(f, "    {} --> Output", task.id().index())?;
        }
    }

    writeln!(f, "    Output[Output]")?;

    for task in &tasks {
        for (port, refs) in task.bindings() {
            for output in refs {
                if registry.task(output.owner()).is_none() {
                    continue;
                }

                writeln!(
                    f,
                    "    {} -- \"{} → {}\" --> {}",
                    output.owner().index(),
                    output.port(),
                    port.name,
                    task.id().index()
                )?;
            }
        }
    }

    Ok(())
}
