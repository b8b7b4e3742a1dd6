//! Task types and registered task instances.
//!
//! A [`TaskType`] is the reusable definition: its port list, how each output
//! port maps to a path, and optionally the body that produces the artifacts.
//! Registering a type under a unique name in a [`Blueprint`] creates a task
//! instance, which is inspected through a borrowed [`TaskRef`].
//!
//! [`Blueprint`]: crate::Blueprint

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::cluster::Submission;
use crate::engine::RunContext;
use crate::error::{BindingError, CycleError, Direction, GraphValidationError, WorkflowError};
use crate::params::Params;
use crate::port::{OutputRef, PortDescriptor, PortKind, Slot};
use crate::registry::Registry;
use crate::target::TargetRef;

/// Identity of a task instance within one run.
///
/// The run component makes handles from another blueprint detectable instead
/// of silently aliasing a task at the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub(crate) run: u64,
    pub(crate) index: u32,
}

impl TaskId {
    /// Fails when `index` does not fit the id.
    pub(crate) fn new(run: u64, index: usize) -> Option<Self> {
        let index = u32::try_from(index).ok()?;
        Some(Self { run, index })
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }
}

/// Function computing the path of an output port.
type OutputFn = Arc<dyn Fn(&OutputScope<'_>) -> anyhow::Result<Utf8PathBuf> + Send + Sync>;

/// Task body executed by an engine.
type RunFn = Arc<dyn Fn(&RunContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Definition of a kind of task: declared ports, output paths, and body.
///
/// # Example
///
/// ```rust
/// use portflow::TaskType;
///
/// let replace = TaskType::new("Replace")
///     .input("in_foo")
///     .output("out_bar", |t| Ok(format!("{}.bar.txt", t.input("in_foo")?.path()).into()))
///     .run(|ctx| {
///         let text = ctx.read_input("in_foo")?;
///         ctx.write_output("out_bar", text.replace("foo", "bar"))?;
///         Ok(())
///     });
///
/// assert_eq!(replace.ports().len(), 2);
/// ```
pub struct TaskType {
    name: Cow<'static, str>,
    ports: Vec<PortDescriptor>,
    outputs: HashMap<Cow<'static, str>, OutputFn>,
    run: Option<RunFn>,
}

impl TaskType {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            ports: Vec::new(),
            outputs: HashMap::new(),
            run: None,
        }
    }

    /// Declares a required single input port.
    pub fn input(self, name: impl Into<Cow<'static, str>>) -> Self {
        self.declare(PortDescriptor::input(name))
    }

    /// Declares a single input port that may stay unbound.
    pub fn optional_input(self, name: impl Into<Cow<'static, str>>) -> Self {
        self.declare(PortDescriptor::input(name).optional())
    }

    /// Declares a required collection input port (at least one binding).
    pub fn collection(self, name: impl Into<Cow<'static, str>>) -> Self {
        self.declare(PortDescriptor::collection(name))
    }

    /// Declares an output port and the function computing its path.
    pub fn output<F>(mut self, name: impl Into<Cow<'static, str>>, path: F) -> Self
    where
        F: Fn(&OutputScope<'_>) -> anyhow::Result<Utf8PathBuf> + Send + Sync + 'static,
    {
        let name = name.into();
        self.outputs.insert(name.clone(), Arc::new(path));
        self.declare(PortDescriptor::output(name))
    }

    /// Sets the body. Types without a body describe external artifacts which
    /// must already exist when the graph runs.
    pub fn run<F>(mut self, body: F) -> Self
    where
        F: Fn(&RunContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.run = Some(Arc::new(body));
        self
    }

    /// Declaring a port name twice replaces the earlier declaration in place.
    fn declare(mut self, port: PortDescriptor) -> Self {
        if port.kind != PortKind::Output {
            self.outputs.remove(&port.name);
        }

        match self.ports.iter_mut().find(|p| p.name == port.name) {
            Some(slot) => *slot = port,
            None => self.ports.push(port),
        }

        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All ports in declaration order.
    pub fn ports(&self) -> &[PortDescriptor] {
        &self.ports
    }

    pub fn port(&self, name: &str) -> Option<&PortDescriptor> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub(crate) fn port_index(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &PortDescriptor> {
        self.ports.iter().filter(|p| p.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &PortDescriptor> {
        self.ports.iter().filter(|p| p.kind == PortKind::Output)
    }

    pub fn is_external(&self) -> bool {
        self.run.is_none()
    }

    pub(crate) fn body(&self) -> Option<&RunFn> {
        self.run.as_ref()
    }

    fn output_fn(&self, name: &str) -> Option<&OutputFn> {
        self.outputs.get(name)
    }
}

impl Debug for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskType")
            .field("name", &self.name)
            .field("ports", &self.ports)
            .field("external", &self.is_external())
            .finish()
    }
}

/// Registered task instance, owned by a [`Registry`].
pub(crate) struct TaskNode {
    pub name: Arc<str>,
    pub kind: Arc<TaskType>,
    pub params: Params,
    pub submission: Option<Submission>,
    /// Index-aligned with `kind.ports()`; output positions stay unbound.
    pub slots: Vec<Slot>,
}

impl TaskNode {
    pub fn new(name: Arc<str>, kind: Arc<TaskType>, params: Params) -> Self {
        let slots = vec![Slot::Unbound; kind.ports().len()];
        Self {
            name,
            kind,
            params,
            submission: None,
            slots,
        }
    }
}

/// Borrowed view of a registered task.
#[derive(Clone, Copy)]
pub struct TaskRef<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) id: TaskId,
    pub(crate) node: &'a TaskNode,
}

impl<'a> TaskRef<'a> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &'a str {
        &self.node.name
    }

    pub fn kind(&self) -> &'a TaskType {
        &self.node.kind
    }

    pub fn params(&self) -> &'a Params {
        &self.node.params
    }

    pub fn submission(&self) -> Option<&'a Submission> {
        self.node.submission.as_ref()
    }

    /// Input ports in declaration order together with their current bindings.
    pub fn bindings(&self) -> impl Iterator<Item = (&'a PortDescriptor, &'a [OutputRef])> + 'a {
        let node = self.node;
        node.kind
            .ports()
            .iter()
            .zip(node.slots.iter())
            .filter(|(port, _)| port.is_input())
            .map(|(port, slot)| (port, slot.refs()))
    }

    /// Tasks owning the output ports bound to this task's inputs.
    ///
    /// The result is deduplicated and ordered by port declaration, then by
    /// binding order within collection ports. No output function is called.
    pub fn dependencies(&self) -> Result<Vec<TaskId>, BindingError> {
        let node = self.node;
        let mut dependencies = Vec::new();

        for (port, slot) in node.kind.ports().iter().zip(node.slots.iter()) {
            if !port.is_input() {
                continue;
            }

            if port.required && !slot.is_bound() {
                return Err(BindingError {
                    task: node.name.to_string(),
                    port: port.name.to_string(),
                });
            }

            for output in slot.refs() {
                if !dependencies.contains(&output.task) {
                    dependencies.push(output.task);
                }
            }
        }

        Ok(dependencies)
    }

    /// Evaluates every declared output port, in declaration order.
    pub fn artifacts(&self) -> Result<Vec<TargetRef>, WorkflowError> {
        self.kind()
            .outputs()
            .map(|port| self.output(&port.name))
            .collect()
    }

    /// Evaluates a single output port of this task.
    pub fn output(&self, port: &str) -> Result<TargetRef, WorkflowError> {
        let output = OutputRef {
            task: self.id,
            port: Cow::Owned(port.to_string()),
        };
        evaluate(self.registry, &output)
    }

    /// Evaluates the upstream output bound to a single input port.
    pub fn input(&self, port: &str) -> Result<TargetRef, WorkflowError> {
        self.scope().input(port)
    }

    /// Evaluates every upstream output bound to an input port, in binding order.
    pub fn inputs(&self, port: &str) -> Result<Vec<TargetRef>, WorkflowError> {
        self.scope().inputs(port)
    }

    fn scope(&self) -> OutputScope<'a> {
        OutputScope { task: *self }
    }

    fn slot(&self, port: &str) -> Result<(&'a PortDescriptor, &'a Slot), GraphValidationError> {
        let node = self.node;
        node.kind
            .port_index(port)
            .filter(|&i| node.kind.ports()[i].is_input())
            .map(|i| (&node.kind.ports()[i], &node.slots[i]))
            .ok_or_else(|| GraphValidationError::UnknownPort {
                task: node.name.to_string(),
                port: port.to_string(),
                direction: Direction::Input,
            })
    }
}

impl Debug for TaskRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("name", &self.name())
            .field("kind", &self.kind().name())
            .finish()
    }
}

/// What an output function can see of its task while computing a path.
///
/// Inputs are evaluated lazily, on request. Upstream targets are computed at
/// most once per registry and cached, so reading an input is cheap.
pub struct OutputScope<'a> {
    task: TaskRef<'a>,
}

impl<'a> OutputScope<'a> {
    pub fn name(&self) -> &'a str {
        self.task.name()
    }

    pub fn params(&self) -> &'a Params {
        self.task.params()
    }

    /// Target of the upstream output bound to the single input `port`.
    pub fn input(&self, port: &str) -> Result<TargetRef, WorkflowError> {
        self.maybe_input(port)?.ok_or_else(|| {
            BindingError {
                task: self.task.name().to_string(),
                port: port.to_string(),
            }
            .into()
        })
    }

    /// Like [`OutputScope::input`], but an unbound optional port yields `None`.
    pub fn maybe_input(&self, port: &str) -> Result<Option<TargetRef>, WorkflowError> {
        let (descriptor, slot) = self.task.slot(port)?;

        match (descriptor.kind, slot) {
            (PortKind::Collection, _) => Err(GraphValidationError::PortKind {
                task: self.task.name().to_string(),
                port: port.to_string(),
                expected: PortKind::Input.label(),
                actual: PortKind::Collection.label(),
            }
            .into()),
            (_, Slot::Single(output)) => self.upstream(port, output).map(Some),
            _ => Ok(None),
        }
    }

    /// Targets of every upstream output bound to `port`, in binding order.
    pub fn inputs(&self, port: &str) -> Result<Vec<TargetRef>, WorkflowError> {
        let (_, slot) = self.task.slot(port)?;

        slot.refs()
            .iter()
            .map(|output| self.upstream(port, output))
            .collect()
    }

    fn upstream(&self, port: &str, output: &OutputRef) -> Result<TargetRef, WorkflowError> {
        if !self.task.registry.contains(output.task) {
            return Err(GraphValidationError::ForeignTask {
                task: self.task.name().to_string(),
                port: port.to_string(),
            }
            .into());
        }

        evaluate(self.task.registry, output)
    }
}

/// An output port waiting for the outputs bound to its task's inputs.
struct Frame<'a> {
    output: OutputRef,
    task: TaskRef<'a>,
    function: &'a OutputFn,
    upstream: Vec<OutputRef>,
    cursor: usize,
}

impl<'a> Frame<'a> {
    fn new(registry: &'a Registry, output: OutputRef) -> Result<Self, WorkflowError> {
        let task = registry
            .task(output.task)
            .ok_or_else(|| GraphValidationError::UnknownTask(format!("{:?}", output.task)))?;

        let function = task.kind().output_fn(&output.port).ok_or_else(|| {
            GraphValidationError::UnknownPort {
                task: task.name().to_string(),
                port: output.port.to_string(),
                direction: Direction::Output,
            }
        })?;

        let mut upstream = Vec::new();
        for (port, refs) in task.bindings() {
            for dependency in refs {
                if !registry.contains(dependency.task) {
                    return Err(GraphValidationError::ForeignTask {
                        task: task.name().to_string(),
                        port: port.name.to_string(),
                    }
                    .into());
                }

                upstream.push(dependency.clone());
            }
        }

        Ok(Self {
            output,
            task,
            function,
            upstream,
            cursor: 0,
        })
    }

    fn compute(&self) -> Result<TargetRef, WorkflowError> {
        let path = (self.function.as_ref())(&self.task.scope()).map_err(|err| {
            match err.downcast::<WorkflowError>() {
                Ok(err) => err,
                Err(source) => WorkflowError::Output {
                    task: self.task.name().to_string(),
                    port: self.output.port.to_string(),
                    source,
                },
            }
        })?;

        Ok(TargetRef::new(self.task.node.name.clone(), path))
    }
}

/// Computes the target of `output`, using the registry cache.
///
/// An output function may read any input of its task, so every output bound
/// to those inputs is computed first. The walk uses an explicit stack, which
/// keeps long pipelines off the call stack, and reports a cycle when an output
/// is reached again while still waiting for its upstream.
fn evaluate(registry: &Registry, output: &OutputRef) -> Result<TargetRef, WorkflowError> {
    if let Some(target) = registry.cached(output) {
        return Ok(target);
    }

    let mut stack = vec![Frame::new(registry, output.clone())?];
    let mut waiting = HashSet::from([output.clone()]);

    loop {
        let Some(frame) = stack.last_mut() else {
            return Err(GraphValidationError::UnknownTask(format!("{:?}", output.task)).into());
        };

        let next = frame.upstream.get(frame.cursor).cloned();
        frame.cursor += 1;

        match next {
            Some(next) => {
                if registry.cached(&next).is_some() {
                    continue;
                }

                if waiting.contains(&next) {
                    let start = stack.iter().position(|f| f.output == next).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..]
                        .iter()
                        .map(|f| f.task.name().to_string())
                        .collect();
                    path.push(registry.task(next.task).map_or_else(
                        || format!("{:?}", next.task),
                        |t| t.name().to_string(),
                    ));
                    return Err(CycleError { path }.into());
                }

                waiting.insert(next.clone());
                stack.push(Frame::new(registry, next)?);
            }
            None => {
                let Some(frame) = stack.pop() else {
                    continue;
                };

                let target = frame.compute()?;
                waiting.remove(&frame.output);
                registry.cache(frame.output, target.clone());

                if stack.is_empty() {
                    return Ok(target);
                }
            }
        }
    }
}
