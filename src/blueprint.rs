use std::borrow::Cow;
use std::sync::Arc;

use serde_json::Value;

use crate::cluster::Submission;
use crate::error::{Direction, GraphValidationError, WorkflowError};
use crate::params::Params;
use crate::port::{InputRef, OutputRef, PortKind, Slot};
use crate::registry::Registry;
use crate::resolver::{Graph, resolve};
use crate::task::{TaskId, TaskType};

/// A lightweight, copyable token for a task registered in a [`Blueprint`].
///
/// Handles are used to name the ports of a task when wiring the graph. They
/// carry no data; the task itself lives in the blueprint's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    id: TaskId,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The input slot `port` of this task, for use on the left of a binding.
    pub fn input(&self, port: impl Into<Cow<'static, str>>) -> InputRef {
        InputRef {
            task: self.id,
            port: port.into(),
        }
    }

    /// Deferred reference to the output port `port` of this task.
    pub fn output(&self, port: impl Into<Cow<'static, str>>) -> OutputRef {
        OutputRef {
            task: self.id,
            port: port.into(),
        }
    }
}

/// A workflow definition: creates tasks, wires their ports, and returns the
/// terminal tasks the graph is resolved from.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use portflow::{Blueprint, Params, TaskHandle, TaskType, Workflow};
///
/// struct FooBar;
///
/// impl Workflow for FooBar {
///     fn name(&self) -> &str {
///         "foobar"
///     }
///
///     fn define(&self, bp: &mut Blueprint) -> anyhow::Result<Vec<TaskHandle>> {
///         let writer = Arc::new(TaskType::new("Writer").output("out_foo", |_| Ok("foo.txt".into())));
///         let replacer = Arc::new(
///             TaskType::new("Replacer")
///                 .input("in_foo")
///                 .output("out_bar", |t| Ok(format!("{}.bar.txt", t.input("in_foo")?.path()).into())),
///         );
///
///         let w = bp.new_task("W", &writer, Params::new())?;
///         let r = bp.new_task("R", &replacer, Params::new())?;
///         bp.connect(r.input("in_foo"), w.output("out_foo"))?;
///
///         Ok(vec![r])
///     }
/// }
///
/// let graph = Blueprint::new().build(&FooBar)?.resolve()?;
/// assert_eq!(graph.len(), 2);
/// # Ok::<(), portflow::WorkflowError>(())
/// ```
pub trait Workflow {
    fn name(&self) -> &str;

    fn define(&self, blueprint: &mut Blueprint) -> anyhow::Result<Vec<TaskHandle>>;
}

/// The blueprint of a workflow run.
///
/// `Blueprint` owns the per-run task registry. Tasks are created through the
/// [`Blueprint::new_task`] factory (or the [`Blueprint::task`] builder) and
/// wired by binding output references to input slots. Binding only stores
/// references, so tasks can be wired in any order.
pub struct Blueprint {
    registry: Registry,
}

impl Blueprint {
    /// Creates a new, empty blueprint with its own registry.
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registers a task of type `kind` under the unique `name`.
    pub fn new_task(
        &mut self,
        name: &str,
        kind: &Arc<TaskType>,
        params: Params,
    ) -> Result<TaskHandle, WorkflowError> {
        let id = self.registry.insert(name, kind.clone(), params)?;
        tracing::debug!(task = name, kind = kind.name(), "registered task");
        Ok(TaskHandle { id })
    }

    /// Starts a builder for a new task.
    pub fn task(&mut self, name: impl Into<String>, kind: &Arc<TaskType>) -> TaskDef<'_> {
        TaskDef {
            blueprint: self,
            name: name.into(),
            kind: kind.clone(),
            params: Params::new(),
            submission: None,
        }
    }

    /// Attaches a cluster submission annotation to a task.
    pub fn annotate(
        &mut self,
        task: TaskHandle,
        submission: Submission,
    ) -> Result<(), WorkflowError> {
        let node = self
            .registry
            .node_mut(task.id)
            .ok_or_else(|| GraphValidationError::UnknownTask(format!("{:?}", task.id)))?;

        node.submission = Some(submission);
        Ok(())
    }

    /// Binds a single input port to an upstream output port.
    ///
    /// A later binding of the same port replaces the earlier one.
    pub fn connect(&mut self, input: InputRef, output: OutputRef) -> Result<(), WorkflowError> {
        let slot = self.slot_mut(&input, PortKind::Input)?;
        let previous = std::mem::replace(slot, Slot::Single(output));

        if previous.is_bound() {
            tracing::debug!(port = %input.port, "input port re-bound, previous binding replaced");
        }

        Ok(())
    }

    /// Appends an upstream output port to a collection input port.
    pub fn append(&mut self, input: InputRef, output: OutputRef) -> Result<(), WorkflowError> {
        let slot = self.slot_mut(&input, PortKind::Collection)?;

        match slot {
            Slot::Many(refs) => refs.push(output),
            other => *other = Slot::Many(vec![output]),
        }

        Ok(())
    }

    fn slot_mut(&mut self, input: &InputRef, expected: PortKind) -> Result<&mut Slot, WorkflowError> {
        let node = self
            .registry
            .node_mut(input.task)
            .ok_or_else(|| GraphValidationError::UnknownTask(format!("{:?}", input.task)))?;

        let index = node
            .kind
            .port_index(&input.port)
            .filter(|&i| node.kind.ports()[i].is_input())
            .ok_or_else(|| GraphValidationError::UnknownPort {
                task: node.name.to_string(),
                port: input.port.to_string(),
                direction: Direction::Input,
            })?;

        let actual = node.kind.ports()[index].kind;
        if actual != expected {
            return Err(GraphValidationError::PortKind {
                task: node.name.to_string(),
                port: input.port.to_string(),
                expected: expected.label(),
                actual: actual.label(),
            }
            .into());
        }

        Ok(&mut node.slots[index])
    }

    /// Runs the workflow definition against this blueprint and captures its
    /// terminal tasks.
    ///
    /// The blueprint is consumed, since its registry belongs to exactly one
    /// run.
    pub fn build<W>(mut self, workflow: &W) -> Result<Design, WorkflowError>
    where
        W: Workflow + ?Sized,
    {
        let terminals = workflow
            .define(&mut self)
            .map_err(|err| match err.downcast::<WorkflowError>() {
                Ok(err) => err,
                Err(err) => WorkflowError::Definition(err),
            })?;

        tracing::debug!(
            workflow = workflow.name(),
            tasks = self.registry.len(),
            terminals = terminals.len(),
            "workflow defined"
        );

        Ok(self.into_design(terminals))
    }

    /// Captures `terminals` without going through a [`Workflow`].
    pub fn into_design(self, terminals: impl IntoIterator<Item = TaskHandle>) -> Design {
        Design {
            registry: self.registry,
            terminals: terminals.into_iter().map(|handle| handle.id).collect(),
        }
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: String,
    kind: Arc<TaskType>,
    params: Params,
    submission: Option<Submission>,
}

impl<'a> TaskDef<'a> {
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params = self.params.with(key, value);
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        for (key, value) in params.iter() {
            self.params = self.params.with(key, value.clone());
        }
        self
    }

    pub fn submission(mut self, submission: Submission) -> Self {
        self.submission = Some(submission);
        self
    }

    pub fn register(self) -> Result<TaskHandle, WorkflowError> {
        let handle = self
            .blueprint
            .new_task(&self.name, &self.kind, self.params)?;

        if let Some(submission) = self.submission {
            self.blueprint.annotate(handle, submission)?;
        }

        Ok(handle)
    }
}

/// A defined but not yet resolved workflow: the registry plus the terminal
/// tasks.
pub struct Design {
    registry: Registry,
    terminals: Vec<TaskId>,
}

impl Design {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn terminals(&self) -> &[TaskId] {
        &self.terminals
    }

    /// Validates the design and computes the resolved graph.
    pub fn resolve(self) -> Result<Graph, WorkflowError> {
        resolve(self.registry, self.terminals)
    }
}

impl std::fmt::Display for Design {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::resolver::write_mermaid(f, &self.registry, self.registry.iter(), &self.terminals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BindingError;

    fn writer() -> Arc<TaskType> {
        Arc::new(TaskType::new("Writer").output("out_foo", |_| Ok("foo.txt".into())))
    }

    fn merger() -> Arc<TaskType> {
        Arc::new(
            TaskType::new("Merger")
                .collection("in_parts")
                .output("out_all", |t| {
                    let parts = t.inputs("in_parts")?;
                    let names: Vec<_> = parts.iter().map(|p| p.task().to_string()).collect();
                    Ok(format!("{}.merged", names.join("+")).into())
                }),
        )
    }

    struct Failing;

    impl Workflow for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn define(&self, bp: &mut Blueprint) -> anyhow::Result<Vec<TaskHandle>> {
            bp.new_task("A", &writer(), Params::new())?;
            bp.new_task("A", &writer(), Params::new())?;
            anyhow::bail!("never reached")
        }
    }

    #[test]
    fn test_duplicate_name_surfaces_from_build() {
        let err = Blueprint::new().build(&Failing).err().unwrap();
        assert!(matches!(err, WorkflowError::DuplicateName(ref name) if name == "A"));
    }

    #[test]
    fn test_last_binding_wins() {
        let mut bp = Blueprint::new();
        let kind = Arc::new(
            TaskType::new("Reader")
                .input("in_foo")
                .output("out", |t| Ok(t.input("in_foo")?.path().with_extension("out"))),
        );

        let a = bp.new_task("A", &writer(), Params::new()).unwrap();
        let b = bp.new_task("B", &writer(), Params::new()).unwrap();
        let r = bp.new_task("R", &kind, Params::new()).unwrap();

        bp.connect(r.input("in_foo"), a.output("out_foo")).unwrap();
        bp.connect(r.input("in_foo"), b.output("out_foo")).unwrap();

        let task = bp.registry().task(r.id()).unwrap();
        assert_eq!(task.dependencies().unwrap(), vec![b.id()]);
        assert_eq!(task.input("in_foo").unwrap().task(), "B");
    }

    #[test]
    fn test_append_preserves_order() {
        let mut bp = Blueprint::new();
        let c = bp.new_task("C", &writer(), Params::new()).unwrap();
        let a = bp.new_task("A", &writer(), Params::new()).unwrap();
        let m = bp.new_task("M", &merger(), Params::new()).unwrap();

        bp.append(m.input("in_parts"), c.output("out_foo")).unwrap();
        bp.append(m.input("in_parts"), a.output("out_foo")).unwrap();

        let task = bp.registry().task(m.id()).unwrap();
        assert_eq!(task.dependencies().unwrap(), vec![c.id(), a.id()]);
        assert_eq!(task.output("out_all").unwrap().path(), "C+A.merged");
    }

    #[test]
    fn test_empty_required_collection_is_unbound() {
        let mut bp = Blueprint::new();
        let m = bp.new_task("M", &merger(), Params::new()).unwrap();

        let err = bp.registry().task(m.id()).unwrap().dependencies().unwrap_err();
        assert_eq!(
            err,
            BindingError {
                task: "M".into(),
                port: "in_parts".into()
            }
        );
    }

    #[test]
    fn test_port_kind_is_checked_at_bind_time() {
        let mut bp = Blueprint::new();
        let w = bp.new_task("W", &writer(), Params::new()).unwrap();
        let m = bp.new_task("M", &merger(), Params::new()).unwrap();

        let err = bp.connect(m.input("in_parts"), w.output("out_foo")).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Validation(GraphValidationError::PortKind { .. })
        ));

        let err = bp.connect(m.input("out_all"), w.output("out_foo")).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Validation(GraphValidationError::UnknownPort { direction: Direction::Input, .. })
        ));
    }

    #[test]
    fn test_builder_registers_params_and_submission() {
        let mut bp = Blueprint::new();
        let w = bp
            .task("W", &writer())
            .param("sample", "s1")
            .submission(Submission::new("proj", "w"))
            .register()
            .unwrap();

        let task = bp.registry().find("W").unwrap();
        assert_eq!(task.id(), w.id());
        assert_eq!(task.params().get_str("sample"), Some("s1"));
        assert_eq!(task.submission().unwrap().project, "proj");
    }

    #[test]
    fn test_display_mermaid() {
        let mut bp = Blueprint::new();
        let w = bp.new_task("W", &writer(), Params::new()).unwrap();
        let m = bp.new_task("M", &merger(), Params::new()).unwrap();
        bp.append(m.input("in_parts"), w.output("out_foo")).unwrap();

        let text = bp.into_design([m]).to_string();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains(r#"0["W (Writer)"]"#));
        assert!(text.contains("1 --> Output"));
        assert!(text.contains(r#"0 -- "out_foo → in_parts" --> 1"#));
    }
}
