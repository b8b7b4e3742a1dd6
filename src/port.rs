//! Ports: the named slots through which tasks are wired together.
//!
//! Every task type declares its ports up front with a list of
//! [`PortDescriptor`]s. Wiring happens by handing an [`OutputRef`] (a deferred
//! reference to some task's output port) to an [`InputRef`] (a slot on another
//! task). No value is computed while wiring; the output function behind an
//! `OutputRef` only runs when a [`TargetRef`](crate::TargetRef) is actually
//! needed.

use std::borrow::Cow;

use crate::task::TaskId;

/// What a port is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Holds at most one upstream output reference.
    Input,
    /// Holds an ordered list of upstream output references (fan-in).
    Collection,
    /// Yields a target when evaluated.
    Output,
}

impl PortKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            PortKind::Input => "single input",
            PortKind::Collection => "collection input",
            PortKind::Output => "output",
        }
    }
}

/// Static descriptor of one port on a task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub name: Cow<'static, str>,
    pub kind: PortKind,
    /// Only meaningful for inputs. An unbound required input fails resolution.
    pub required: bool,
}

impl PortDescriptor {
    pub fn input(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Input,
            required: true,
        }
    }

    pub fn collection(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Collection,
            required: true,
        }
    }

    pub fn output(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Output,
            required: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, PortKind::Input | PortKind::Collection)
    }
}

/// Deferred reference to an output port of a specific task.
///
/// This is what gets stored on an input slot. It knows which task owns the
/// port without evaluating anything, which keeps dependency derivation free
/// of side effects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputRef {
    pub(crate) task: TaskId,
    pub(crate) port: Cow<'static, str>,
}

impl OutputRef {
    /// The task owning the referenced output port.
    pub fn owner(&self) -> TaskId {
        self.task
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

/// Reference to an input slot of a specific task, used as the left-hand side
/// of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputRef {
    pub(crate) task: TaskId,
    pub(crate) port: Cow<'static, str>,
}

impl InputRef {
    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

/// The current content of an input port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum Slot {
    #[default]
    Unbound,
    Single(OutputRef),
    Many(Vec<OutputRef>),
}

impl Slot {
    pub(crate) fn is_bound(&self) -> bool {
        match self {
            Slot::Unbound => false,
            Slot::Single(_) => true,
            Slot::Many(refs) => !refs.is_empty(),
        }
    }

    pub(crate) fn refs(&self) -> &[OutputRef] {
        match self {
            Slot::Unbound => &[],
            Slot::Single(output) => std::slice::from_ref(output),
            Slot::Many(refs) => refs,
        }
    }
}
