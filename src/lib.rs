#![forbid(unsafe_code)]
//! Port-based dependency wiring for task graphs.
//!
//! A workflow author declares task types with named input and output ports,
//! instantiates them in a [`Blueprint`], and connects inputs to the outputs
//! of upstream tasks. Nothing runs while wiring: an input only remembers
//! which output it is bound to, and an output is a function computing a
//! [`TargetRef`] on demand.
//!
//! Resolution walks the bindings backwards from the terminal tasks, rejects
//! unbound required ports and cycles, and produces a [`Graph`] an [`Engine`]
//! can execute. Two engines are provided: [`LocalEngine`] runs task bodies
//! on a thread pool, [`RemoteEngine`] hands a serialized [`Plan`] to a
//! central scheduler.
//!
//! ```no_run
//! use std::sync::Arc;
//! use portflow::{Blueprint, Engine, LocalEngine, Params, TaskType};
//!
//! let writer = Arc::new(
//!     TaskType::new("Writer")
//!         .output("out_foo", |_| Ok("foo.txt".into()))
//!         .run(|ctx| ctx.write_output("out_foo", "foo\n")),
//! );
//!
//! let replacer = Arc::new(
//!     TaskType::new("Replacer")
//!         .input("in_foo")
//!         .output("out_bar", |t| Ok(t.input("in_foo")?.path().with_extension("bar.txt")))
//!         .run(|ctx| {
//!             let text = ctx.read_input("in_foo")?;
//!             ctx.write_output("out_bar", text.replace("foo", "bar"))
//!         }),
//! );
//!
//! let mut bp = Blueprint::new();
//! let w = bp.new_task("W", &writer, Params::new())?;
//! let r = bp.new_task("R", &replacer, Params::new())?;
//! bp.connect(r.input("in_foo"), w.output("out_foo"))?;
//!
//! let graph = bp.into_design([r]).resolve()?;
//! LocalEngine::default().execute(&graph)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod blueprint;
mod cluster;
mod config;
mod engine;
mod error;
mod params;
mod plan;
mod port;
mod registry;
mod resolver;
mod target;
mod task;
mod utils;

#[cfg(feature = "cli")]
pub mod cli;

pub use crate::blueprint::{Blueprint, Design, TaskDef, TaskHandle, Workflow};
pub use crate::cluster::{RunMode, Submission};
pub use crate::config::RunConfig;
pub use crate::engine::{
    Audit, AuditRecord, Engine, EngineTask, LocalEngine, RemoteEngine, Report, RunContext, Status,
};
pub use crate::error::*;
pub use crate::params::Params;
pub use crate::plan::{Plan, PlannedTask};
pub use crate::port::{InputRef, OutputRef, PortDescriptor, PortKind};
pub use crate::registry::Registry;
pub use crate::resolver::Graph;
pub use crate::target::{LocalStorage, Storage, TargetRef};
pub use crate::task::{OutputScope, TaskId, TaskRef, TaskType};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
