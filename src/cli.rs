//! Thin command line entry point for workflow binaries.
//!
//! ```no_run
//! # use portflow::Workflow;
//! # fn workflows() -> Vec<Box<dyn Workflow>> { Vec::new() }
//! fn main() -> std::process::ExitCode {
//!     let workflows = workflows();
//!     let refs: Vec<&dyn Workflow> = workflows.iter().map(|w| w.as_ref()).collect();
//!     portflow::cli::run(&refs)
//! }
//! ```

use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, anyhow};
use camino::Utf8PathBuf;
use clap::Parser;
use console::style;

use crate::blueprint::{Blueprint, Workflow};
use crate::config::RunConfig;
use crate::engine::{Engine, LocalEngine, RemoteEngine};
use crate::error::ConfigError;
use crate::target::LocalStorage;

#[derive(Parser, Debug, Clone, Default)]
#[clap(about = "Resolve a workflow and hand it off to an execution engine")]
pub struct Args {
    /// Name of the workflow to run.
    #[clap(index = 1, required_unless_present = "list")]
    pub workflow: Option<String>,

    /// Hand the resolved graph to the scheduler at `host:port` instead of
    /// running it locally.
    #[clap(long)]
    pub scheduler_host: Option<String>,

    /// Number of tasks run in parallel by the local engine.
    #[clap(long)]
    pub workers: Option<usize>,

    #[clap(long)]
    pub log_level: Option<String>,

    /// Root directory of task artifacts.
    #[clap(long)]
    pub storage: Option<Utf8PathBuf>,

    /// Write an audit report of the local run to this file. The extension
    /// picks the format: `.json`, `.mmd` for a Mermaid diagram, anything else
    /// for Markdown.
    #[clap(long)]
    pub audit: Option<Utf8PathBuf>,

    /// JSON file with run settings. Flags override its values.
    #[clap(long)]
    pub config: Option<Utf8PathBuf>,

    /// Resolve the graph and print it as a Mermaid diagram without running.
    #[clap(long)]
    pub dry_run: bool,

    /// List the available workflows.
    #[clap(long)]
    pub list: bool,
}

impl Args {
    /// Merges the config file, if any, with the flags given on the command
    /// line.
    pub fn config(&self) -> Result<RunConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };

        if let Some(host) = &self.scheduler_host {
            config.scheduler_host = Some(host.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(storage) = &self.storage {
            config.storage = storage.clone();
        }
        if let Some(audit) = &self.audit {
            config.audit = Some(audit.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parses the process arguments and runs the selected workflow.
///
/// Returns a success exit code only if the graph resolved and the engine
/// finished without error.
pub fn run(workflows: &[&dyn Workflow]) -> ExitCode {
    run_with(&Args::parse(), workflows)
}

pub fn run_with(args: &Args, workflows: &[&dyn Workflow]) -> ExitCode {
    match start(args).and_then(|config| execute(args, &config, workflows)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

/// Loads the run settings and installs the log subscriber.
fn start(args: &Args) -> anyhow::Result<RunConfig> {
    let config = args.config()?;
    crate::utils::init_logging(&config.log_level)?;
    Ok(config)
}

fn execute(args: &Args, config: &RunConfig, workflows: &[&dyn Workflow]) -> anyhow::Result<()> {
    if args.list {
        for workflow in workflows {
            println!("{}", workflow.name());
        }
        return Ok(());
    }

    let name = args.workflow.as_deref().context("No workflow given")?;
    let workflow = find(workflows, name)?;

    let graph = Blueprint::new().build(workflow)?.resolve()?;

    if args.dry_run {
        print!("{graph}");
        return Ok(());
    }

    let s = Instant::now();

    match &config.scheduler_host {
        Some(host) => {
            eprintln!(
                "Handing {} off to {}.",
                style(workflow.name()).red(),
                style(host).blue()
            );

            RemoteEngine::new(host).execute(&graph)?;
        }
        None => {
            eprintln!(
                "Running {} with {} worker(s).",
                style(workflow.name()).red(),
                style(config.workers).blue()
            );

            let storage = Arc::new(LocalStorage::new(config.storage.clone()));
            let report = LocalEngine::new(storage)
                .workers(config.workers)
                .workdir(config.storage.clone())
                .execute(&graph)?;

            if let Some(path) = &config.audit {
                let text = report.audit.render_for(path, &graph)?;
                fs::write(path, text)
                    .with_context(|| format!("Couldn't write audit report to {path}"))?;
            }

            eprintln!(
                "Ran {} task(s), skipped {} in {:.2?}.",
                report.audit.ran().count(),
                report.audit.skipped().count(),
                s.elapsed()
            );
        }
    }

    Ok(())
}

fn find<'a>(workflows: &[&'a dyn Workflow], name: &str) -> anyhow::Result<&'a dyn Workflow> {
    workflows
        .iter()
        .copied()
        .find(|workflow| workflow.name() == name)
        .ok_or_else(|| {
            let known: Vec<_> = workflows.iter().map(|w| w.name()).collect();
            anyhow!("Unknown workflow '{name}', available: {}", known.join(", "))
        })
}
