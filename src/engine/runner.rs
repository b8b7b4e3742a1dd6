mod audit;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant, SystemTime};

use camino::Utf8PathBuf;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{Engine, EngineTask, Report, RunContext};
use crate::error::RunError;
use crate::resolver::Graph;
use crate::target::{LocalStorage, Storage, TargetRef};
use crate::task::{TaskId, TaskRef};

pub use audit::{Audit, AuditRecord, Status};

/// Executes a resolved graph on this machine using a thread pool.
///
/// A task whose artifacts all exist is skipped. Otherwise its body runs, and
/// every artifact must exist afterwards. Tasks without a body are external:
/// their artifacts must already be present.
pub struct LocalEngine {
    storage: Arc<dyn Storage>,
    workers: usize,
    workdir: Option<Utf8PathBuf>,
}

impl LocalEngine {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            workers: 1,
            workdir: None,
        }
    }

    /// Number of tasks allowed to run at the same time.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Directory shell commands are started in.
    pub fn workdir(mut self, workdir: impl Into<Utf8PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new(Arc::new(LocalStorage::default()))
    }
}

impl Engine for LocalEngine {
    /// Executes the graph using a thread pool. Tasks are started as soon as
    /// their dependencies have completed.
    ///
    /// The algorithm works as follows:
    /// 1. Count the dependencies of every task and collect its dependents.
    /// 2. Spawn every task with no dependencies onto the pool.
    /// 3. The calling thread waits for results on a channel.
    /// 4. When a task completes, the dependency counts of its dependents are
    ///    decremented, and those reaching zero are spawned.
    /// 5. The first failure stops further spawning and is returned once the
    ///    tasks already running have finished.
    fn execute(&self, graph: &Graph) -> Result<Report, RunError> {
        let started_at = SystemTime::now();
        let total_tasks = graph.len();

        if total_tasks == 0 {
            return Ok(Report::default());
        }

        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut dependency_counts: HashMap<TaskId, usize> = HashMap::new();

        for task in graph.tasks() {
            let dependencies = graph.dependencies(task.id());
            dependency_counts.insert(task.id(), dependencies.len());
            for dependency in dependencies {
                dependents.entry(dependency).or_default().push(task.id());
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()?;

        let root_span = tracing::span!(Level::INFO, "running_tasks");
        root_span.pb_set_length(total_tasks as u64);
        if let Ok(style) = crate::utils::get_style_run() {
            root_span.pb_set_style(&style);
        }
        root_span.pb_set_message("Running tasks...");
        let _enter = root_span.enter();

        let pb_style = crate::utils::get_style_task().ok();
        let storage: &dyn Storage = &*self.storage;
        let workdir = self.workdir.as_deref();
        let run_start = Instant::now();

        let mut records = HashMap::new();

        pool.in_place_scope(|s| -> Result<(), RunError> {
            let (sender, receiver) =
                channel::<(TaskId, Result<Outcome, RunError>, Instant, Duration)>();

            let spawn_task = |id: TaskId| {
                let sender = sender.clone();
                let pb_style = pb_style.clone();

                s.spawn(move |_| {
                    let Some(task) = graph.task(id) else {
                        return;
                    };

                    let span = tracing::span!(Level::INFO, "task", name = task.name());
                    if let Some(style) = &pb_style {
                        span.pb_set_style(style);
                    }
                    span.pb_set_message(&format!("Running {}", task.name()));
                    let _enter = span.enter();

                    let start = Instant::now();

                    let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                        || run_task(task, storage, workdir, span.clone()),
                    )) {
                        Ok(result) => result,
                        Err(panic) => {
                            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                                format!("Task panicked: {s}")
                            } else if let Some(s) = panic.downcast_ref::<String>() {
                                format!("Task panicked: {s}")
                            } else {
                                String::from("Task panicked with unknown payload")
                            };

                            Err(RunError::Task(task.name().to_string(), anyhow::anyhow!(msg)))
                        }
                    };

                    // The receiver is gone only after an earlier failure.
                    sender.send((id, result, start, start.elapsed())).ok();
                });
            };

            for &id in graph.order() {
                if dependency_counts.get(&id).copied().unwrap_or(0) == 0 {
                    spawn_task(id);
                }
            }

            let mut completed = 0;

            while completed < total_tasks {
                let Ok((id, result, start, duration)) = receiver.recv() else {
                    break;
                };

                let outcome = result?;
                completed += 1;
                root_span.pb_inc(1);
                records.insert(id, (outcome, start.duration_since(run_start), duration));

                if let Some(waiting) = dependents.get(&id) {
                    for &index in waiting {
                        if let Some(count) = dependency_counts.get_mut(&index) {
                            *count -= 1;
                            if *count == 0 {
                                spawn_task(index);
                            }
                        }
                    }
                }
            }

            Ok(())
        })?;

        let mut audit = Audit {
            started_at,
            records: Vec::with_capacity(records.len()),
        };

        for task in graph.tasks() {
            let Some((outcome, offset, duration)) = records.remove(&task.id()) else {
                continue;
            };

            audit.records.push(AuditRecord {
                task: task.name().to_string(),
                kind: task.kind().name().to_string(),
                params: task.params().clone(),
                status: outcome.status,
                offset,
                duration,
                artifacts: outcome.artifacts,
                submission: task.submission().cloned(),
            });
        }

        tracing::info!(
            ran = audit.ran().count(),
            skipped = audit.skipped().count(),
            "run complete"
        );

        Ok(Report { audit })
    }
}

struct Outcome {
    status: Status,
    artifacts: Vec<TargetRef>,
}

fn run_task(
    task: TaskRef<'_>,
    storage: &dyn Storage,
    workdir: Option<&camino::Utf8Path>,
    span: tracing::Span,
) -> Result<Outcome, RunError> {
    let artifacts = task.produces()?;

    if task.complete(storage)? {
        tracing::info!(task = task.name(), "artifacts present, skipping");
        return Ok(Outcome {
            status: Status::Skipped,
            artifacts,
        });
    }

    let Some(body) = task.kind().body() else {
        return Err(missing(task, &artifacts, storage)?.unwrap_or_else(|| unknown_missing(task)));
    };

    let context = RunContext {
        task,
        storage,
        workdir,
        span,
    };

    if let Err(err) = (body.as_ref())(&context) {
        discard(task, &artifacts, storage);
        return Err(RunError::Task(task.name().to_string(), err));
    }

    if let Some(err) = missing(task, &artifacts, storage)? {
        discard(task, &artifacts, storage);
        return Err(err);
    }

    tracing::info!(task = task.name(), "task finished");
    Ok(Outcome {
        status: Status::Ran,
        artifacts,
    })
}

/// The error for the first artifact not present in `storage`.
fn missing(
    task: TaskRef<'_>,
    artifacts: &[TargetRef],
    storage: &dyn Storage,
) -> Result<Option<RunError>, RunError> {
    for target in artifacts {
        if !target.exists(storage)? {
            return Ok(Some(RunError::MissingArtifact {
                task: task.name().to_string(),
                target: target.to_string(),
            }));
        }
    }

    Ok(None)
}

fn unknown_missing(task: TaskRef<'_>) -> RunError {
    RunError::MissingArtifact {
        task: task.name().to_string(),
        target: String::from("<unknown>"),
    }
}

/// Removes whatever a failed body left behind, so the next run does not take
/// a partial result for a complete one.
fn discard(task: TaskRef<'_>, artifacts: &[TargetRef], storage: &dyn Storage) {
    for target in artifacts {
        if let Err(err) = target.remove(storage) {
            tracing::warn!(task = task.name(), artifact = %target, "couldn't remove partial artifact: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Blueprint, Params, RunMode, Submission, TaskType};

    fn storage() -> (tempfile::TempDir, Arc<LocalStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, Arc::new(LocalStorage::new(root)))
    }

    fn writer() -> Arc<TaskType> {
        Arc::new(
            TaskType::new("Writer")
                .output("out_foo", |_| Ok("foo.txt".into()))
                .run(|ctx| ctx.write_output("out_foo", "foo\nfoo\n")),
        )
    }

    fn replacer() -> Arc<TaskType> {
        Arc::new(
            TaskType::new("Replacer")
                .input("in_foo")
                .output("out_bar", |t| {
                    Ok(format!("{}.bar.txt", t.input("in_foo")?.path()).into())
                })
                .run(|ctx| {
                    let text = ctx.read_input("in_foo")?;
                    ctx.write_output("out_bar", text.replace("foo", "bar"))
                }),
        )
    }

    fn foobar() -> Graph {
        let mut bp = Blueprint::new();
        let w = bp.new_task("W", &writer(), Params::new()).unwrap();
        let r = bp.new_task("R", &replacer(), Params::new()).unwrap();
        bp.connect(r.input("in_foo"), w.output("out_foo")).unwrap();
        bp.into_design([r]).resolve().unwrap()
    }

    #[test]
    fn test_runs_in_dependency_order() {
        let (_dir, storage) = storage();
        let graph = foobar();

        let report = LocalEngine::new(storage.clone())
            .workers(2)
            .execute(&graph)
            .unwrap();

        let out = TargetRef::new("R", "foo.txt.bar.txt");
        assert_eq!(out.read_to_string(&*storage).unwrap(), "bar\nbar\n");
        assert_eq!(report.audit.ran().collect::<Vec<_>>(), vec!["W", "R"]);
    }

    #[test]
    fn test_complete_tasks_are_skipped() {
        let (_dir, storage) = storage();
        let graph = foobar();
        let engine = LocalEngine::new(storage.clone());

        engine.execute(&graph).unwrap();
        let report = engine.execute(&graph).unwrap();

        assert_eq!(report.audit.ran().count(), 0);
        assert_eq!(report.audit.skipped().collect::<Vec<_>>(), vec!["W", "R"]);
    }

    #[test]
    fn test_missing_external_artifact() {
        let (_dir, storage) = storage();
        let external = Arc::new(TaskType::new("Raw").output("out", |_| Ok("raw.txt".into())));

        let mut bp = Blueprint::new();
        let raw = bp.new_task("Raw", &external, Params::new()).unwrap();
        let graph = bp.into_design([raw]).resolve().unwrap();

        let err = LocalEngine::new(storage).execute(&graph).unwrap_err();
        assert!(matches!(
            err,
            RunError::MissingArtifact { ref task, ref target } if task == "Raw" && target == "Raw:raw.txt"
        ));
    }

    #[test]
    fn test_body_must_produce_artifacts() {
        let (_dir, storage) = storage();
        let lazy = Arc::new(
            TaskType::new("Lazy")
                .output("out", |_| Ok("lazy.txt".into()))
                .run(|_| Ok(())),
        );

        let mut bp = Blueprint::new();
        let task = bp.new_task("Lazy", &lazy, Params::new()).unwrap();
        let graph = bp.into_design([task]).resolve().unwrap();

        let err = LocalEngine::new(storage).execute(&graph).unwrap_err();
        assert!(matches!(err, RunError::MissingArtifact { .. }));
    }

    #[test]
    fn test_failed_body_leaves_no_partial_artifacts() {
        let (_dir, storage) = storage();
        let half = Arc::new(
            TaskType::new("Half")
                .output("out_a", |_| Ok("a.txt".into()))
                .output("out_b", |_| Ok("b.txt".into()))
                .run(|ctx| {
                    ctx.write_output("out_a", "a")?;
                    anyhow::bail!("gave up before b")
                }),
        );

        let mut bp = Blueprint::new();
        let task = bp.new_task("H", &half, Params::new()).unwrap();
        let graph = bp.into_design([task]).resolve().unwrap();

        let err = LocalEngine::new(storage.clone()).execute(&graph).unwrap_err();
        assert!(matches!(err, RunError::Task(ref name, _) if name == "H"));
        assert!(!TargetRef::new("H", "a.txt").exists(&*storage).unwrap());
    }

    #[test]
    fn test_incomplete_body_is_rerun() {
        let (_dir, storage) = storage();
        let runs = Arc::new(AtomicUsize::new(0));

        let seen = runs.clone();
        let flaky = Arc::new(
            TaskType::new("Flaky")
                .output("out_a", |_| Ok("a.txt".into()))
                .output("out_b", |_| Ok("b.txt".into()))
                .run(move |ctx| {
                    ctx.write_output("out_a", "a")?;
                    if seen.fetch_add(1, Ordering::SeqCst) > 0 {
                        ctx.write_output("out_b", "b")?;
                    }
                    Ok(())
                }),
        );

        let mut bp = Blueprint::new();
        let task = bp.new_task("F", &flaky, Params::new()).unwrap();
        let graph = bp.into_design([task]).resolve().unwrap();
        let engine = LocalEngine::new(storage.clone());

        let err = engine.execute(&graph).unwrap_err();
        assert!(matches!(
            err,
            RunError::MissingArtifact { ref target, .. } if target == "F:b.txt"
        ));
        assert!(!TargetRef::new("F", "a.txt").exists(&*storage).unwrap());

        let report = engine.execute(&graph).unwrap();
        assert_eq!(report.audit.ran().collect::<Vec<_>>(), vec!["F"]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_stops_dependents() {
        let (_dir, storage) = storage();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let failing = Arc::new(
            TaskType::new("Failing")
                .output("out_foo", |_| Ok("never.txt".into()))
                .run(|_| Err(anyhow::anyhow!("no luck"))),
        );

        let seen = calls.clone();
        let counting = Arc::new(
            TaskType::new("Counting")
                .input("in_foo")
                .output("out", |_| Ok("counted.txt".into()))
                .run(move |ctx| {
                    seen.lock().unwrap().push(ctx.name().to_string());
                    Ok(())
                }),
        );

        let mut bp = Blueprint::new();
        let f = bp.new_task("F", &failing, Params::new()).unwrap();
        let c = bp.new_task("C", &counting, Params::new()).unwrap();
        bp.connect(c.input("in_foo"), f.output("out_foo")).unwrap();
        let graph = bp.into_design([c]).resolve().unwrap();

        let err = LocalEngine::new(storage).execute(&graph).unwrap_err();
        assert!(matches!(err, RunError::Task(ref name, _) if name == "F"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panic_is_reported() {
        let (_dir, storage) = storage();
        let panicking = Arc::new(
            TaskType::new("Panicking")
                .output("out", |_| Ok("p.txt".into()))
                .run(|_| panic!("boom")),
        );

        let mut bp = Blueprint::new();
        let p = bp.new_task("P", &panicking, Params::new()).unwrap();
        let graph = bp.into_design([p]).resolve().unwrap();

        let err = LocalEngine::new(storage).execute(&graph).unwrap_err();
        assert!(err.to_string().contains("Task panicked: boom"));
    }

    #[test]
    fn test_execute_runs_commands_in_workdir() {
        let (dir, storage) = storage();
        let shell = Arc::new(
            TaskType::new("Shell")
                .output("out", |_| Ok("echo.txt".into()))
                .run(|ctx| {
                    let out = ctx.output("out")?;
                    ctx.execute(&format!("echo hello > {}", out.path()))?;
                    Ok(())
                }),
        );

        let mut bp = Blueprint::new();
        let task = bp.new_task("S", &shell, Params::new()).unwrap();
        let graph = bp.into_design([task]).resolve().unwrap();

        LocalEngine::new(storage.clone())
            .workdir(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap())
            .execute(&graph)
            .unwrap();

        let out = TargetRef::new("S", "echo.txt");
        assert_eq!(out.read_to_string(&*storage).unwrap(), "hello\n");
    }

    #[test]
    fn test_mock_hpc_runs_locally() {
        let (dir, storage) = storage();
        let shell = Arc::new(
            TaskType::new("Shell")
                .output("out", |_| Ok("hpc.txt".into()))
                .run(|ctx| {
                    ctx.execute("echo hi > hpc.txt")?;
                    Ok(())
                }),
        );

        let mut bp = Blueprint::new();
        let task = bp
            .task("S", &shell)
            .submission(Submission::new("proj123", "echo").mode(RunMode::MockHpc))
            .register()
            .unwrap();
        let graph = bp.into_design([task]).resolve().unwrap();

        let report = LocalEngine::new(storage.clone())
            .workdir(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap())
            .execute(&graph)
            .unwrap();

        assert_eq!(report.audit.ran().collect::<Vec<_>>(), vec!["S"]);
        let out = TargetRef::new("S", "hpc.txt");
        assert_eq!(out.read_to_string(&*storage).unwrap(), "hi\n");
    }
}
