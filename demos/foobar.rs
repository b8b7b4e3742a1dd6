use std::process::ExitCode;
use std::sync::Arc;

use portflow::{Blueprint, Params, Submission, TaskHandle, TaskType, Workflow};

/// Writes `foo` lines, then replaces them with `bar` in a downstream task.
struct FooBar;

impl Workflow for FooBar {
    fn name(&self) -> &str {
        "foobar"
    }

    fn define(&self, bp: &mut Blueprint) -> anyhow::Result<Vec<TaskHandle>> {
        let writer = Arc::new(
            TaskType::new("Writer")
                .output("out_foo", |_| Ok("foo.txt".into()))
                .run(|ctx| ctx.write_output("out_foo", "foo\nfoo\nfoo\n")),
        );

        let replacer = Arc::new(
            TaskType::new("Replacer")
                .input("in_foo")
                .output("out_bar", |t| {
                    let with = t.params().get_str("with").unwrap_or("bar");
                    Ok(format!("{}.{with}.txt", t.input("in_foo")?.path()).into())
                })
                .run(|ctx| {
                    let text = ctx.read_input("in_foo")?;
                    let with = ctx.params().get_str("with").unwrap_or("bar");
                    ctx.write_output("out_bar", text.replace("foo", with))
                }),
        );

        let w = bp.new_task("W", &writer, Params::new())?;
        let r = bp
            .task("R", &replacer)
            .param("with", "bar")
            .register()?;

        bp.connect(r.input("in_foo"), w.output("out_foo"))?;

        Ok(vec![r])
    }
}

/// Same shape as [`FooBar`], with a counting step submitted to a job queue.
struct Counted;

impl Workflow for Counted {
    fn name(&self) -> &str {
        "counted"
    }

    fn define(&self, bp: &mut Blueprint) -> anyhow::Result<Vec<TaskHandle>> {
        let terminals = FooBar.define(bp)?;

        let counter = Arc::new(
            TaskType::new("Counter")
                .collection("in_texts")
                .output("out_count", |t| Ok(format!("{}.count", t.name()).into()))
                .run(|ctx| {
                    let mut paths = Vec::new();
                    for target in ctx.inputs("in_texts")? {
                        paths.push(target.path().to_string());
                    }
                    let out = ctx.output("out_count")?;
                    ctx.execute(&format!("cat {} | wc -l > {}", paths.join(" "), out.path()))?;
                    Ok(())
                }),
        );

        let c = bp
            .task("C", &counter)
            .submission(Submission::new("demo", "count").mode(portflow::RunMode::MockHpc))
            .register()?;

        for terminal in &terminals {
            bp.append(c.input("in_texts"), terminal.output("out_bar"))?;
        }

        Ok(vec![c])
    }
}

fn main() -> ExitCode {
    portflow::cli::run(&[&FooBar, &Counted])
}
