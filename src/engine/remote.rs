use std::io::Write;
use std::net::TcpStream;

use console::style;

use crate::engine::{Engine, Report};
use crate::error::RunError;
use crate::plan::Plan;
use crate::resolver::Graph;

/// Hands a resolved graph to a central scheduler.
///
/// The plan is sent as a single line of JSON over TCP. Execution happens on
/// the other side, so the returned report carries no audit records.
pub struct RemoteEngine {
    address: String,
}

impl RemoteEngine {
    /// `address` is `host:port` of the scheduler.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Engine for RemoteEngine {
    fn execute(&self, graph: &Graph) -> Result<Report, RunError> {
        let plan = Plan::from_graph(graph)?;
        let mut payload = plan.to_json()?;
        payload.push('\n');

        let remote = |err| RunError::Remote(self.address.clone(), err);

        let mut stream = TcpStream::connect(&self.address).map_err(remote)?;
        stream.write_all(payload.as_bytes()).map_err(remote)?;
        stream.flush().map_err(remote)?;

        tracing::info!(
            address = %style(&self.address).yellow(),
            tasks = plan.tasks.len(),
            "plan handed off to scheduler"
        );

        Ok(Report::default())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::{Blueprint, Params, TaskType};

    #[test]
    fn test_sends_plan_as_json_line() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).unwrap();
            line
        });

        let writer = Arc::new(TaskType::new("Writer").output("out_foo", |_| Ok("foo.txt".into())));
        let mut bp = Blueprint::new();
        let w = bp.new_task("W", &writer, Params::new().with("n", 2)).unwrap();
        let graph = bp.into_design([w]).resolve().unwrap();

        let report = RemoteEngine::new(&address).execute(&graph).unwrap();
        assert!(report.audit.records.is_empty());

        let line = server.join().unwrap();
        assert!(line.ends_with('\n'));

        let plan: Plan = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(plan.terminals, vec!["W"]);
        assert_eq!(plan.tasks[0].name, "W");
        assert_eq!(plan.tasks[0].params.get::<u64>("n").unwrap(), 2);
    }

    #[test]
    fn test_unreachable_scheduler() {
        // Bind and drop to get a port nobody listens on.
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let writer = Arc::new(TaskType::new("Writer").output("out_foo", |_| Ok("foo.txt".into())));
        let mut bp = Blueprint::new();
        let w = bp.new_task("W", &writer, Params::new()).unwrap();
        let graph = bp.into_design([w]).resolve().unwrap();

        let err = RemoteEngine::new(address).execute(&graph).unwrap_err();
        assert!(matches!(err, RunError::Remote(..)));
    }
}
