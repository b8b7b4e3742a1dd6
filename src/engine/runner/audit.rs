use std::fmt::Write;
use std::time::{Duration, SystemTime};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::cluster::Submission;
use crate::params::Params;
use crate::resolver::Graph;
use crate::target::TargetRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// All artifacts already existed.
    Skipped,
    /// The body ran and produced its artifacts.
    Ran,
}

/// What happened to one task during a local run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub task: String,
    pub kind: String,
    pub params: Params,
    pub status: Status,
    /// Start time relative to the start of the run.
    pub offset: Duration,
    pub duration: Duration,
    pub artifacts: Vec<TargetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<Submission>,
}

/// Audit trail of a run, with records in topological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub started_at: SystemTime,
    pub records: Vec<AuditRecord>,
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            started_at: SystemTime::now(),
            records: Vec::new(),
        }
    }
}

impl Audit {
    pub fn record(&self, task: &str) -> Option<&AuditRecord> {
        self.records.iter().find(|r| r.task == task)
    }

    pub fn ran(&self) -> impl Iterator<Item = &str> {
        self.with_status(Status::Ran)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.with_status(Status::Skipped)
    }

    fn with_status(&self, status: Status) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(move |r| r.status == status)
            .map(|r| r.task.as_str())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the report in the format implied by the extension of `path`:
    /// JSON for `.json`, a Mermaid diagram for `.mmd` and `.mermaid`,
    /// Markdown otherwise.
    pub fn render_for(&self, path: &Utf8Path, graph: &Graph) -> serde_json::Result<String> {
        match path.extension() {
            Some("json") => self.to_json(),
            Some("mmd" | "mermaid") => Ok(self.render_mermaid(graph)),
            _ => Ok(self.render_markdown()),
        }
    }

    /// Renders the audit trail as a Markdown report.
    pub fn render_markdown(&self) -> String {
        let mut f = String::new();
        let total: Duration = self.records.iter().map(|r| r.duration).sum();

        writeln!(f, "# Audit report\n").unwrap();
        writeln!(f, "Tasks: {}, total task time: {:.2?}\n", self.records.len(), total).unwrap();

        for record in &self.records {
            writeln!(f, "## {} ({})\n", record.task, record.kind).unwrap();

            let status = match record.status {
                Status::Skipped => "skipped, artifacts already present",
                Status::Ran => "ran",
            };

            writeln!(f, "- Status: {status}").unwrap();
            writeln!(f, "- Started: +{:.2?}", record.offset).unwrap();
            writeln!(f, "- Duration: {:.2?}", record.duration).unwrap();

            if let Some(submission) = &record.submission {
                writeln!(f, "- Submission: `{}`", submission.command_prefix()).unwrap();
            }

            if !record.params.is_empty() {
                writeln!(f, "- Parameters:").unwrap();
                for (key, value) in record.params.iter() {
                    writeln!(f, "  - {key}: `{value}`").unwrap();
                }
            }

            if !record.artifacts.is_empty() {
                writeln!(f, "- Artifacts:").unwrap();
                for target in &record.artifacts {
                    writeln!(f, "  - `{}`", target.path()).unwrap();
                }
            }

            writeln!(f).unwrap();
        }

        f
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Skipped
    pub fn render_mermaid(&self, graph: &Graph) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        let ran: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.status == Status::Ran)
            .map(|r| r.duration.as_secs_f64())
            .collect();

        let mut min_time = ran.iter().copied().fold(f64::MAX, f64::min);
        let mut max_time = ran.iter().copied().fold(f64::MIN, f64::max);

        if min_time > max_time {
            // Nothing ran
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for task in graph.tasks() {
            let index = task.id().index();
            let name = task.name().replace('"', "\\\"");

            let (label_extra, color_code) = match self.record(task.name()) {
                Some(record) if record.status == Status::Ran => {
                    let t = (record.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    let (r, g, b) = gradient(t);
                    (
                        format!("{:.2?}", record.duration),
                        format!("#{r:02X}{g:02X}{b:02X}"),
                    )
                }
                Some(_) => ("Skipped".to_string(), "#ADD8E6".to_string()),
                None => ("Not run".to_string(), "#D3D3D3".to_string()),
            };

            writeln!(f, "    {index}[\"{name}\\n{label_extra}\"]").unwrap();
            writeln!(f, "    style {index} fill:{color_code}").unwrap();

            if graph.terminals().contains(&task.id()) {
                writeln!(f, "    {index} --> Output").unwrap();
            }
        }

        writeln!(f, "    Output[Output]").unwrap();

        for (consumer, producer) in graph.edges() {
            writeln!(f, "    {} --> {}", producer.index(), consumer.index()).unwrap();
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> (u8, u8, u8) {
    if t < 0.5 {
        let r = (255.0 * t * 2.0) as u8;
        (r, 255, 0)
    } else {
        let g = (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8;
        (255, g, 0)
    }
}
