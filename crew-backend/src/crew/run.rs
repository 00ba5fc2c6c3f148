//! Run and task lifecycle records

use crate::error::RunFailure;
use crate::tools::ToolInvocation;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://\S+").expect("valid URL regex"));

/// First http(s) URL with a host mentioned in free text, without trailing punctuation
pub fn extract_first_url(text: &str) -> Option<String> {
    URL_PATTERN.find_iter(text).find_map(|m| {
        let url = m
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')' | ']' | '>' | '"' | '\''));
        let has_host = url
            .split_once("://")
            .map(|(_, rest)| !rest.is_empty())
            .unwrap_or(false);
        has_host.then(|| url.to_string())
    })
}

/// Lifecycle of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled)
    }
}

/// Lifecycle of one task within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Waiting,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal step.
    ///
    /// Backend retries happen inside a single `Running` stay and are counted
    /// in [`TaskRecord::retries`].
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Waiting)
                | (Pending, Running)
                | (Waiting, Running)
                | (Running, Succeeded)
                | (Pending, Failed)
                | (Waiting, Failed)
                | (Running, Failed)
        )
    }
}

/// What happened to one task during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    /// Backend calls made, retries included
    pub backend_calls: u32,
    pub retries: u32,
    pub invocations: Vec<ToolInvocation>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        TaskRecord {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Pending,
            backend_calls: 0,
            retries: 0,
            invocations: Vec::new(),
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a status change, refusing illegal ones
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            log::warn!(
                "[CREW] Ignoring illegal transition {} -> {} for task '{}'",
                self.status,
                next,
                self.task_id
            );
            return false;
        }
        if next == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        true
    }

    pub fn succeed(&mut self, output: String) -> bool {
        let ok = self.transition(TaskStatus::Succeeded);
        if ok {
            self.output = Some(output);
        }
        ok
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        let ok = self.transition(TaskStatus::Failed);
        if ok {
            self.error = Some(error.into());
        }
        ok
    }

    pub fn tool_calls(&self) -> usize {
        self.invocations.len()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// The user's request for one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunInput {
    pub run_id: String,
    pub goal: String,
    pub url: Option<String>,
}

impl RunInput {
    /// New input; the target URL defaults to the first one found in the goal
    pub fn new(goal: impl Into<String>) -> Self {
        let goal = goal.into();
        RunInput {
            run_id: Uuid::new_v4().to_string(),
            url: extract_first_url(&goal),
            goal,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }
}

/// Outcome of a run, including completed task outputs even on failure
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub goal: String,
    pub url: Option<String>,
    pub status: RunStatus,
    /// Task records in execution order
    pub tasks: Vec<TaskRecord>,
    pub terminal_task: String,
    pub final_output: Option<String>,
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(input: &RunInput, terminal_task: impl Into<String>) -> Self {
        RunReport {
            run_id: input.run_id.clone(),
            goal: input.goal.clone(),
            url: input.url.clone(),
            status: RunStatus::Pending,
            tasks: Vec::new(),
            terminal_task: terminal_task.into(),
            final_output: None,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Final output, or the failure that prevented it
    pub fn result(&self) -> Result<&str, Option<&RunFailure>> {
        match (&self.status, &self.final_output) {
            (RunStatus::Succeeded, Some(output)) => Ok(output),
            _ => Err(self.failure.as_ref()),
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn output(&self, task_id: &str) -> Option<&str> {
        self.task(task_id).and_then(|t| t.output.as_deref())
    }

    /// Output of the most recent successful call to `tool` across all tasks
    pub fn last_tool_output(&self, tool: &str) -> Option<&str> {
        self.tasks
            .iter()
            .flat_map(|t| t.invocations.iter())
            .filter(|inv| inv.success && inv.tool == tool)
            .last()
            .map(|inv| inv.output.as_str())
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_first_url() {
        assert_eq!(
            extract_first_url("Summarize https://example.com/news. Thanks"),
            Some("https://example.com/news".to_string())
        );
        assert_eq!(
            extract_first_url("compare (http://a.example/x) and https://b.example"),
            Some("http://a.example/x".to_string())
        );
        assert_eq!(extract_first_url("no link here"), None);
        assert_eq!(extract_first_url("broken https://"), None);
        assert_eq!(
            extract_first_url("see https://. or https://example.com"),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn test_run_input_defaults_url_from_goal() {
        let input = RunInput::new("What does https://rust-lang.org say about safety?");
        assert_eq!(input.url.as_deref(), Some("https://rust-lang.org"));
        assert!(!input.run_id.is_empty());

        let input = RunInput::new("What is new?").with_url("https://blog.rust-lang.org");
        assert_eq!(input.url.as_deref(), Some("https://blog.rust-lang.org"));
    }

    #[test]
    fn test_task_transitions() {
        let mut record = TaskRecord::new("research", "researcher");
        assert!(record.transition(TaskStatus::Waiting));
        assert!(!record.transition(TaskStatus::Succeeded));
        assert!(record.transition(TaskStatus::Running));
        assert!(record.started_at.is_some());
        assert!(!record.transition(TaskStatus::Running));
        assert!(!record.transition(TaskStatus::Waiting));
        assert_eq!(record.status, TaskStatus::Running);
        assert!(record.succeed("facts".to_string()));
        assert_eq!(record.output.as_deref(), Some("facts"));
        assert!(record.finished_at.is_some());

        // terminal states are final
        assert!(!record.transition(TaskStatus::Running));
        assert!(!record.fail("late"));
        assert_eq!(record.status, TaskStatus::Succeeded);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::Waiting.to_string(), "waiting");
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(serde_json::to_value(RunStatus::Succeeded).unwrap(), json!("succeeded"));
    }

    #[test]
    fn test_last_tool_output_skips_failures() {
        let input = RunInput::new("goal");
        let mut report = RunReport::new(&input, "summarize");
        let mut record = TaskRecord::new("research", "researcher");
        record.invocations.push(ToolInvocation {
            tool: "web_fetch".to_string(),
            arguments: json!({}),
            success: true,
            output: "first page".to_string(),
            duration_ms: 3,
        });
        record.invocations.push(ToolInvocation {
            tool: "web_fetch".to_string(),
            arguments: json!({}),
            success: false,
            output: "HTTP 500".to_string(),
            duration_ms: 3,
        });
        report.tasks.push(record);

        assert_eq!(report.last_tool_output("web_fetch"), Some("first page"));
        assert_eq!(report.last_tool_output("other"), None);
        assert!(report.result().is_err());
    }
}
