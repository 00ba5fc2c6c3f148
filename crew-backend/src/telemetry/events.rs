use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Longest text excerpt attached to an event
const PREVIEW_CHARS: usize = 500;

/// Observation event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Startup,
    RunStarted,
    RunCompleted,
    TaskStarted,
    TaskRetry,
    TaskCompleted,
    TaskFailed,
    ModelGeneration,
    ModelReasoning,
    ToolCall,
    ToolResult,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::TaskStarted => "task.started",
            Self::TaskRetry => "task.retry",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::ModelGeneration => "model.generation",
            Self::ModelReasoning => "model.reasoning",
            Self::ToolCall => "tool.call",
            Self::ToolResult => "tool.result",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

/// One observation of the crew at work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl TraceEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event: event.into(),
            run_id: None,
            task_id: None,
            timestamp: Utc::now(),
            data,
        }
    }

    fn for_run(event: EventType, run_id: &str, data: Value) -> Self {
        let mut trace = Self::new(event, data);
        trace.run_id = Some(run_id.to_string());
        trace
    }

    fn for_task(event: EventType, run_id: &str, task_id: &str, data: Value) -> Self {
        let mut trace = Self::for_run(event, run_id, data);
        trace.task_id = Some(task_id.to_string());
        trace
    }

    pub fn is(&self, event: EventType) -> bool {
        self.event == event.as_str()
    }

    /// One-line rendering for the log, with the payload cut to a preview.
    /// The collector always receives the full payload.
    pub fn log_line(&self) -> String {
        format!(
            "{} run={} task={} {}",
            self.event,
            self.run_id.as_deref().unwrap_or("-"),
            self.task_id.as_deref().unwrap_or("-"),
            preview(&self.data.to_string())
        )
    }

    /// Whether the event reports a failure
    pub fn is_error(&self) -> bool {
        self.is(EventType::TaskFailed)
            || self.data.get("success") == Some(&Value::Bool(false))
            || self.data.get("status").and_then(|s| s.as_str()) == Some("failed")
    }

    pub fn startup(service: &str, version: &str, model: &str) -> Self {
        Self::new(
            EventType::Startup,
            json!({
                "service": service,
                "version": version,
                "model": model
            }),
        )
    }

    pub fn run_started(run_id: &str, goal: &str, url: Option<&str>, order: &[String]) -> Self {
        Self::for_run(
            EventType::RunStarted,
            run_id,
            json!({
                "goal": goal,
                "url": url,
                "order": order
            }),
        )
    }

    pub fn run_completed(
        run_id: &str,
        status: &str,
        output: Option<&str>,
        error: Option<&str>,
        duration_ms: i64,
    ) -> Self {
        Self::for_run(
            EventType::RunCompleted,
            run_id,
            json!({
                "status": status,
                "output": output,
                "error": error,
                "duration_ms": duration_ms
            }),
        )
    }

    pub fn task_started(run_id: &str, task_id: &str, agent_id: &str, instruction: &str) -> Self {
        Self::for_task(
            EventType::TaskStarted,
            run_id,
            task_id,
            json!({
                "agent": agent_id,
                "instruction": instruction
            }),
        )
    }

    /// Backend call failed and will be attempted again after `delay_ms`
    pub fn task_retry(run_id: &str, task_id: &str, attempt: u32, delay_ms: u64, error: &str) -> Self {
        Self::for_task(
            EventType::TaskRetry,
            run_id,
            task_id,
            json!({
                "attempt": attempt,
                "delay_ms": delay_ms,
                "error": error
            }),
        )
    }

    pub fn task_completed(run_id: &str, task_id: &str, output: &str, duration_ms: i64) -> Self {
        Self::for_task(
            EventType::TaskCompleted,
            run_id,
            task_id,
            json!({
                "output": output,
                "duration_ms": duration_ms
            }),
        )
    }

    pub fn task_failed(run_id: &str, task_id: &str, stage: &str, error: &str) -> Self {
        Self::for_task(
            EventType::TaskFailed,
            run_id,
            task_id,
            json!({
                "stage": stage,
                "error": error
            }),
        )
    }

    pub fn model_generation(
        run_id: &str,
        task_id: &str,
        model: &str,
        attempt: u32,
        duration_ms: u64,
        outcome: Result<&str, &str>,
    ) -> Self {
        let (success, output) = match outcome {
            Ok(text) => (true, text.to_string()),
            Err(err) => (false, err.to_string()),
        };
        Self::for_task(
            EventType::ModelGeneration,
            run_id,
            task_id,
            json!({
                "model": model,
                "attempt": attempt,
                "duration_ms": duration_ms,
                "success": success,
                "output": output
            }),
        )
    }

    pub fn model_reasoning(run_id: &str, task_id: &str, reasoning: &str) -> Self {
        Self::for_task(
            EventType::ModelReasoning,
            run_id,
            task_id,
            json!({ "reasoning": reasoning }),
        )
    }

    pub fn tool_call(run_id: &str, task_id: &str, tool_name: &str, parameters: &Value) -> Self {
        Self::for_task(
            EventType::ToolCall,
            run_id,
            task_id,
            json!({
                "tool_name": tool_name,
                "parameters": parameters
            }),
        )
    }

    pub fn tool_result(
        run_id: &str,
        task_id: &str,
        tool_name: &str,
        success: bool,
        duration_ms: u64,
        content: &str,
    ) -> Self {
        Self::for_task(
            EventType::ToolResult,
            run_id,
            task_id,
            json!({
                "tool_name": tool_name,
                "success": success,
                "duration_ms": duration_ms,
                "content": content
            }),
        )
    }
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_and_scope() {
        let event = TraceEvent::tool_result("run-1", "research", "web_fetch", false, 12, "HTTP 404");
        assert_eq!(event.event, "tool.result");
        assert_eq!(event.run_id.as_deref(), Some("run-1"));
        assert_eq!(event.task_id.as_deref(), Some("research"));
        assert!(event.is_error());

        let event = TraceEvent::startup("crew-backend", "0.1.0", "gpt-4o-mini");
        assert!(event.is(EventType::Startup));
        assert!(event.run_id.is_none());
        assert!(!event.is_error());
    }

    #[test]
    fn test_full_output_is_kept_and_only_the_log_line_is_previewed() {
        let long = "x".repeat(2000);
        let event = TraceEvent::run_completed("run-1", "succeeded", Some(&long), None, 5);
        assert_eq!(event.data["output"].as_str().unwrap(), long);

        let event = TraceEvent::model_generation("run-1", "answer", "m", 1, 5, Ok(&long));
        assert_eq!(event.data["output"].as_str().unwrap().len(), 2000);

        let line = event.log_line();
        assert!(line.starts_with("model.generation run=run-1 task=answer "));
        assert!(line.ends_with("..."));
        assert!(line.len() < 600);
    }
}
