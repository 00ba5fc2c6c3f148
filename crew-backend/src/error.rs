//! Error taxonomy for the crew backend
//!
//! Errors are grouped by the stage that raises them:
//!
//! - `ConfigError` - invalid or missing setup, fatal at startup
//! - `GraphError` - structural problems in the task graph, fatal before any run
//! - `BackendError` - a failed model call, retried with backoff
//! - `ToolError` - a failed tool invocation, reported back to the agent
//! - `TaskError` / `RunFailure` - terminal failure of a task and of the run

use serde::Serialize;
use thiserror::Error;

/// Setup errors detected at process start or crew construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(String),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },

    #[error("tracing credentials incomplete: {present} is set but {missing} is not")]
    IncompleteTracing { present: String, missing: String },

    #[error("duplicate agent id '{0}'")]
    DuplicateAgent(String),

    #[error("agent '{agent}' references unknown model '{model}'")]
    UnknownModel { agent: String, model: String },

    #[error("agent '{agent}' references unknown tool '{tool}'")]
    UnknownTool { agent: String, tool: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Structural errors found while validating a task graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("task graph has no tasks")]
    Empty,

    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' is assigned to unknown agent '{agent}'")]
    UnknownAgent { task: String, agent: String },

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("terminal task '{0}' is not in the graph")]
    UnknownTerminal(String),
}

/// Failures surfaced by a model backend call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("rate limited by the model provider")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("model call timed out after {0}s")]
    Timeout(u64),

    #[error("invalid model response: {0}")]
    InvalidResponse(String),

    #[error("model API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("no backend serves model '{0}'")]
    UnknownModel(String),
}

impl BackendError {
    /// Whether another attempt may succeed.
    ///
    /// Authentication and request errors are permanent; everything the
    /// provider may recover from (throttling, timeouts, 5xx, garbled bodies)
    /// is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::RateLimited { .. }
            | BackendError::Timeout(_)
            | BackendError::InvalidResponse(_)
            | BackendError::Network(_) => true,
            BackendError::Api { status, .. } => *status == 408 || *status >= 500,
            BackendError::UnknownModel(_) => false,
        }
    }

    /// Server-provided retry hint, if any
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            BackendError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Failures surfaced by a tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Blocked(String),

    #[error("could not reach {url}: {reason}")]
    Unreachable {
        url: String,
        reason: String,
        retry_after_secs: Option<u64>,
    },

    #[error("HTTP {status} for {url}")]
    Status {
        url: String,
        status: u16,
        retry_after_secs: Option<u64>,
    },

    #[error("could not extract content: {0}")]
    Parse(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),
}

impl ToolError {
    /// Backoff hint for transient failures, passed on to the agent
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ToolError::Unreachable { retry_after_secs, .. }
            | ToolError::Status { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Why a single task failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("backend call failed after {attempts} attempt(s): {source}")]
    Backend {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("tool '{tool}' failed {failures} time(s) in a row: {source}")]
    Tool {
        tool: String,
        failures: u32,
        #[source]
        source: ToolError,
    },

    #[error("tool-call budget of {0} exhausted before a final answer")]
    ToolBudgetExhausted(u32),

    #[error("dependency '{0}' did not succeed")]
    DependencyFailed(String),

    #[error("agent '{0}' is not registered")]
    MissingAgent(String),

    #[error("run was cancelled")]
    Cancelled,
}

impl TaskError {
    /// Short label of the failing stage, for display
    pub fn stage(&self) -> &'static str {
        match self {
            TaskError::Backend { .. } => "model",
            TaskError::Tool { .. } => "tool",
            TaskError::ToolBudgetExhausted(_) => "tool_budget",
            TaskError::DependencyFailed(_) => "dependency",
            TaskError::MissingAgent(_) => "configuration",
            TaskError::Cancelled => "cancelled",
        }
    }
}

/// Terminal failure of a run, naming the task that caused it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task '{task_id}' failed: {cause}")]
pub struct RunFailure {
    pub task_id: String,
    pub cause: TaskError,
}

impl RunFailure {
    pub fn new(task_id: impl Into<String>, cause: TaskError) -> Self {
        Self {
            task_id: task_id.into(),
            cause,
        }
    }

    /// Serializable summary shown to the user
    pub fn summary(&self) -> FailureSummary {
        FailureSummary {
            task_id: self.task_id.clone(),
            stage: self.cause.stage().to_string(),
            message: self.cause.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub task_id: String,
    pub stage: String,
    pub message: String,
}

/// Errors raised while assembling a crew
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrewError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
