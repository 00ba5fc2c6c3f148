//! The crew: runs a validated task graph against the agent registry
//!
//! Each task is a loop of backend calls. A call either ends the task with a
//! final answer or asks for tools; tool results (including failures) go back to
//! the model as observations and the loop continues. Backend failures are
//! retried with backoff, tool failures only end the task once the same tool has
//! failed too many times in a row.

use super::agent::AgentRegistry;
use super::retry::RetryPolicy;
use super::run::{RunInput, RunReport, RunStatus, TaskRecord, TaskStatus};
use super::task::{TaskGraph, TaskSpec};
use crate::ai::{Message, ModelProvider, ModelRequest, ModelTurn, ToolHistoryEntry, ToolResponse};
use crate::error::{GraphError, RunFailure, TaskError, ToolError};
use crate::telemetry::{TraceBroadcaster, TraceEvent};
use crate::tools::{ToolContext, ToolInvocation, ToolRegistry};
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// How ready tasks are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessMode {
    /// One task at a time, in topological order
    #[default]
    Sequential,
    /// Every task whose dependencies have succeeded runs at once
    Concurrent,
}

impl ProcessMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sequential" => Some(ProcessMode::Sequential),
            "concurrent" | "parallel" => Some(ProcessMode::Concurrent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessMode::Sequential => "sequential",
            ProcessMode::Concurrent => "concurrent",
        }
    }
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CrewSettings {
    pub process: ProcessMode,
    pub backend_retry: RetryPolicy,
    /// Consecutive failures of one tool tolerated within a task
    pub tool_retry_budget: u32,
    /// Tool calls allowed per task
    pub max_tool_calls: u32,
    /// Ask the terminal task for `{reasoning, answer}` JSON and trace the
    /// reasoning separately
    pub capture_reasoning: bool,
}

impl Default for CrewSettings {
    fn default() -> Self {
        CrewSettings {
            process: ProcessMode::Sequential,
            backend_retry: RetryPolicy::default(),
            tool_retry_budget: 3,
            max_tool_calls: 8,
            capture_reasoning: false,
        }
    }
}

/// What one task execution produced, merged into its record by the run loop
struct TaskOutcome {
    backend_calls: u32,
    retries: u32,
    invocations: Vec<ToolInvocation>,
    result: Result<String, TaskError>,
}

impl TaskOutcome {
    fn new() -> Self {
        TaskOutcome {
            backend_calls: 0,
            retries: 0,
            invocations: Vec::new(),
            result: Err(TaskError::Cancelled),
        }
    }

    fn finish(mut self, result: Result<String, TaskError>) -> Self {
        self.result = result;
        self
    }
}

pub struct Crew {
    agents: AgentRegistry,
    graph: TaskGraph,
    order: Vec<String>,
    terminal: String,
    models: Arc<ModelProvider>,
    tools: Arc<ToolRegistry>,
    trace: TraceBroadcaster,
    settings: CrewSettings,
}

impl Crew {
    /// Validate the graph against the agents and fix the execution order
    pub fn new(
        agents: AgentRegistry,
        graph: TaskGraph,
        models: Arc<ModelProvider>,
        tools: Arc<ToolRegistry>,
        settings: CrewSettings,
        trace: TraceBroadcaster,
    ) -> Result<Self, GraphError> {
        graph.validate(&agents)?;
        let order = graph.topological_order()?;
        let terminal = graph.terminal_task(&order).ok_or(GraphError::Empty)?;

        log::info!(
            "[CREW] Crew ready: {} agent(s), order {:?}, terminal '{}', {} process",
            agents.len(),
            order,
            terminal,
            settings.process
        );

        Ok(Crew {
            agents,
            graph,
            order,
            terminal,
            models,
            tools,
            trace,
            settings,
        })
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    pub fn terminal_task(&self) -> &str {
        &self.terminal
    }

    pub fn settings(&self) -> &CrewSettings {
        &self.settings
    }

    pub fn trace(&self) -> &TraceBroadcaster {
        &self.trace
    }

    pub async fn run(&self, input: RunInput) -> RunReport {
        self.run_with_cancel(input, CancellationToken::new()).await
    }

    /// Execute the graph once. Cancellation stops dispatching new tasks and
    /// new backend calls; outputs already produced stay in the report.
    pub async fn run_with_cancel(&self, input: RunInput, cancel: CancellationToken) -> RunReport {
        let mut report = RunReport::new(&input, &self.terminal);
        report.status = RunStatus::Running;

        let mut slots: HashMap<String, usize> = HashMap::with_capacity(self.order.len());
        for task_id in &self.order {
            let Some(task) = self.graph.get(task_id) else {
                continue;
            };
            let mut record = TaskRecord::new(&task.id, &task.agent);
            if !task.dependencies.is_empty() {
                record.transition(TaskStatus::Waiting);
            }
            slots.insert(task_id.clone(), report.tasks.len());
            report.tasks.push(record);
        }

        log::info!(
            "[CREW] Run {} started for goal '{}' (url: {:?})",
            input.run_id,
            input.goal,
            input.url
        );
        self.trace.emit(TraceEvent::run_started(
            &input.run_id,
            &input.goal,
            input.url.as_deref(),
            &self.order,
        ));

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut failure: Option<RunFailure> = None;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                log::warn!("[CREW] Run {} cancelled, no further tasks dispatched", input.run_id);
                cancelled = true;
                break;
            }

            let ready: Vec<&TaskSpec> = self
                .order
                .iter()
                .filter_map(|id| self.graph.get(id))
                .filter(|task| {
                    slots
                        .get(&task.id)
                        .map(|&i| !report.tasks[i].status.is_terminal())
                        .unwrap_or(false)
                        && task.dependencies.iter().all(|d| outputs.contains_key(d))
                })
                .collect();
            if ready.is_empty() {
                break;
            }

            let batch: Vec<&TaskSpec> = match self.settings.process {
                ProcessMode::Sequential => ready.into_iter().take(1).collect(),
                ProcessMode::Concurrent => ready,
            };

            let mut dispatched = Vec::with_capacity(batch.len());
            for task in batch {
                report.tasks[slots[&task.id]].transition(TaskStatus::Running);
                let instruction = task.resolve(&input, &outputs);
                dispatched.push((task, instruction));
            }

            let outcomes = join_all(
                dispatched
                    .iter()
                    .map(|(task, instruction)| self.execute_task(&input, task, instruction, &cancel)),
            )
            .await;

            for ((task, _), outcome) in dispatched.iter().zip(outcomes) {
                let record = &mut report.tasks[slots[&task.id]];
                record.backend_calls = outcome.backend_calls;
                record.retries = outcome.retries;
                record.invocations = outcome.invocations;

                match outcome.result {
                    Ok(output) => {
                        record.succeed(output.clone());
                        log::info!(
                            "[CREW] Task '{}' succeeded ({} backend call(s), {} tool call(s))",
                            task.id,
                            record.backend_calls,
                            record.tool_calls()
                        );
                        self.trace.emit(TraceEvent::task_completed(
                            &input.run_id,
                            &task.id,
                            &output,
                            record.duration_ms().unwrap_or(0),
                        ));
                        outputs.insert(task.id.clone(), output);
                    }
                    Err(error) => {
                        record.fail(error.to_string());
                        log::error!("[CREW] Task '{}' failed: {}", task.id, error);
                        self.trace.emit(TraceEvent::task_failed(
                            &input.run_id,
                            &task.id,
                            error.stage(),
                            &error.to_string(),
                        ));
                        if error == TaskError::Cancelled {
                            cancelled = true;
                        }
                        if failure.is_none() {
                            failure = Some(RunFailure::new(&task.id, error));
                        }
                    }
                }
            }

            if let Some(failed) = &failure {
                if !cancelled {
                    self.fail_dependents(&mut report, &slots, &input.run_id, &failed.task_id);
                }
                break;
            }
            if cancelled {
                break;
            }
        }

        report.final_output = outputs.get(&self.terminal).cloned();
        report.status = if cancelled {
            RunStatus::Cancelled
        } else if failure.is_none() && report.final_output.is_some() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        if report.status == RunStatus::Failed && failure.is_none() {
            failure = Some(RunFailure::new(
                &self.terminal,
                TaskError::DependencyFailed(self.terminal.clone()),
            ));
        }
        report.failure = failure;
        report.finished_at = Some(Utc::now());

        let error_text = report.failure.as_ref().map(|f| f.to_string());
        log::info!(
            "[CREW] Run {} finished: {} in {}ms",
            report.run_id,
            report.status,
            report.duration_ms().unwrap_or(0)
        );
        self.trace.emit(TraceEvent::run_completed(
            &report.run_id,
            &report.status.to_string(),
            report.final_output.as_deref(),
            error_text.as_deref(),
            report.duration_ms().unwrap_or(0),
        ));

        report
    }

    /// Mark every task downstream of `failed` as failed without running it
    fn fail_dependents(
        &self,
        report: &mut RunReport,
        slots: &HashMap<String, usize>,
        run_id: &str,
        failed: &str,
    ) {
        for dependent in self.graph.dependents_of(failed) {
            let Some(&i) = slots.get(&dependent) else {
                continue;
            };
            let cause = TaskError::DependencyFailed(failed.to_string());
            if report.tasks[i].fail(cause.to_string()) {
                log::warn!("[CREW] Task '{}' skipped: {}", dependent, cause);
                self.trace
                    .emit(TraceEvent::task_failed(run_id, &dependent, cause.stage(), &cause.to_string()));
            }
        }
    }

    async fn execute_task(
        &self,
        input: &RunInput,
        task: &TaskSpec,
        instruction: &str,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let mut outcome = TaskOutcome::new();

        let Some(agent) = self.agents.get(&task.agent) else {
            return outcome.finish(Err(TaskError::MissingAgent(task.agent.clone())));
        };

        log::info!("[CREW] Task '{}' started by agent '{}'", task.id, agent.id);
        log::debug!("[CREW] Task '{}' instruction:\n{}", task.id, instruction);
        self.trace
            .emit(TraceEvent::task_started(&input.run_id, &task.id, &agent.id, instruction));

        // Only the answer that leaves the crew is split into reasoning and answer
        let json_answer = self.settings.capture_reasoning && task.id == self.terminal;
        let tool_definitions = self.tools.definitions_for(&agent.tools);
        let mut request = ModelRequest::new(
            agent.model.clone(),
            vec![
                Message::system(agent.system_prompt(&tool_definitions, json_answer)),
                Message::user(instruction),
            ],
        )
        .with_tools(tool_definitions)
        .with_temperature(agent.temperature);
        request.json_answer = json_answer;

        let context = ToolContext::new(&input.run_id, &task.id, &agent.id);
        let tool_retry_budget = self.settings.tool_retry_budget.max(1);
        let mut tool_calls_made: u32 = 0;
        let mut consecutive_failures: HashMap<String, u32> = HashMap::new();

        loop {
            let turn = match self
                .call_backend(&request, &input.run_id, &task.id, &mut outcome, cancel)
                .await
            {
                Ok(turn) => turn,
                Err(e) => return outcome.finish(Err(e)),
            };

            let calls = match turn {
                ModelTurn::Final(content) => {
                    let answer = if json_answer {
                        let (reasoning, answer) = split_reasoning(&content);
                        if let Some(reasoning) = reasoning {
                            self.trace
                                .emit(TraceEvent::model_reasoning(&input.run_id, &task.id, &reasoning));
                        }
                        answer
                    } else {
                        content
                    };
                    return outcome.finish(Ok(answer));
                }
                ModelTurn::ToolCalls(calls) => calls,
            };

            let mut responses = Vec::with_capacity(calls.len());
            for call in &calls {
                if tool_calls_made >= self.settings.max_tool_calls {
                    log::warn!(
                        "[CREW] Task '{}' exhausted its tool-call budget of {}",
                        task.id,
                        self.settings.max_tool_calls
                    );
                    return outcome.finish(Err(TaskError::ToolBudgetExhausted(
                        self.settings.max_tool_calls,
                    )));
                }
                tool_calls_made += 1;

                self.trace
                    .emit(TraceEvent::tool_call(&input.run_id, &task.id, &call.name, &call.arguments));

                if !agent.can_use(&call.name) {
                    let message = format!(
                        "Error: tool '{}' is not available to you. Available tools: {}",
                        call.name,
                        if agent.tools.is_empty() {
                            "none".to_string()
                        } else {
                            agent.tools.join(", ")
                        }
                    );
                    log::warn!("[CREW] Agent '{}' requested unbound tool '{}'", agent.id, call.name);
                    outcome.invocations.push(invocation(&call.name, &call.arguments, false, &message, 0));
                    self.trace.emit(TraceEvent::tool_result(
                        &input.run_id,
                        &task.id,
                        &call.name,
                        false,
                        0,
                        &message,
                    ));
                    responses.push(ToolResponse::error(&call.id, message));
                    continue;
                }

                let started = Instant::now();
                let result = self
                    .tools
                    .execute(&call.name, call.arguments.clone(), &context)
                    .await;
                let duration_ms = started.elapsed().as_millis() as u64;

                match result {
                    Ok(result) => {
                        consecutive_failures.remove(&call.name);
                        log::info!(
                            "[CREW] Tool '{}' succeeded for task '{}' ({} chars, {}ms)",
                            call.name,
                            task.id,
                            result.content.len(),
                            duration_ms
                        );
                        outcome.invocations.push(invocation(
                            &call.name,
                            &call.arguments,
                            true,
                            &result.content,
                            duration_ms,
                        ));
                        self.trace.emit(TraceEvent::tool_result(
                            &input.run_id,
                            &task.id,
                            &call.name,
                            true,
                            duration_ms,
                            &result.content,
                        ));
                        responses.push(ToolResponse::success(&call.id, result.content));
                    }
                    Err(error) => {
                        let failures = consecutive_failures.entry(call.name.clone()).or_insert(0);
                        *failures += 1;
                        let failures = *failures;
                        let observation = tool_error_observation(&error);

                        log::warn!(
                            "[CREW] Tool '{}' failed for task '{}' ({}/{}): {}",
                            call.name,
                            task.id,
                            failures,
                            tool_retry_budget,
                            error
                        );
                        outcome.invocations.push(invocation(
                            &call.name,
                            &call.arguments,
                            false,
                            &observation,
                            duration_ms,
                        ));
                        self.trace.emit(TraceEvent::tool_result(
                            &input.run_id,
                            &task.id,
                            &call.name,
                            false,
                            duration_ms,
                            &observation,
                        ));

                        if failures >= tool_retry_budget {
                            return outcome.finish(Err(TaskError::Tool {
                                tool: call.name.clone(),
                                failures,
                                source: error,
                            }));
                        }
                        responses.push(ToolResponse::error(&call.id, observation));
                    }
                }
            }

            request.tool_history.push(ToolHistoryEntry::new(calls, responses));
        }
    }

    /// One model call with bounded retries and cancellable backoff
    async fn call_backend(
        &self,
        request: &ModelRequest,
        run_id: &str,
        task_id: &str,
        outcome: &mut TaskOutcome,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn, TaskError> {
        let policy = &self.settings.backend_retry;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            attempt += 1;
            outcome.backend_calls += 1;
            let started = Instant::now();
            let result = self.models.generate(request).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(turn) => {
                    let summary = match &turn {
                        ModelTurn::Final(content) => content.clone(),
                        ModelTurn::ToolCalls(calls) => format!(
                            "tool calls: {}",
                            calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
                        ),
                    };
                    self.trace.emit(TraceEvent::model_generation(
                        run_id,
                        task_id,
                        &request.model,
                        attempt,
                        duration_ms,
                        Ok(summary.as_str()),
                    ));
                    return Ok(turn);
                }
                Err(error) => {
                    let message = error.to_string();
                    self.trace.emit(TraceEvent::model_generation(
                        run_id,
                        task_id,
                        &request.model,
                        attempt,
                        duration_ms,
                        Err(message.as_str()),
                    ));

                    if !policy.should_retry(attempt, &error) {
                        log::error!(
                            "[CREW] Backend call for task '{}' failed after {} attempt(s): {}",
                            task_id,
                            attempt,
                            error
                        );
                        return Err(TaskError::Backend {
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let delay = policy.delay_for(attempt, &error);
                    outcome.retries += 1;
                    log::warn!(
                        "[CREW] Backend call for task '{}' failed (attempt {}/{}), retrying in {}ms: {}",
                        task_id,
                        attempt,
                        policy.max_attempts,
                        delay.as_millis(),
                        error
                    );
                    self.trace.emit(TraceEvent::task_retry(
                        run_id,
                        task_id,
                        attempt,
                        delay.as_millis() as u64,
                        &message,
                    ));

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

fn invocation(tool: &str, arguments: &Value, success: bool, output: &str, duration_ms: u64) -> ToolInvocation {
    ToolInvocation {
        tool: tool.to_string(),
        arguments: arguments.clone(),
        success,
        output: output.to_string(),
        duration_ms,
    }
}

/// Text the model sees when a tool fails
fn tool_error_observation(error: &ToolError) -> String {
    match error.retry_after_secs() {
        Some(secs) => format!(
            "Error: {}. This looks transient; wait about {}s before calling the tool again.",
            error, secs
        ),
        None => format!("Error: {}", error),
    }
}

/// Split a `{"reasoning": .., "answer": ..}` reply; anything else is all answer
pub fn split_reasoning(content: &str) -> (Option<String>, String) {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => match map.get("answer") {
            Some(Value::String(answer)) => (
                map.get("reasoning").and_then(|r| r.as_str()).map(str::to_string),
                answer.clone(),
            ),
            Some(other) => (
                map.get("reasoning").and_then(|r| r.as_str()).map(str::to_string),
                other.to_string(),
            ),
            None => (None, content.to_string()),
        },
        _ => (None, content.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ModelBackend, ToolCall};
    use crate::crew::agent::AgentSpec;
    use crate::error::BackendError;
    use crate::telemetry::EventType;
    use crate::tools::{Tool, ToolDefinition, ToolInputSchema, ToolResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    const MODEL: &str = "test-model";

    /// Replays a fixed list of backend results and records every request
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<ModelTurn, BackendError>>>,
        requests: Mutex<Vec<ModelRequest>>,
        on_call: Option<CancellationToken>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<ModelTurn, BackendError>>) -> Arc<Self> {
            Arc::new(ScriptedBackend {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
                on_call: None,
            })
        }

        /// Cancels `token` during the first call
        fn cancelling(script: Vec<Result<ModelTurn, BackendError>>, token: CancellationToken) -> Arc<Self> {
            Arc::new(ScriptedBackend {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
                on_call: Some(token),
            })
        }

        fn requests(&self) -> Vec<ModelRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn generate(&self, request: &ModelRequest) -> Result<ModelTurn, BackendError> {
            self.requests.lock().push(request.clone());
            if let Some(token) = &self.on_call {
                token.cancel();
            }
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::InvalidResponse("script exhausted".into())))
        }
    }

    /// Answers with the first line of the instruction after a short pause
    struct EchoBackend {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl EchoBackend {
        fn new() -> Arc<Self> {
            Arc::new(EchoBackend {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for EchoBackend {
        async fn generate(&self, request: &ModelRequest) -> Result<ModelTurn, BackendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let instruction = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(ModelTurn::Final(format!("done: {}", instruction)))
        }
    }

    /// Fails a fixed number of times, then returns page text
    struct FlakyTool {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyTool {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(FlakyTool {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "web_fetch".to_string(),
                description: "Fetch a page. Returns text.".to_string(),
                input_schema: ToolInputSchema::default(),
            }
        }

        async fn execute(&self, params: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let url = params["url"].as_str().unwrap_or("").to_string();
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ToolError::Status {
                    url,
                    status: 503,
                    retry_after_secs: Some(2),
                });
            }
            Ok(ToolResult::success(format!("page text of {}", url)))
        }
    }

    fn fetch_call(id: &str) -> ModelTurn {
        ModelTurn::ToolCalls(vec![ToolCall {
            id: id.to_string(),
            name: "web_fetch".to_string(),
            arguments: json!({"url": "https://example.com/x"}),
        }])
    }

    fn final_answer(text: &str) -> Result<ModelTurn, BackendError> {
        Ok(ModelTurn::Final(text.to_string()))
    }

    fn settings() -> CrewSettings {
        CrewSettings {
            backend_retry: RetryPolicy::no_delay(3),
            ..CrewSettings::default()
        }
    }

    fn research_graph() -> TaskGraph {
        TaskGraph::new()
            .with_task(TaskSpec::new("T1", "gather facts about {goal}", "researcher"))
            .with_task(
                TaskSpec::new("T2", "summarize findings:\n{T1}", "writer").depends_on("T1"),
            )
    }

    fn build_crew(
        backend: Arc<dyn ModelBackend>,
        tool: Arc<dyn Tool>,
        graph: TaskGraph,
        settings: CrewSettings,
    ) -> Crew {
        let models = ModelProvider::new().with_backend(MODEL, backend);
        let mut tools = ToolRegistry::new();
        tools.register(tool);
        let agents = AgentRegistry::new(
            vec![
                AgentSpec::new("researcher", "Researcher", "Find facts", MODEL).with_tool("web_fetch"),
                AgentSpec::new("writer", "Writer", "Summarize", MODEL),
            ],
            &models,
            &tools,
        )
        .unwrap();
        Crew::new(
            agents,
            graph,
            Arc::new(models),
            Arc::new(tools),
            settings,
            TraceBroadcaster::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_research_then_summarize() {
        let backend = ScriptedBackend::new(vec![
            Ok(fetch_call("call_1")),
            final_answer("Facts about X"),
            final_answer("Summary of X"),
        ]);
        let tool = FlakyTool::new(0);
        let crew = build_crew(backend.clone(), tool.clone(), research_graph(), settings());

        let report = crew.run(RunInput::new("X")).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.result(), Ok("Summary of X"));
        assert_eq!(report.output("T1"), Some("Facts about X"));
        let ids: Vec<&str> = report.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["T1", "T2"]);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.last_tool_output("web_fetch"), Some("page text of https://example.com/x"));

        let requests = backend.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].messages[1].content, "gather facts about X");
        assert_eq!(requests[0].tools.len(), 1);
        assert_eq!(requests[1].tool_history.len(), 1);
        assert!(!requests[1].tool_history[0].tool_responses[0].is_error);
        assert!(requests[2].tools.is_empty());
        assert_eq!(requests[2].messages[1].content, "summarize findings:\nFacts about X");
    }

    #[tokio::test]
    async fn test_backend_exhaustion_fails_run_and_skips_dependents() {
        let backend = ScriptedBackend::new(vec![
            Ok(fetch_call("call_1")),
            Err(BackendError::Timeout(120)),
            Err(BackendError::Timeout(120)),
            Err(BackendError::Timeout(120)),
        ]);
        let tool = FlakyTool::new(u32::MAX);
        let crew = build_crew(backend.clone(), tool, research_graph(), settings());

        let report = crew.run(RunInput::new("X")).await;

        assert_eq!(report.status, RunStatus::Failed);
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.task_id, "T1");
        assert_eq!(
            failure.cause,
            TaskError::Backend {
                attempts: 3,
                source: BackendError::Timeout(120)
            }
        );
        assert_eq!(report.task("T1").unwrap().retries, 2);

        let t2 = report.task("T2").unwrap();
        assert_eq!(t2.status, TaskStatus::Failed);
        assert!(t2.started_at.is_none());
        assert_eq!(t2.backend_calls, 0);
        assert_eq!(backend.requests().len(), 4);
        assert!(report.final_output.is_none());
    }

    #[tokio::test]
    async fn test_tool_failure_then_success_completes() {
        let backend = ScriptedBackend::new(vec![
            Ok(fetch_call("call_1")),
            Ok(fetch_call("call_2")),
            final_answer("facts"),
            final_answer("summary"),
        ]);
        let tool = FlakyTool::new(1);
        let crew = build_crew(backend.clone(), tool, research_graph(), settings());

        let report = crew.run(RunInput::new("X")).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.final_output.as_deref(), Some("summary"));

        let t1 = report.task("T1").unwrap();
        assert_eq!(t1.invocations.len(), 2);
        assert!(!t1.invocations[0].success);
        assert!(t1.invocations[1].success);

        // the failure reached the model as an observation with the backoff hint
        let requests = backend.requests();
        let observation = &requests[1].tool_history[0].tool_responses[0];
        assert!(observation.is_error);
        assert!(observation.content.contains("HTTP 503"));
        assert!(observation.content.contains("2s"));
    }

    #[tokio::test]
    async fn test_repeated_tool_failure_fails_task() {
        let backend = ScriptedBackend::new(vec![Ok(fetch_call("a")), Ok(fetch_call("b"))]);
        let crew = build_crew(
            backend,
            FlakyTool::new(u32::MAX),
            research_graph(),
            CrewSettings {
                tool_retry_budget: 2,
                ..settings()
            },
        );

        let report = crew.run(RunInput::new("X")).await;

        assert_eq!(report.status, RunStatus::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.task_id, "T1");
        assert!(matches!(failure.cause, TaskError::Tool { failures: 2, .. }));
        assert_eq!(failure.summary().stage, "tool");
    }

    #[tokio::test]
    async fn test_tool_call_budget() {
        let backend = ScriptedBackend::new(vec![Ok(fetch_call("a")), Ok(fetch_call("b"))]);
        let crew = build_crew(
            backend,
            FlakyTool::new(0),
            research_graph(),
            CrewSettings {
                max_tool_calls: 1,
                ..settings()
            },
        );

        let report = crew.run(RunInput::new("X")).await;

        assert_eq!(
            report.failure.map(|f| f.cause),
            Some(TaskError::ToolBudgetExhausted(1))
        );
    }

    #[tokio::test]
    async fn test_unbound_tool_is_an_observation() {
        let backend = ScriptedBackend::new(vec![
            final_answer("facts"),
            Ok(fetch_call("call_1")),
            final_answer("summary without fetching"),
        ]);
        let tool = FlakyTool::new(0);
        let crew = build_crew(backend.clone(), tool.clone(), research_graph(), settings());

        let report = crew.run(RunInput::new("X")).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        let t2 = report.task("T2").unwrap();
        assert_eq!(t2.invocations.len(), 1);
        assert!(!t2.invocations[0].success);
        let response = &backend.requests()[2].tool_history[0].tool_responses[0];
        assert!(response.content.contains("not available"));
    }

    #[tokio::test]
    async fn test_transient_backend_error_is_retried() {
        let backend = ScriptedBackend::new(vec![
            Err(BackendError::RateLimited { retry_after_secs: None }),
            final_answer("facts"),
            final_answer("summary"),
        ]);
        let crew = build_crew(backend, FlakyTool::new(0), research_graph(), settings());

        let report = crew.run(RunInput::new("X")).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        let t1 = report.task("T1").unwrap();
        assert_eq!(t1.backend_calls, 2);
        assert_eq!(t1.retries, 1);
    }

    #[tokio::test]
    async fn test_permanent_backend_error_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(BackendError::Api {
            status: 401,
            message: "bad key".into(),
        })]);
        let crew = build_crew(backend.clone(), FlakyTool::new(0), research_graph(), settings());

        let report = crew.run(RunInput::new("X")).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(backend.requests().len(), 1);
        assert!(matches!(
            report.failure.unwrap().cause,
            TaskError::Backend { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let backend = ScriptedBackend::new(vec![]);
        let crew = build_crew(backend.clone(), FlakyTool::new(0), research_graph(), settings());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = crew.run_with_cancel(RunInput::new("X"), cancel).await;

        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(backend.requests().is_empty());
        assert!(report.tasks.iter().all(|t| t.started_at.is_none()));
    }

    #[tokio::test]
    async fn test_cancel_keeps_completed_outputs() {
        let cancel = CancellationToken::new();
        let backend = ScriptedBackend::cancelling(
            vec![final_answer("facts"), final_answer("summary")],
            cancel.clone(),
        );
        let crew = build_crew(backend.clone(), FlakyTool::new(0), research_graph(), settings());

        let report = crew.run_with_cancel(RunInput::new("X"), cancel).await;

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.output("T1"), Some("facts"));
        assert_eq!(report.task("T2").unwrap().status, TaskStatus::Waiting);
        assert_eq!(backend.requests().len(), 1);
    }

    fn fan_in_graph() -> TaskGraph {
        TaskGraph::new()
            .with_task(TaskSpec::new("a", "part a", "writer"))
            .with_task(TaskSpec::new("b", "part b", "writer"))
            .with_task(TaskSpec::new("c", "part c", "writer"))
            .with_task(
                TaskSpec::new("merge", "merge parts", "writer")
                    .depends_on("a")
                    .depends_on("b")
                    .depends_on("c"),
            )
    }

    #[tokio::test]
    async fn test_concurrent_mode_runs_independent_tasks_together() {
        let backend = EchoBackend::new();
        let crew = build_crew(
            backend.clone(),
            FlakyTool::new(0),
            fan_in_graph(),
            CrewSettings {
                process: ProcessMode::Concurrent,
                ..settings()
            },
        );

        let report = crew.run(RunInput::new("goal")).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 3);
        let merged = report.final_output.unwrap();
        assert!(merged.contains("done: part a"));
        assert!(merged.contains("done: part b"));
        assert!(merged.contains("done: part c"));
    }

    #[tokio::test]
    async fn test_sequential_mode_never_overlaps() {
        let backend = EchoBackend::new();
        let crew = build_crew(backend.clone(), FlakyTool::new(0), fan_in_graph(), settings());

        let report = crew.run(RunInput::new("goal")).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(crew.execution_order(), ["a", "b", "c", "merge"]);
        assert_eq!(crew.terminal_task(), "merge");
    }

    #[tokio::test]
    async fn test_reasoning_is_traced_not_returned() {
        let backend = ScriptedBackend::new(vec![
            final_answer("facts"),
            final_answer(r#"{"reasoning": "weighed the facts", "answer": "summary"}"#),
        ]);
        let crew = build_crew(
            backend.clone(),
            FlakyTool::new(0),
            research_graph(),
            CrewSettings {
                capture_reasoning: true,
                ..settings()
            },
        );
        let (_, mut rx) = crew.trace().subscribe();

        let report = crew.run(RunInput::new("X")).await;

        assert_eq!(report.output("T1"), Some("facts"));
        assert_eq!(report.final_output.as_deref(), Some("summary"));

        // JSON answers are requested from the terminal task only
        let requests = backend.requests();
        assert!(!requests[0].json_answer);
        assert!(!requests[0].messages[0].content.contains("\"reasoning\""));
        assert!(requests[1].json_answer);
        assert!(requests[1].messages[0].content.contains("\"reasoning\""));

        let mut reasoning = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.is(EventType::ModelReasoning) {
                assert_eq!(event.task_id.as_deref(), Some("T2"));
                reasoning.push(event.data["reasoning"].as_str().unwrap_or("").to_string());
            }
        }
        assert_eq!(reasoning, vec!["weighed the facts".to_string()]);
    }

    #[tokio::test]
    async fn test_trace_covers_lifecycle() {
        let backend = ScriptedBackend::new(vec![
            Ok(fetch_call("call_1")),
            final_answer("facts"),
            final_answer("summary"),
        ]);
        let crew = build_crew(backend, FlakyTool::new(0), research_graph(), settings());
        let (_, mut rx) = crew.trace().subscribe();

        crew.run(RunInput::new("X")).await;

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event);
        }
        assert_eq!(names.first().map(String::as_str), Some("run.started"));
        assert_eq!(names.last().map(String::as_str), Some("run.completed"));
        for expected in ["task.started", "tool.call", "tool.result", "model.generation", "task.completed"] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_invalid_graph_is_rejected() {
        let models = ModelProvider::new().with_backend(MODEL, ScriptedBackend::new(vec![]));
        let tools = ToolRegistry::new();
        let agents = AgentRegistry::new(
            vec![AgentSpec::new("writer", "Writer", "Write", MODEL)],
            &models,
            &tools,
        )
        .unwrap();
        let graph = TaskGraph::new()
            .with_task(TaskSpec::new("a", "x", "writer").depends_on("b"))
            .with_task(TaskSpec::new("b", "y", "writer").depends_on("a"));

        let result = Crew::new(
            agents,
            graph,
            Arc::new(models),
            Arc::new(tools),
            CrewSettings::default(),
            TraceBroadcaster::new(),
        );
        assert!(matches!(result, Err(GraphError::CyclicDependency(_))));
    }

    #[test]
    fn test_split_reasoning() {
        assert_eq!(
            split_reasoning(r#"{"reasoning":"r","answer":"a"}"#),
            (Some("r".to_string()), "a".to_string())
        );
        assert_eq!(
            split_reasoning("```json\n{\"answer\": \"only\"}\n```"),
            (None, "only".to_string())
        );
        assert_eq!(split_reasoning("not json"), (None, "not json".to_string()));
    }

    #[test]
    fn test_process_mode_parsing() {
        assert_eq!(ProcessMode::from_str("Sequential"), Some(ProcessMode::Sequential));
        assert_eq!(ProcessMode::from_str("concurrent"), Some(ProcessMode::Concurrent));
        assert_eq!(ProcessMode::from_str("hierarchical"), None);
    }
}
