//! Crew API endpoints
//!
//! Submitting a question runs the crew to completion and returns the answer
//! or a failure description. A run can be cancelled from another request while
//! it is in flight.

use actix_web::{web, HttpResponse, Responder};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::crew::{extract_first_url, RunInput, RunReport, RunStatus, TaskRecord};
use crate::error::FailureSummary;
use crate::tools::builtin::WEB_FETCH_TOOL;
use crate::AppState;

const MISSING_URL_MESSAGE: &str = "Please provide a valid website URL in your query.";

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/crew")
            .route("", web::get().to(describe_crew))
            .route("/run", web::post().to(run_crew))
            .route("/runs", web::get().to(list_runs))
            .route("/runs/{run_id}/cancel", web::post().to(cancel_run)),
    );
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    query: String,
    #[serde(default)]
    url: Option<String>,
    /// Client-chosen id, so the run can be cancelled while it is in flight
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    success: bool,
    run_id: String,
    status: RunStatus,
    url: Option<String>,
    /// Page text the researcher fetched, if any
    scraped: Option<String>,
    answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureSummary>,
    tasks: Vec<TaskRecord>,
    duration_ms: Option<i64>,
}

impl From<RunReport> for RunResponse {
    fn from(report: RunReport) -> Self {
        let failure = report.failure.as_ref().map(|f| f.summary()).or_else(|| {
            (report.status == RunStatus::Cancelled).then(|| FailureSummary {
                task_id: String::new(),
                stage: "cancelled".to_string(),
                message: "run was cancelled".to_string(),
            })
        });

        RunResponse {
            success: report.is_success(),
            scraped: report.last_tool_output(WEB_FETCH_TOOL).map(str::to_string),
            duration_ms: report.duration_ms(),
            run_id: report.run_id,
            status: report.status,
            url: report.url,
            answer: report.final_output,
            failure,
            tasks: report.tasks,
        }
    }
}

/// A run id claimed in the in-flight map, released when dropped.
///
/// The handler future is dropped when the client disconnects, so the entry
/// must not depend on the run finishing.
struct RunSlot {
    runs: Arc<DashMap<String, CancellationToken>>,
    run_id: String,
    token: CancellationToken,
}

impl RunSlot {
    /// Claim `run_id`, or `None` if a run with that id is already in flight
    fn claim(runs: &Arc<DashMap<String, CancellationToken>>, run_id: &str) -> Option<Self> {
        let token = CancellationToken::new();
        match runs.entry(run_id.to_string()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(vacant) => {
                vacant.insert(token.clone());
            }
        }
        Some(RunSlot {
            runs: Arc::clone(runs),
            run_id: run_id.to_string(),
            token,
        })
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        // The id stays claimed until here, so the entry is still ours
        if self.runs.remove(&self.run_id).is_some() {
            log::debug!("[CREW] Run {} released", self.run_id);
        }
    }
}

fn error_response(status: actix_web::http::StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({
        "success": false,
        "error": message
    }))
}

async fn describe_crew(state: web::Data<AppState>) -> impl Responder {
    let crew = &state.crew;
    HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "process": crew.settings().process.as_str(),
        "order": crew.execution_order(),
        "terminal": crew.terminal_task(),
        "agents": crew.agents().iter().collect::<Vec<_>>(),
        "tasks": crew.graph().iter().collect::<Vec<_>>()
    }))
}

async fn run_crew(state: web::Data<AppState>, body: web::Json<RunRequest>) -> impl Responder {
    let request = body.into_inner();
    let query = request.query.trim();
    if query.is_empty() {
        return error_response(
            actix_web::http::StatusCode::BAD_REQUEST,
            "Please enter a question about a website.",
        );
    }

    let url = request
        .url
        .map(|u| u.trim().to_string())
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .or_else(|| extract_first_url(query));
    let Some(url) = url else {
        return error_response(actix_web::http::StatusCode::BAD_REQUEST, MISSING_URL_MESSAGE);
    };

    let run_id = request
        .run_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(slot) = RunSlot::claim(&state.runs, &run_id) else {
        return error_response(
            actix_web::http::StatusCode::CONFLICT,
            &format!("Run '{}' is already in progress", run_id),
        );
    };

    log::info!("[CREW] Run {} submitted for {}", run_id, url);
    let input = RunInput::new(query).with_url(url).with_run_id(run_id);
    let report = state.crew.run_with_cancel(input, slot.token()).await;
    drop(slot);

    let response = RunResponse::from(report);
    match response.status {
        RunStatus::Failed => HttpResponse::BadGateway().json(response),
        _ => HttpResponse::Ok().json(response),
    }
}

async fn list_runs(state: web::Data<AppState>) -> impl Responder {
    let mut runs: Vec<String> = state.runs.iter().map(|entry| entry.key().clone()).collect();
    runs.sort();
    HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "runs": runs
    }))
}

async fn cancel_run(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let run_id = path.into_inner();
    match state.runs.get(&run_id) {
        Some(token) => {
            token.cancel();
            log::info!("[CREW] Cancellation requested for run {}", run_id);
            HttpResponse::Ok().json(serde_json::json!({
                "success": true,
                "run_id": run_id,
                "cancelled": true
            }))
        }
        None => error_response(
            actix_web::http::StatusCode::NOT_FOUND,
            &format!("No run '{}' is in progress", run_id),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ModelBackend, ModelProvider, ModelRequest, ModelTurn, ToolCall};
    use crate::config::Config;
    use crate::crew::presets::assemble;
    use crate::crew::{CrewSettings, RetryPolicy};
    use crate::error::{BackendError, ToolError};
    use crate::telemetry::TraceBroadcaster;
    use crate::tools::{Tool, ToolContext, ToolDefinition, ToolInputSchema, ToolRegistry, ToolResult};
    use actix_web::{test, App};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct PageTool;

    #[async_trait]
    impl Tool for PageTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: WEB_FETCH_TOOL.to_string(),
                description: "Fetch a page".to_string(),
                input_schema: ToolInputSchema::default(),
            }
        }

        async fn execute(&self, _params: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::success("The museum opens at 9am."))
        }
    }

    /// Researcher fetches once; everyone answers on the next turn
    struct StubBackend {
        fail: bool,
    }

    #[async_trait]
    impl ModelBackend for StubBackend {
        async fn generate(&self, request: &ModelRequest) -> Result<ModelTurn, BackendError> {
            if self.fail {
                return Err(BackendError::Api {
                    status: 401,
                    message: "Incorrect API key provided".to_string(),
                });
            }
            if !request.tools.is_empty() && request.tool_history.is_empty() {
                return Ok(ModelTurn::ToolCalls(vec![ToolCall {
                    id: "call_1".to_string(),
                    name: WEB_FETCH_TOOL.to_string(),
                    arguments: json!({"url": "https://museum.example"}),
                }]));
            }
            Ok(ModelTurn::Final("It opens at 9am.".to_string()))
        }
    }

    /// Never answers, like a model call still in flight
    struct HangingBackend;

    #[async_trait]
    impl ModelBackend for HangingBackend {
        async fn generate(&self, _request: &ModelRequest) -> Result<ModelTurn, BackendError> {
            std::future::pending::<Result<ModelTurn, BackendError>>().await
        }
    }

    fn state(fail: bool) -> web::Data<AppState> {
        state_with(Arc::new(StubBackend { fail }))
    }

    fn state_with(backend: Arc<dyn ModelBackend>) -> web::Data<AppState> {
        let config = Config::from_lookup(|key| match key {
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            _ => None,
        })
        .unwrap();

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(PageTool));
        let crew = assemble(
            ModelProvider::new().with_backend(config.openai.model.clone(), backend),
            tools,
            &config.openai.model,
            CrewSettings {
                backend_retry: RetryPolicy::no_delay(2),
                ..CrewSettings::default()
            },
            TraceBroadcaster::new(),
        )
        .unwrap();

        web::Data::new(AppState::new(config, Arc::new(crew)))
    }

    #[actix_web::test]
    async fn test_run_returns_answer_and_scraped_text() {
        let app = test::init_service(App::new().app_data(state(false)).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/crew/run")
            .set_json(json!({"query": "When does https://museum.example open?"}))
            .to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(resp["success"], true);
        assert_eq!(resp["status"], "succeeded");
        assert_eq!(resp["url"], "https://museum.example");
        assert_eq!(resp["answer"], "It opens at 9am.");
        assert_eq!(resp["scraped"], "The museum opens at 9am.");
        assert_eq!(resp["tasks"].as_array().unwrap().len(), 2);
    }

    #[actix_web::test]
    async fn test_missing_url_is_rejected() {
        let app = test::init_service(App::new().app_data(state(false)).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/crew/run")
            .set_json(json!({"query": "When does the museum open?"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], MISSING_URL_MESSAGE);
    }

    #[actix_web::test]
    async fn test_failed_run_reports_stage() {
        let app = test::init_service(App::new().app_data(state(true)).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/crew/run")
            .set_json(json!({"query": "Summarize", "url": "https://museum.example"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_GATEWAY);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["failure"]["task_id"], "research");
        assert_eq!(body["failure"]["stage"], "model");
        assert!(body["answer"].is_null());
    }

    #[actix_web::test]
    async fn test_cancel_unknown_and_active_runs() {
        let state = state(false);
        state.runs.insert("run-1".to_string(), CancellationToken::new());
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::post().uri("/api/crew/runs/nope/cancel").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);

        let req = test::TestRequest::post().uri("/api/crew/runs/run-1/cancel").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert!(state.runs.get("run-1").unwrap().is_cancelled());
    }

    #[actix_web::test]
    async fn test_describe_crew() {
        let app = test::init_service(App::new().app_data(state(false)).configure(config)).await;

        let req = test::TestRequest::get().uri("/api/crew").to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(resp["order"], json!(["research", "answer"]));
        assert_eq!(resp["terminal"], "answer");
        assert_eq!(resp["agents"][0]["id"], "researcher");
        assert_eq!(resp["process"], "sequential");
    }

    #[actix_web::test]
    async fn test_disconnected_client_releases_run_id() {
        let state = state_with(Arc::new(HangingBackend));
        let request = RunRequest {
            query: "When does https://museum.example open?".to_string(),
            url: None,
            run_id: Some("r1".to_string()),
        };

        let mut run = Box::pin(run_crew(state.clone(), web::Json(request)));
        tokio::select! {
            _ = &mut run => panic!("run should still be waiting on the model"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
        assert!(state.runs.contains_key("r1"));

        // actix drops the handler future when the client goes away
        drop(run);
        assert!(state.runs.is_empty());
    }

    #[std::prelude::v1::test]
    fn test_run_id_is_claimed_once() {
        let runs = Arc::new(DashMap::new());

        let first = RunSlot::claim(&runs, "r1").unwrap();
        assert!(RunSlot::claim(&runs, "r1").is_none());
        assert_eq!(runs.len(), 1);

        drop(first);
        assert!(runs.is_empty());
        assert!(RunSlot::claim(&runs, "r1").is_some());
    }

    #[actix_web::test]
    async fn test_duplicate_run_id_is_a_conflict() {
        let state = state(false);
        let _claimed = RunSlot::claim(&state.runs, "busy").unwrap();
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/crew/run")
            .set_json(json!({"query": "https://museum.example hours?", "run_id": "busy"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::CONFLICT);
        assert_eq!(state.runs.len(), 1);
    }
}
