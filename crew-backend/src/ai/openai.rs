use crate::ai::types::{ModelRequest, ModelTurn, ToolCall, ToolHistoryEntry, ToolResponse};
use crate::ai::ModelBackend;
use crate::error::{BackendError, ConfigError};
use crate::tools::http_retry::retry_after_secs;
use crate::tools::ToolDefinition;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Chat-completions client for OpenAI and compatible endpoints
#[derive(Clone)]
pub struct OpenAIClient {
    client: Client,
    endpoint: String,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct OpenAICompletionRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Clone, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAICompletionResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAIToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

impl OpenAIClient {
    pub fn new(api_key: &str, endpoint: &str, timeout_secs: u64) -> Result<Self, ConfigError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let auth_value = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| ConfigError::Invalid {
                var: "OPENAI_API_KEY".to_string(),
                reason: e.to_string(),
            })?;
        headers.insert(header::AUTHORIZATION, auth_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            timeout_secs,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(request: &ModelRequest) -> OpenAICompletionRequest {
        let mut api_messages: Vec<OpenAIMessage> = request
            .messages
            .iter()
            .map(|m| OpenAIMessage {
                role: m.role.to_string(),
                content: Some(m.content.clone()),
                tool_calls: None,
                tool_call_id: None,
            })
            .collect();

        for entry in &request.tool_history {
            api_messages.extend(Self::build_tool_result_messages(entry));
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(to_openai_tool).collect())
        };

        OpenAICompletionRequest {
            model: request.model.clone(),
            messages: api_messages,
            temperature: request.temperature,
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            response_format: request
                .json_answer
                .then(|| json!({ "type": "json_object" })),
        }
    }

    /// Assistant tool-call message followed by one tool message per observation
    pub fn build_tool_result_messages(entry: &ToolHistoryEntry) -> Vec<OpenAIMessage> {
        let mut messages = Vec::with_capacity(entry.tool_responses.len() + 1);

        let openai_tool_calls: Vec<OpenAIToolCall> = entry
            .tool_calls
            .iter()
            .map(|tc| OpenAIToolCall {
                id: tc.id.clone(),
                call_type: "function".to_string(),
                function: OpenAIFunctionCall {
                    name: tc.name.clone(),
                    arguments: tc.arguments.to_string(),
                },
            })
            .collect();

        messages.push(OpenAIMessage {
            role: "assistant".to_string(),
            // Some compatible providers reject a missing content field
            content: Some(String::new()),
            tool_calls: Some(openai_tool_calls),
            tool_call_id: None,
        });

        messages.extend(entry.tool_responses.iter().map(|response: &ToolResponse| OpenAIMessage {
            role: "tool".to_string(),
            content: Some(response.content.clone()),
            tool_calls: None,
            tool_call_id: Some(response.tool_call_id.clone()),
        }));

        messages
    }
}

fn to_openai_tool(definition: &ToolDefinition) -> OpenAITool {
    OpenAITool {
        tool_type: "function".to_string(),
        function: OpenAIFunction {
            name: definition.name.clone(),
            description: definition.description.clone(),
            parameters: definition.input_schema.to_json(),
        },
    }
}

#[async_trait]
impl ModelBackend for OpenAIClient {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelTurn, BackendError> {
        let body = Self::build_request(request);

        log::info!(
            "[OPENAI] Sending request to {} with model {} and {} tools",
            self.endpoint,
            body.model,
            body.tools.as_ref().map(|t| t.len()).unwrap_or(0)
        );
        log::debug!(
            "[OPENAI] Full request:\n{}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout_secs)
                } else {
                    BackendError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_secs(response.headers());
            log::warn!("[OPENAI] Rate limited (retry-after: {:?})", retry_after);
            return Err(BackendError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OpenAIErrorResponse>(&error_text)
                .map(|r| r.error.message)
                .unwrap_or(error_text);
            log::error!("[OPENAI] API error {}: {}", status, message);
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let response_text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.timeout_secs)
            } else {
                BackendError::Network(e.to_string())
            }
        })?;

        log::debug!("[OPENAI] Raw response:\n{}", response_text);

        let response_data: OpenAICompletionResponse = serde_json::from_str(&response_text)
            .map_err(|e| BackendError::InvalidResponse(format!("{} - body: {}", e, response_text)))?;

        let choice = response_data
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::InvalidResponse("no choices returned".to_string()))?;

        log::info!(
            "[OPENAI] Response - content_len: {}, tool_calls: {}, finish_reason: {:?}",
            choice.message.content.as_ref().map(|c| c.len()).unwrap_or(0),
            choice.message.tool_calls.as_ref().map(|t| t.len()).unwrap_or(0),
            choice.finish_reason
        );

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                arguments: serde_json::from_str(&tc.function.arguments).unwrap_or(json!({})),
                id: tc.id,
                name: tc.function.name,
            })
            .collect();

        if !tool_calls.is_empty() {
            return Ok(ModelTurn::ToolCalls(tool_calls));
        }

        match choice.message.content {
            Some(content) if !content.trim().is_empty() => Ok(ModelTurn::Final(content)),
            _ => Err(BackendError::InvalidResponse(
                "response had neither content nor tool calls".to_string(),
            )),
        }
    }
}
