use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// JSON Schema property definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl PropertySchema {
    pub fn new(schema_type: impl Into<String>, description: impl Into<String>) -> Self {
        PropertySchema {
            schema_type: schema_type.into(),
            description: description.into(),
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Render as a JSON Schema fragment for the model API
    pub fn to_json(&self) -> Value {
        let mut schema = serde_json::json!({
            "type": self.schema_type,
            "description": self.description,
        });
        if let Some(default) = &self.default {
            schema["default"] = default.clone();
        }
        schema
    }
}

/// Tool input schema using JSON Schema format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: HashMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for ToolInputSchema {
    fn default() -> Self {
        ToolInputSchema {
            schema_type: "object".to_string(),
            properties: HashMap::new(),
            required: vec![],
        }
    }
}

impl ToolInputSchema {
    pub fn to_json(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, prop)| (name.clone(), prop.to_json()))
            .collect();
        serde_json::json!({
            "type": self.schema_type,
            "properties": properties,
            "required": self.required,
        })
    }
}

/// Tool definition that gets sent to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
}

/// Successful tool output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        ToolResult {
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Who is invoking a tool, for logging and tracing
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub run_id: String,
    pub task_id: String,
    pub agent_id: String,
}

impl ToolContext {
    pub fn new(
        run_id: impl Into<String>,
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        ToolContext {
            run_id: run_id.into(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

/// Record of one tool invocation made while producing a task's output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: Value,
    pub success: bool,
    /// Tool output on success, the error text otherwise
    pub output: String,
    pub duration_ms: u64,
}
