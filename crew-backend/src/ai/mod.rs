pub mod openai;
pub mod types;

pub use openai::OpenAIClient;
pub use types::{ModelRequest, ModelTurn, ToolCall, ToolHistoryEntry, ToolResponse};

use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        f.write_str(role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// A chat-completion provider that can answer or request tool calls
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelTurn, BackendError>;
}

/// Backends keyed by the model name agents refer to
#[derive(Default, Clone)]
pub struct ModelProvider {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl ModelProvider {
    pub fn new() -> Self {
        ModelProvider {
            backends: HashMap::new(),
        }
    }

    pub fn register(&mut self, model: impl Into<String>, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(model.into(), backend);
    }

    pub fn with_backend(mut self, model: impl Into<String>, backend: Arc<dyn ModelBackend>) -> Self {
        self.register(model, backend);
        self
    }

    pub fn get(&self, model: &str) -> Option<Arc<dyn ModelBackend>> {
        self.backends.get(model).cloned()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.backends.contains_key(model)
    }

    /// Registered model names, sorted
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.backends.keys().cloned().collect();
        models.sort();
        models
    }

    pub async fn generate(&self, request: &ModelRequest) -> Result<ModelTurn, BackendError> {
        let backend = self
            .get(&request.model)
            .ok_or_else(|| BackendError::UnknownModel(request.model.clone()))?;
        backend.generate(request).await
    }
}
