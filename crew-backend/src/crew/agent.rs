//! Agent registry
//!
//! Agents are plain records: a role, an objective, a persona, the model that
//! serves them and the tools they may call. The registry checks every model and
//! tool reference once, at construction, and is read-only afterwards.

use crate::ai::ModelProvider;
use crate::error::ConfigError;
use crate::tools::{ToolDefinition, ToolRegistry};
use serde::Serialize;
use std::collections::HashMap;

/// Immutable definition of one role-bound actor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSpec {
    pub id: String,
    pub role: String,
    pub goal: String,
    pub backstory: String,
    pub model: String,
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl AgentSpec {
    pub fn new(
        id: impl Into<String>,
        role: impl Into<String>,
        goal: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        AgentSpec {
            id: id.into(),
            role: role.into(),
            goal: goal.into(),
            backstory: String::new(),
            model: model.into(),
            tools: Vec::new(),
            temperature: None,
        }
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn can_use(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }

    /// System prompt for this agent.
    ///
    /// Lists the callable tools by name and first sentence of their description.
    /// With `json_answer` the model is asked for `{"reasoning", "answer"}`.
    pub fn system_prompt(&self, tools: &[ToolDefinition], json_answer: bool) -> String {
        let mut prompt = format!("You are a {}.", self.role);
        if !self.backstory.is_empty() {
            prompt.push(' ');
            prompt.push_str(&self.backstory);
        }
        prompt.push_str(&format!("\n\nYour goal: {}", self.goal));

        if !tools.is_empty() {
            prompt.push_str("\n\n## Available Tools\n\n");
            for tool in tools {
                let short_desc = tool
                    .description
                    .split(". ")
                    .next()
                    .unwrap_or(&tool.description);
                prompt.push_str(&format!("- **{}**: {}\n", tool.name, short_desc));
            }
            prompt.push_str(
                "\nUse a tool whenever it can provide what the task needs. \
                 If a tool reports an error, adapt: fix the arguments, try again, or \
                 explain what could not be retrieved.\n",
            );
        }

        if json_answer {
            prompt.push_str(
                "\nWhen you give your final answer, respond with a JSON object with two keys: \
                 \"reasoning\" (your step-by-step thinking) and \"answer\" (the final answer only).",
            );
        }

        prompt
    }
}

/// Lookup from agent id to its definition
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentSpec>,
    /// Ids in registration order
    order: Vec<String>,
}

impl AgentRegistry {
    /// Build the registry, rejecting duplicate ids and unknown models or tools
    pub fn new(
        agents: Vec<AgentSpec>,
        models: &ModelProvider,
        tools: &ToolRegistry,
    ) -> Result<Self, ConfigError> {
        let mut registry = AgentRegistry::default();

        for agent in agents {
            if registry.agents.contains_key(&agent.id) {
                return Err(ConfigError::DuplicateAgent(agent.id));
            }
            if !models.contains(&agent.model) {
                return Err(ConfigError::UnknownModel {
                    agent: agent.id,
                    model: agent.model,
                });
            }
            if let Some(tool) = agent.tools.iter().find(|t| !tools.contains(t)) {
                return Err(ConfigError::UnknownTool {
                    agent: agent.id.clone(),
                    tool: tool.clone(),
                });
            }

            log::debug!(
                "[CREW] Registered agent '{}' ({}) on model {} with tools {:?}",
                agent.id,
                agent.role,
                agent.model,
                agent.tools
            );
            registry.order.push(agent.id.clone());
            registry.agents.insert(agent.id.clone(), agent);
        }

        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agents in registration order
    pub fn iter(&self) -> impl Iterator<Item = &AgentSpec> {
        self.order.iter().filter_map(|id| self.agents.get(id))
    }
}
