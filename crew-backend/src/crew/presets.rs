//! The default web research crew: a researcher that reads the target page and
//! an analyst that answers the user's question from what was read.

use super::agent::{AgentRegistry, AgentSpec};
use super::orchestrator::{Crew, CrewSettings};
use super::task::{TaskGraph, TaskSpec};
use crate::ai::{ModelProvider, OpenAIClient};
use crate::config::Config;
use crate::error::CrewError;
use crate::telemetry::TraceBroadcaster;
use crate::tools::builtin::WEB_FETCH_TOOL;
use crate::tools::{create_default_registry, ToolRegistry};
use std::sync::Arc;

pub const RESEARCHER: &str = "researcher";
pub const ANALYST: &str = "analyst";
pub const RESEARCH_TASK: &str = "research";
pub const ANSWER_TASK: &str = "answer";

const TEMPERATURE: f32 = 0.2;

pub fn default_agents(model: &str) -> Vec<AgentSpec> {
    vec![
        AgentSpec::new(
            RESEARCHER,
            "web researcher",
            "Retrieve the target page and report the content that bears on the user's question.",
            model,
        )
        .with_backstory(
            "You read public web pages and report what they actually say. \
             Never invent content the page does not contain.",
        )
        .with_tool(WEB_FETCH_TOOL)
        .with_temperature(TEMPERATURE),
        AgentSpec::new(
            ANALYST,
            "precise web analyst",
            "Answer the user's question from the scraped content.",
            model,
        )
        .with_backstory(
            "Use only the provided content. If information is missing, say so clearly. \
             Keep answers concise.",
        )
        .with_temperature(TEMPERATURE),
    ]
}

pub fn default_tasks() -> TaskGraph {
    let mut graph = TaskGraph::new()
        .with_task(
            TaskSpec::new(
                RESEARCH_TASK,
                "Fetch {url} with the web_fetch tool and collect the content relevant to this request: {goal}\n\n\
                 If the page cannot be fetched, report exactly what went wrong.",
                RESEARCHER,
            )
            .expecting("The page content relevant to the request, quoted or closely paraphrased, with nothing added."),
        )
        .with_task(
            TaskSpec::new(
                ANSWER_TASK,
                "Below is content scraped from a public website.\n\nContent:\n{research}\n\n\
                 User question:\n{goal}\n\n\
                 Provide a clear, factual, carefully structured answer.",
                ANALYST,
            )
            .depends_on(RESEARCH_TASK),
        );
    graph.designate_terminal(ANSWER_TASK);
    graph
}

/// Assemble the default crew over explicit backends and tools
pub fn assemble(
    models: ModelProvider,
    tools: ToolRegistry,
    model: &str,
    settings: CrewSettings,
    trace: TraceBroadcaster,
) -> Result<Crew, CrewError> {
    let agents = AgentRegistry::new(default_agents(model), &models, &tools)?;
    let crew = Crew::new(
        agents,
        default_tasks(),
        Arc::new(models),
        Arc::new(tools),
        settings,
        trace,
    )?;
    Ok(crew)
}

/// The default crew backed by the configured OpenAI-compatible endpoint
pub fn build_default_crew(config: &Config, trace: TraceBroadcaster) -> Result<Crew, CrewError> {
    let client = OpenAIClient::new(
        &config.openai.api_key,
        &config.openai.endpoint,
        config.openai.timeout_secs,
    )?;
    let models = ModelProvider::new().with_backend(config.openai.model.clone(), Arc::new(client));

    assemble(
        models,
        create_default_registry(),
        &config.openai.model,
        config.crew.clone(),
        trace,
    )
}
