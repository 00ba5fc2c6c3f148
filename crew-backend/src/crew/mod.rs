//! Agent registry, task graph and the orchestrator that runs them

pub mod agent;
pub mod orchestrator;
pub mod presets;
pub mod retry;
pub mod run;
pub mod task;

pub use agent::{AgentRegistry, AgentSpec};
pub use orchestrator::{Crew, CrewSettings, ProcessMode};
pub use presets::build_default_crew;
pub use retry::RetryPolicy;
pub use run::{extract_first_url, RunInput, RunReport, RunStatus, TaskRecord, TaskStatus};
pub use task::{TaskGraph, TaskSpec};
