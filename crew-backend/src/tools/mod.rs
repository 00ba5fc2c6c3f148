pub mod builtin;
pub mod http_retry;
pub mod registry;
pub mod types;

pub use registry::{Tool, ToolRegistry};
pub use types::{
    PropertySchema, ToolContext, ToolDefinition, ToolInputSchema, ToolInvocation, ToolResult,
};

use std::sync::Arc;

/// Registry holding every built-in tool with its default settings
pub fn create_default_registry() -> ToolRegistry {
    create_registry_with(builtin::WebFetchConfig::default())
}

/// Registry holding every built-in tool, with the fetch tool configured explicitly
pub fn create_registry_with(fetch_config: builtin::WebFetchConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(builtin::WebFetchTool::with_config(fetch_config)));
    log::info!("[TOOLS] Registered tools: {:?}", registry.names());
    registry
}
