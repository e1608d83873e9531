//! Built-in tool implementations for Aido.
//!
//! Filesystem access is resolved against the agent's workspace, command
//! execution goes through the system shell with a timeout, and web fetches
//! are size-capped. Outputs are truncated so a runaway tool cannot blow up
//! the context window.

pub mod exec;
pub mod fs;
pub mod web;

use std::sync::Arc;

use aido_core::tool::ToolRegistry;

/// Create a registry with all built-in tools rooted at `workdir`.
pub fn default_registry(workdir: &str) -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(fs::ReadFileTool::new(workdir)));
    registry.register(Arc::new(fs::WriteFileTool::new(workdir)));
    registry.register(Arc::new(fs::EditFileTool::new(workdir)));
    registry.register(Arc::new(fs::ListDirTool::new(workdir)));
    registry.register(Arc::new(exec::ExecTool::new(workdir)));
    registry.register(Arc::new(web::WebFetchTool::new()));
    registry
}
