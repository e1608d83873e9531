//! Tool trait and registry.
//!
//! Tools are what give the agent the ability to act: run commands,
//! read/write files, fetch URLs. Built-in tools and dynamically discovered
//! MCP tools coexist in one registry; MCP tools are keyed
//! `"<server>:<tool>"` so an entire server can be torn down by prefix.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::ToolError;
use crate::policy::Policy;
use crate::provider::ToolDef;

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "exec", "read_file").
    fn name(&self) -> &str;

    /// What this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool. The returned string is fed back to the LLM.
    async fn execute(&self, arguments: serde_json::Value)
        -> std::result::Result<String, ToolError>;

    fn to_definition(&self) -> ToolDef {
        ToolDef {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Thread-safe name → tool map.
///
/// Tool names are globally unique; registering a duplicate name replaces
/// the previous entry.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().unwrap().insert(name, tool);
    }

    pub fn unregister(&self, name: &str) {
        self.tools.write().unwrap().remove(name);
    }

    /// Remove every tool whose name starts with `"<prefix>:"`. Used to tear
    /// down one MCP server's tools on config reload.
    pub fn unregister_by_prefix(&self, prefix: &str) {
        let full = format!("{prefix}:");
        self.tools
            .write()
            .unwrap()
            .retain(|name, _| !name.starts_with(&full));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().unwrap().get(name).cloned()
    }

    /// Run a tool by name. Argument strings that are not valid JSON are
    /// passed through as an empty object so a malformed LLM fragment
    /// surfaces as a tool-level error rather than a crash.
    pub async fn execute(
        &self,
        name: &str,
        params_json: &str,
    ) -> std::result::Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let args: serde_json::Value = if params_json.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(params_json)
                .map_err(|e| ToolError::InvalidArguments(e.to_string()))?
        };
        tool.execute(args).await
    }

    /// Tool definitions for every registered tool the policy accepts.
    pub fn list_tool_defs(&self, policy: &Policy) -> Vec<ToolDef> {
        let tools = self.tools.read().unwrap();
        let mut defs: Vec<ToolDef> = tools
            .values()
            .filter(|t| policy.is_allowed(t.name()))
            .map(|t| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}
