//! Configuration for the Aido gateway.
//!
//! The config file is YAML (default `~/.aido/config.yaml`), with `${VAR}`
//! environment expansion applied on load. Components hold a [`ConfigHandle`]
//! and read atomic snapshots; a reload publishes a new snapshot that
//! subsequent readers observe in full, never partially.

mod handle;
mod loader;

pub use handle::ConfigHandle;
pub use loader::{
    default_config_path, expand_env_vars, generate_token, load, resolve_home, write, ConfigError,
};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The root configuration structure.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub agents: HashMap<String, AgentConfig>,
    pub providers: HashMap<String, ProviderConfig>,
    pub tools: ToolsConfig,
    pub bridges: BridgesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub auth: AuthConfig,
    /// If non-empty, pins every inbound message to this agent.
    #[serde(rename = "currentAgent")]
    pub current_agent: String,
    /// Global tools profile applied as the outermost policy layer.
    #[serde(rename = "toolsProfile")]
    pub tools_profile: String,
    pub locale: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 19800,
            auth: AuthConfig::default(),
            current_agent: String::new(),
            tools_profile: "coding".into(),
            locale: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Pre-shared token. Empty disables authentication.
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Provider name. When empty, `model` is parsed as "provider/model".
    pub provider: String,
    pub model: String,
    /// Fallback model references tried on rate-limit/auth failures.
    /// Entries may be bare model ids or "provider/model".
    pub fallbacks: Vec<String>,
    pub tools: AgentToolsConfig,
    pub compaction: CompactionConfig,
    pub workspace: String,
    pub skills: SkillsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: "anthropic/claude-sonnet-4-20250514".into(),
            fallbacks: Vec::new(),
            tools: AgentToolsConfig::default(),
            compaction: CompactionConfig::default(),
            workspace: String::new(),
            skills: SkillsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentToolsConfig {
    pub profile: String,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Model context window in tokens. 0 means use the loop default.
    #[serde(rename = "contextWindow")]
    pub context_window: u64,
    #[serde(rename = "keepRecentTokens")]
    pub keep_recent_tokens: u64,
    #[serde(rename = "reserveTokens")]
    pub reserve_tokens: u64,
    #[serde(rename = "chunkRatio")]
    pub chunk_ratio: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_window: 0,
            keep_recent_tokens: 20_000,
            reserve_tokens: 16_384,
            chunk_ratio: 0.4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    pub dirs: Vec<String>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    /// "openai" | "anthropic". Empty infers from the provider name.
    #[serde(rename = "type")]
    pub kind: String,
}

impl ProviderConfig {
    /// Which wire protocol to speak for this provider. A provider literally
    /// named "anthropic" defaults to the Anthropic protocol; everything
    /// else defaults to OpenAI-compatible.
    pub fn client_type(&self, provider_name: &str) -> &str {
        if !self.kind.is_empty() {
            return &self.kind;
        }
        if provider_name == "anthropic" {
            "anthropic"
        } else {
            "openai"
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field(
                "api_key",
                &if self.api_key.is_empty() {
                    "<unset>"
                } else {
                    "[REDACTED]"
                },
            )
            .field("base_url", &self.base_url)
            .field("kind", &self.kind)
            .finish()
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("gateway", &self.gateway)
            .field("agents", &self.agents)
            .field("providers", &self.providers)
            .field("tools", &self.tools)
            .field("bridges", &self.bridges)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub mcp: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub name: String,
    /// "stdio" | "http".
    pub transport: String,
    pub command: String,
    pub args: Vec<String>,
    pub url: String,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgesConfig {
    pub instances: Vec<BridgeInstanceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeInstanceConfig {
    pub id: String,
    pub enabled: bool,
    pub path: String,
    pub env: HashMap<String, String>,
}

impl Config {
    /// Resolve a "provider/model" reference against configured providers.
    pub fn resolve_provider(
        &self,
        model_ref: &str,
    ) -> Result<(String, String, ProviderConfig), ConfigError> {
        let (provider, model) = model_ref.split_once('/').ok_or_else(|| {
            ConfigError::Invalid(format!(
                "invalid model reference {model_ref:?}, expected 'provider/model'"
            ))
        })?;
        let prov_cfg = self
            .providers
            .get(provider)
            .ok_or_else(|| ConfigError::Invalid(format!("provider {provider:?} not configured")))?
            .clone();
        Ok((provider.to_string(), model.to_string(), prov_cfg))
    }

    /// Resolve `model_ref` with a default provider for bare model ids.
    pub fn resolve_provider_with_default(
        &self,
        model_ref: &str,
        default_provider: &str,
    ) -> Result<(String, String, ProviderConfig), ConfigError> {
        if model_ref.contains('/') {
            return self.resolve_provider(model_ref);
        }
        if default_provider.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "model ref {model_ref:?} has no provider and no default"
            )));
        }
        let prov_cfg = self.providers.get(default_provider).ok_or_else(|| {
            ConfigError::Invalid(format!("provider {default_provider:?} not configured"))
        })?;
        Ok((
            default_provider.to_string(),
            model_ref.to_string(),
            prov_cfg.clone(),
        ))
    }

    /// Resolve the provider and model for an agent. If the agent pins a
    /// provider, `model` is used as-is; otherwise it is parsed as
    /// "provider/model".
    pub fn resolve_provider_for_agent(
        &self,
        agent: &AgentConfig,
    ) -> Result<(String, String, ProviderConfig), ConfigError> {
        if !agent.provider.is_empty() {
            let prov_cfg = self.providers.get(&agent.provider).ok_or_else(|| {
                ConfigError::Invalid(format!("provider {:?} not configured", agent.provider))
            })?;
            return Ok((agent.provider.clone(), agent.model.clone(), prov_cfg.clone()));
        }
        self.resolve_provider(&agent.model)
    }
}
