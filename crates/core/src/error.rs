//! Error types for the Aido domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; `Error` is the top-level
//! union used at crate boundaries.

use thiserror::Error;

/// The top-level error type for all Aido operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// An HTTP-level error returned by an LLM provider.
///
/// The predicates drive the agent loop's recovery strategy: rate-limit and
/// auth errors trigger model fallback, context overflow triggers compaction.
#[derive(Debug, Clone, Error)]
#[error("LLM API error (status {status}): {body}")]
pub struct ApiError {
    pub status: u16,
    pub body: String,
}

/// Substrings that mark a 400 response as a context-length failure.
const OVERFLOW_MARKERS: &[&str] = &["context", "token", "length", "maximum"];

impl ApiError {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.status == 429
    }

    pub fn is_auth(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    /// Best-effort classification: a 400 whose body mentions a known
    /// context-length marker. Callers must treat this as a hint.
    pub fn is_context_overflow(&self) -> bool {
        if self.status != 400 {
            return false;
        }
        let body = self.body.to_lowercase();
        OVERFLOW_MARKERS.iter().any(|m| body.contains(m))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// The underlying API error, if this is an HTTP-level failure.
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),

    #[error("tool {tool_name} failed: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("tool {tool_name} timed out after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transcript I/O: {0}")]
    Transcript(String),

    #[error("session store I/O: {0}")]
    Store(String),

    #[error("compaction failed: {0}")]
    Compaction(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("max tool call iterations reached")]
    MaxIterations,

    #[error("agent run aborted")]
    Aborted,

    #[error("agent {0:?} not found")]
    UnknownAgent(String),

    #[error("all models failed, last error: {0}")]
    AllModelsFailed(String),

    #[error("compaction failed: {compact_error} (original: {original})")]
    CompactionAfterOverflow {
        compact_error: String,
        original: String,
    },
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("server {server}: {reason}")]
    Server { server: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_predicates() {
        assert!(ApiError::new(429, "slow down").is_rate_limit());
        assert!(ApiError::new(401, "bad key").is_auth());
        assert!(ApiError::new(403, "forbidden").is_auth());
        assert!(!ApiError::new(500, "boom").is_auth());
    }

    #[test]
    fn overflow_requires_marker_in_body() {
        assert!(ApiError::new(400, "maximum context length exceeded").is_context_overflow());
        assert!(ApiError::new(400, "prompt too many tokens").is_context_overflow());
        // A plain validation failure must not be treated as overflow.
        assert!(!ApiError::new(400, "invalid field: temperature").is_context_overflow());
        assert!(!ApiError::new(413, "context length").is_context_overflow());
    }

    #[test]
    fn provider_error_displays_status() {
        let err = ProviderError::from(ApiError::new(429, "Too many requests"));
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::ExecutionFailed {
            tool_name: "exec".into(),
            reason: "command not found".into(),
        };
        assert!(err.to_string().contains("exec"));
        assert!(err.to_string().contains("command not found"));
    }
}
