//! Model Context Protocol sub-client.
//!
//! Aido acts as a JSON-RPC 2.0 client against external tool servers.
//! Discovered tools are registered into the shared [`ToolRegistry`] as
//! `"<server>:<tool>"`, so one server's tools can be torn down in bulk
//! when the configuration changes.

mod client;
mod http;
mod rpc;
mod stdio;

pub use client::{McpClient, McpTool};
pub use http::HttpSseTransport;
pub use rpc::{JsonRpcRequest, JsonRpcResponse, RpcErrorBody, Transport};
pub use stdio::StdioTransport;

/// MCP protocol revision this client speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
