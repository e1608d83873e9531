//! Provider trait — the abstraction over streaming LLM backends.
//!
//! The two concrete adapters (OpenAI-style and Anthropic-style, in
//! `aido-providers`) speak very different wire protocols; they are unified
//! here at the event level, not the chunk level. A provider returns a
//! channel of [`StreamEvent`] values that the caller drains to completion.
//! Dropping the receiver cancels the underlying HTTP stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::{Message, Role, ToolCall};

/// A tool definition sent to the LLM so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Token usage for one request. Providers may report it in several
/// events; consumers sum the pieces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Parameters for one chat request.
#[derive(Debug, Clone, Default)]
pub struct ChatParams {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
    /// System prompt. Kept out of `messages` because Anthropic wants it as
    /// a top-level field.
    pub system: String,
}

/// A single event in a streaming LLM response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chunk of assistant text.
    TextDelta { text: String },

    /// A fragment of a tool call. The first delta for an index carries the
    /// id and name; later deltas append to the JSON argument buffer.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        args: String,
    },

    /// Token counts. May arrive more than once; sum them.
    Usage(Usage),

    /// The stream finished; carries the provider's stop reason.
    Done { stop_reason: String },

    /// Fatal error; terminates the stream.
    Error(ProviderError),
}

/// The accumulated result after consuming a full stream.
#[derive(Debug, Clone)]
pub struct StreamResult {
    /// The complete assistant message (text + tool calls).
    pub message: Message,
    pub tool_calls: Vec<ToolCall>,
    pub text: String,
    pub usage: Option<Usage>,
    pub stop_reason: String,
}

/// The unified interface over LLM backends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send a chat request and get back a stream of events. The caller
    /// must drain the channel; dropping it aborts the request.
    async fn chat(
        &self,
        params: ChatParams,
    ) -> std::result::Result<mpsc::Receiver<StreamEvent>, ProviderError>;
}

/// Drain a stream and accumulate text, tool calls, and usage.
///
/// Tool call argument fragments are keyed by the provider-assigned index;
/// the first delta for an index establishes the call's id and name, later
/// deltas may still fill them in.
pub async fn consume_stream(
    mut rx: mpsc::Receiver<StreamEvent>,
) -> std::result::Result<StreamResult, ProviderError> {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut arg_buffers: Vec<String> = Vec::new();
    let mut usage: Option<Usage> = None;
    let mut stop_reason = String::new();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextDelta { text: t } => text.push_str(&t),

            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                args,
            } => {
                while tool_calls.len() <= index {
                    tool_calls.push(ToolCall::default());
                    arg_buffers.push(String::new());
                }
                let call = &mut tool_calls[index];
                if let Some(id) = id {
                    if !id.is_empty() {
                        call.id = id;
                    }
                }
                if let Some(name) = name {
                    if !name.is_empty() {
                        call.name = name;
                    }
                }
                arg_buffers[index].push_str(&args);
            }

            StreamEvent::Usage(u) => {
                let total = usage.get_or_insert(Usage::default());
                total.input_tokens += u.input_tokens;
                total.output_tokens += u.output_tokens;
            }

            StreamEvent::Done { stop_reason: r } => stop_reason = r,

            StreamEvent::Error(e) => return Err(e),
        }
    }

    for (call, args) in tool_calls.iter_mut().zip(arg_buffers) {
        call.arguments = args;
    }

    let message = Message {
        role: Role::Assistant,
        content: text.clone(),
        tool_calls: tool_calls.clone(),
        tool_call_id: None,
        images: Vec::new(),
    };

    Ok(StreamResult {
        message,
        tool_calls,
        text,
        usage,
        stop_reason,
    })
}
