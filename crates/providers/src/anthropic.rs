//! Anthropic Messages API adapter.
//!
//! Differences from the OpenAI protocol, all normalized away here:
//! - `x-api-key` header instead of Bearer auth, plus `anthropic-version`
//! - system prompt as a top-level field, `max_tokens` required
//! - tool results travel as user messages with `tool_result` blocks
//! - typed SSE events (`content_block_start`, `content_block_delta`,
//!   `message_start`, `message_delta`) instead of uniform JSON chunks

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use aido_core::error::{ApiError, ProviderError};
use aido_core::message::{Message, Role};
use aido_core::provider::{ChatParams, Provider, StreamEvent, Usage};

use crate::sse::{SseEvent, SseParser};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 8192;

/// Adapter for Anthropic's native streaming protocol.
pub struct AnthropicProvider {
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn build_request(params: &ChatParams) -> serde_json::Value {
        let mut messages = Vec::with_capacity(params.messages.len());

        for msg in &params.messages {
            match msg.role {
                // System prompt is a top-level param; skip in messages.
                Role::System => continue,
                Role::User => messages.push(Self::encode_user(msg)),
                Role::Assistant => messages.push(Self::encode_assistant(msg)),
                Role::Tool => messages.push(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content,
                    }],
                })),
            }
        }

        let mut req = serde_json::json!({
            "model": params.model,
            "messages": messages,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "stream": true,
        });

        if !params.system.is_empty() {
            req["system"] = serde_json::Value::String(params.system.clone());
        }

        if !params.tools.is_empty() {
            let tools: Vec<serde_json::Value> = params
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            req["tools"] = serde_json::Value::Array(tools);
        }

        req
    }

    fn encode_user(msg: &Message) -> serde_json::Value {
        if msg.images.is_empty() {
            return serde_json::json!({ "role": "user", "content": msg.content });
        }
        let mut content = vec![serde_json::json!({ "type": "text", "text": msg.content })];
        for img in &msg.images {
            if !img.base64.is_empty() {
                let mime = if img.mime.is_empty() {
                    "image/png"
                } else {
                    &img.mime
                };
                content.push(serde_json::json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": mime,
                        "data": img.base64,
                    },
                }));
            }
        }
        serde_json::json!({ "role": "user", "content": content })
    }

    fn encode_assistant(msg: &Message) -> serde_json::Value {
        if msg.tool_calls.is_empty() {
            return serde_json::json!({ "role": "assistant", "content": msg.content });
        }
        let mut content = Vec::new();
        if !msg.content.is_empty() {
            content.push(serde_json::json!({ "type": "text", "text": msg.content }));
        }
        for tc in &msg.tool_calls {
            let input: serde_json::Value =
                serde_json::from_str(&tc.arguments).unwrap_or_default();
            content.push(serde_json::json!({
                "type": "tool_use",
                "id": tc.id,
                "name": tc.name,
                "input": input,
            }));
        }
        serde_json::json!({ "role": "assistant", "content": content })
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn chat(
        &self,
        params: ChatParams,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let base = if params.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            params.base_url.as_str()
        };
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        let body = Self::build_request(&params);

        debug!(model = %params.model, url = %url, "anthropic chat request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &params.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let err_body = response.text().await.unwrap_or_default();
            return Err(ApiError::new(status, err_body).into());
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut parser = SseParser::new();
            let mut state = StreamState::default();

            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::Error(ProviderError::StreamInterrupted(
                                e.to_string(),
                            )))
                            .await;
                        return;
                    }
                };

                for event in parser.push(&String::from_utf8_lossy(&bytes)) {
                    if !state.forward(&event, &tx).await {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Per-stream bookkeeping: maps Anthropic content-block indices onto the
/// dense tool-call indices the common event vocabulary uses.
#[derive(Default)]
struct StreamState {
    next_tool_index: usize,
    block_to_tool: std::collections::HashMap<u64, usize>,
}

impl StreamState {
    /// Returns false when the stream is finished or the receiver is gone.
    async fn forward(&mut self, event: &SseEvent, tx: &mpsc::Sender<StreamEvent>) -> bool {
        match event.event.as_str() {
            "content_block_start" => {
                let Ok(start) = serde_json::from_str::<ContentBlockStart>(&event.data) else {
                    return true;
                };
                if start.content_block.kind == "tool_use" {
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.block_to_tool.insert(start.index, index);
                    return tx
                        .send(StreamEvent::ToolCallDelta {
                            index,
                            id: Some(start.content_block.id),
                            name: Some(start.content_block.name),
                            args: String::new(),
                        })
                        .await
                        .is_ok();
                }
                true
            }

            "content_block_delta" => {
                let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(&event.data) else {
                    return true;
                };
                match delta.delta.kind.as_str() {
                    "text_delta" => tx
                        .send(StreamEvent::TextDelta {
                            text: delta.delta.text,
                        })
                        .await
                        .is_ok(),
                    "input_json_delta" => {
                        let index = self.block_to_tool.get(&delta.index).copied().unwrap_or(0);
                        tx.send(StreamEvent::ToolCallDelta {
                            index,
                            id: None,
                            name: None,
                            args: delta.delta.partial_json,
                        })
                        .await
                        .is_ok()
                    }
                    _ => true,
                }
            }

            "message_start" => {
                let Ok(start) = serde_json::from_str::<MessageStart>(&event.data) else {
                    return true;
                };
                if start.message.usage.input_tokens > 0 {
                    return tx
                        .send(StreamEvent::Usage(Usage {
                            input_tokens: start.message.usage.input_tokens,
                            output_tokens: 0,
                        }))
                        .await
                        .is_ok();
                }
                true
            }

            "message_delta" => {
                let Ok(delta) = serde_json::from_str::<MessageDelta>(&event.data) else {
                    return true;
                };
                if delta.usage.output_tokens > 0 {
                    let _ = tx
                        .send(StreamEvent::Usage(Usage {
                            input_tokens: 0,
                            output_tokens: delta.usage.output_tokens,
                        }))
                        .await;
                }
                let _ = tx
                    .send(StreamEvent::Done {
                        stop_reason: delta.delta.stop_reason,
                    })
                    .await;
                false
            }

            "error" => {
                let _ = tx
                    .send(StreamEvent::Error(ProviderError::StreamInterrupted(
                        format!("anthropic stream error: {}", event.data),
                    )))
                    .await;
                false
            }

            other => {
                trace!(event = %other, "ignoring anthropic event");
                true
            }
        }
    }
}

// --- Streaming response types ---

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    #[serde(default)]
    index: u64,
    content_block: ContentBlockInfo,
}

#[derive(Debug, Default, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    #[serde(default)]
    index: u64,
    delta: BlockDelta,
}

#[derive(Debug, Default, Deserialize)]
struct BlockDelta {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    partial_json: String,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartBody,
}

#[derive(Debug, Default, Deserialize)]
struct MessageStartBody {
    #[serde(default)]
    usage: UsageBody,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    delta: StopDelta,
    #[serde(default)]
    usage: UsageBody,
}

#[derive(Debug, Default, Deserialize)]
struct StopDelta {
    #[serde(default)]
    stop_reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct UsageBody {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}
