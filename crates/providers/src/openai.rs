//! OpenAI-compatible provider adapter.
//!
//! Works against every Chat Completions clone: OpenAI, DeepSeek, Groq,
//! Mistral, OpenRouter, llama.cpp servers, etc. Streams SSE `data:` JSON
//! chunks terminated by the literal `data: [DONE]`.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use aido_core::error::{ApiError, ProviderError};
use aido_core::message::{Message, Role};
use aido_core::provider::{ChatParams, Provider, StreamEvent, Usage};

use crate::sse::SseParser;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Adapter for the OpenAI-style streaming chat protocol.
pub struct OpenAiProvider {
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Build the JSON request body. System prompt is prepended as a
    /// `role=system` message; images become array-valued content with
    /// `image_url` parts.
    fn build_request(params: &ChatParams) -> serde_json::Value {
        let mut messages = Vec::with_capacity(params.messages.len() + 1);

        if !params.system.is_empty() {
            messages.push(serde_json::json!({
                "role": "system",
                "content": params.system,
            }));
        }

        for msg in &params.messages {
            messages.push(Self::encode_message(msg));
        }

        let mut req = serde_json::json!({
            "model": params.model,
            "messages": messages,
            "stream": true,
        });

        if !params.tools.is_empty() {
            let tools: Vec<serde_json::Value> = params
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            req["tools"] = serde_json::Value::Array(tools);
        }

        req
    }

    fn encode_message(msg: &Message) -> serde_json::Value {
        match msg.role {
            Role::Tool => serde_json::json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": msg.content,
            }),
            _ if !msg.tool_calls.is_empty() => {
                let calls: Vec<serde_json::Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.name, "arguments": tc.arguments },
                        })
                    })
                    .collect();
                let mut m = serde_json::json!({
                    "role": msg.role.to_string(),
                    "tool_calls": calls,
                });
                if !msg.content.is_empty() {
                    m["content"] = serde_json::Value::String(msg.content.clone());
                }
                m
            }
            _ if !msg.images.is_empty() => {
                let mut parts = vec![serde_json::json!({ "type": "text", "text": msg.content })];
                for img in &msg.images {
                    if !img.base64.is_empty() {
                        let mime = if img.mime.is_empty() {
                            "image/png"
                        } else {
                            &img.mime
                        };
                        parts.push(serde_json::json!({
                            "type": "image_url",
                            "image_url": { "url": format!("data:{mime};base64,{}", img.base64) },
                        }));
                    } else if !img.url.is_empty() {
                        parts.push(serde_json::json!({
                            "type": "image_url",
                            "image_url": { "url": img.url },
                        }));
                    }
                }
                serde_json::json!({ "role": msg.role.to_string(), "content": parts })
            }
            _ => serde_json::json!({
                "role": msg.role.to_string(),
                "content": msg.content,
            }),
        }
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn chat(
        &self,
        params: ChatParams,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let base = if params.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            params.base_url.as_str()
        };
        let url = format!("{}/v1/chat/completions", base.trim_end_matches('/'));
        let body = Self::build_request(&params);

        debug!(model = %params.model, url = %url, "openai chat request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&params.api_key)
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
                    if event.data == "[DONE]" {
                        return;
                    }
                    if !forward_chunk(&event.data, &tx).await {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Translate one JSON chunk into stream events. Returns false when the
/// stream is finished or the receiver went away.
async fn forward_chunk(data: &str, tx: &mpsc::Sender<StreamEvent>) -> bool {
    let chunk: ChatChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            trace!(error = %e, data = %data, "skipping unparseable chunk");
            return true;
        }
    };

    let Some(choice) = chunk.choices.into_iter().next() else {
        // Usage-only chunk, sent by some providers after the last choice.
        if let Some(u) = chunk.usage {
            return tx
                .send(StreamEvent::Usage(Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                }))
                .await
                .is_ok();
        }
        return true;
    };

    if !choice.delta.content.is_empty() {
        if tx
            .send(StreamEvent::TextDelta {
                text: choice.delta.content,
            })
            .await
            .is_err()
        {
            return false;
        }
    }

    for tc in choice.delta.tool_calls {
        let event = StreamEvent::ToolCallDelta {
            index: tc.index,
            id: (!tc.id.is_empty()).then_some(tc.id),
            name: (!tc.function.name.is_empty()).then_some(tc.function.name),
            args: tc.function.arguments,
        };
        if tx.send(event).await.is_err() {
            return false;
        }
    }

    if !choice.finish_reason.is_empty() {
        if let Some(u) = chunk.usage {
            let _ = tx
                .send(StreamEvent::Usage(Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                }))
                .await;
        }
        let _ = tx
            .send(StreamEvent::Done {
                stop_reason: choice.finish_reason,
            })
            .await;
        return false;
    }

    true
}

// --- Streaming response types ---

#[derive(Debug, Default, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: ChatDelta,
    #[serde(default)]
    finish_reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: String,
    #[serde(default)]
    function: FunctionDelta,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use aido_core::message::ToolCall;
    use aido_core::provider::ToolDef;

    fn params_with(messages: Vec<Message>) -> ChatParams {
        ChatParams {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            api_key: "sk-test".into(),
            base_url: String::new(),
            messages,
            tools: vec![],
            system: String::new(),
        }
    }

    #[test]
    fn system_prompt_prepended_as_message() {
        let mut params = params_with(vec![Message::user("hi")]);
        params.system = "You are helpful".into();
        let body = OpenAiProvider::build_request(&params);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "You are helpful");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn tool_result_message_shape() {
        let params = params_with(vec![Message::tool_result("tc_1", "42")]);
        let body = OpenAiProvider::build_request(&params);
        let msg = &body["messages"][0];
        assert_eq!(msg["role"], "tool");
        assert_eq!(msg["tool_call_id"], "tc_1");
        assert_eq!(msg["content"], "42");
    }

    #[test]
    fn assistant_tool_calls_encoded_as_functions() {
        let mut msg = Message::assistant("checking");
        msg.tool_calls.push(ToolCall {
            id: "tc_1".into(),
            name: "exec".into(),
            arguments: r#"{"command":"date"}"#.into(),
        });
        let body = OpenAiProvider::build_request(&params_with(vec![msg]));
        let encoded = &body["messages"][0];
        assert_eq!(encoded["tool_calls"][0]["type"], "function");
        assert_eq!(encoded["tool_calls"][0]["function"]["name"], "exec");
        assert_eq!(
            encoded["tool_calls"][0]["function"]["arguments"],
            r#"{"command":"date"}"#
        );
        assert_eq!(encoded["content"], "checking");
    }

    #[test]
    fn image_attachments_render_as_content_parts() {
        let msg = Message::user_with_images(
            "what is this?",
            vec![
                aido_core::message::ImageData {
                    url: "https://example.com/cat.png".into(),
                    ..Default::default()
                },
                aido_core::message::ImageData {
                    base64: "QUJD".into(),
                    mime: "image/jpeg".into(),
                    ..Default::default()
                },
            ],
        );
        let body = OpenAiProvider::build_request(&params_with(vec![msg]));
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["image_url"]["url"], "https://example.com/cat.png");
        assert_eq!(
            parts[2]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
    }

    #[test]
    fn tools_serialized_as_function_defs() {
        let mut params = params_with(vec![Message::user("hi")]);
        params.tools.push(ToolDef {
            name: "exec".into(),
            description: "run a command".into(),
            parameters: serde_json::json!({"type": "object"}),
        });
        let body = OpenAiProvider::build_request(&params);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "exec");
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn chunk_text_delta() {
        let (tx, mut rx) = mpsc::channel(8);
        let more = forward_chunk(
            r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":""}]}"#,
            &tx,
        )
        .await;
        assert!(more);
        match rx.recv().await.unwrap() {
            StreamEvent::TextDelta { text } => assert_eq!(text, "Hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_tool_call_delta() {
        let (tx, mut rx) = mpsc::channel(8);
        forward_chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tc_1","function":{"name":"exec","arguments":"{\"c"}}]},"finish_reason":""}]}"#,
            &tx,
        )
        .await;
        match rx.recv().await.unwrap() {
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                args,
            } => {
                assert_eq!(index, 0);
                assert_eq!(id.as_deref(), Some("tc_1"));
                assert_eq!(name.as_deref(), Some("exec"));
                assert_eq!(args, "{\"c");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_finish_emits_done() {
        let (tx, mut rx) = mpsc::channel(8);
        let more = forward_chunk(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":3}}"#,
            &tx,
        )
        .await;
        assert!(!more);
        match rx.recv().await.unwrap() {
            StreamEvent::Usage(u) => {
                assert_eq!(u.input_tokens, 5);
                assert_eq!(u.output_tokens, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            StreamEvent::Done { stop_reason } => assert_eq!(stop_reason, "stop"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn usage_only_chunk() {
        let (tx, mut rx) = mpsc::channel(8);
        let more = forward_chunk(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":20}}"#,
            &tx,
        )
        .await;
        assert!(more);
        match rx.recv().await.unwrap() {
            StreamEvent::Usage(u) => assert_eq!(u.output_tokens, 20),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_chunk_skipped() {
        let (tx, mut rx) = mpsc::channel(8);
        let more = forward_chunk("not json", &tx).await;
        assert!(more);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
