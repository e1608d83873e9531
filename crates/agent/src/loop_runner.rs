//! The core agent execution engine.
//!
//! One call to [`Loop::run`] is one turn: load history, append the user
//! message, then iterate LLM call → tool execution until the model answers
//! without tool calls or the iteration cap is hit. Rate-limit and auth
//! failures fall back through the configured model chain; context overflow
//! triggers an in-band compaction retry.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aido_config::{AgentConfig, Config, ConfigHandle};
use aido_core::error::{AgentError, Error, ProviderError};
use aido_core::message::{ImageData, Message, ToolCall};
use aido_core::policy::{Policy, PolicyLayer};
use aido_core::provider::{ChatParams, Provider, StreamEvent, StreamResult, Usage};
use aido_core::tool::ToolRegistry;
use aido_session::SessionManager;

use crate::events::{EventEmitter, EventKind, EventSink, ToolStep};

pub const DEFAULT_MAX_ITERATIONS: u64 = 50;
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// A transport-level attachment. Images are inlined into the LLM request;
/// everything else is noted textually.
#[derive(Debug, Clone, Default)]
pub struct Attachment {
    /// "image" | "audio" | "video" | "file".
    pub kind: String,
    pub url: String,
    pub base64: String,
    pub mime: String,
}

/// Parameters for a single agent run.
pub struct RunParams {
    pub session: SessionManager,
    pub agent_config: AgentConfig,
    pub system_prompt: String,
    pub user_message: String,
    pub attachments: Vec<Attachment>,
    pub event_sink: Option<EventSink>,
    pub cancel: CancellationToken,
}

/// What a completed run produced.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub text: String,
    pub tool_steps: Vec<ToolStep>,
}

/// The agent loop. Holds the provider adapters and tool registry; per-run
/// state lives on the stack of [`Loop::run`].
pub struct Loop {
    config: ConfigHandle,
    tools: Arc<ToolRegistry>,
    openai: Arc<dyn Provider>,
    anthropic: Arc<dyn Provider>,
    pub max_iterations: u64,
    pub context_window: u64,
}

impl Loop {
    pub fn new(config: ConfigHandle, tools: Arc<ToolRegistry>) -> Self {
        Self::with_providers(
            config,
            tools,
            Arc::new(aido_providers::OpenAiProvider::new()),
            Arc::new(aido_providers::AnthropicProvider::new()),
        )
    }

    /// Construct with explicit provider adapters (used by tests).
    pub fn with_providers(
        config: ConfigHandle,
        tools: Arc<ToolRegistry>,
        openai: Arc<dyn Provider>,
        anthropic: Arc<dyn Provider>,
    ) -> Self {
        Self {
            config,
            tools,
            openai,
            anthropic,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// The policy stack for an agent: the gateway's global profile layer
    /// plus the agent's own profile/allow/deny layer.
    pub fn policy_for(cfg: &Config, agent: &AgentConfig) -> Policy {
        let mut layers = vec![PolicyLayer {
            profile: cfg.gateway.tools_profile.clone(),
            allow: Vec::new(),
            deny: Vec::new(),
        }];
        let t = &agent.tools;
        if !t.profile.is_empty() || !t.allow.is_empty() || !t.deny.is_empty() {
            layers.push(PolicyLayer {
                profile: t.profile.clone(),
                allow: t.allow.clone(),
                deny: t.deny.clone(),
            });
        }
        Policy::new(layers)
    }

    /// Pick the adapter for a provider based on its configured type.
    fn resolve_client(&self, provider_name: &str) -> Arc<dyn Provider> {
        let cfg = self.config.get();
        let client_type = cfg
            .providers
            .get(provider_name)
            .map(|p| p.client_type(provider_name).to_string())
            .unwrap_or_else(|| "openai".into());
        if client_type == "anthropic" {
            self.anthropic.clone()
        } else {
            self.openai.clone()
        }
    }

    /// Execute one complete agent turn.
    pub async fn run(&self, params: RunParams) -> Result<RunResult, Error> {
        let cfg = self.config.get();
        let max_iter = if self.max_iterations > 0 {
            self.max_iterations
        } else {
            DEFAULT_MAX_ITERATIONS
        };
        let mut context_window = params.agent_config.compaction.context_window;
        if context_window == 0 {
            context_window = self.context_window;
        }
        if context_window == 0 {
            context_window = DEFAULT_CONTEXT_WINDOW;
        }

        let run_id = format!("run_{}", chrono::Utc::now().timestamp_millis());
        let mut emitter = EventEmitter::new(
            &run_id,
            params.session.session_key(),
            params.event_sink.clone(),
        );

        let mut messages = params.session.load_transcript()?;

        let user_msg = build_user_message(&params.user_message, &params.attachments);
        messages.push(user_msg.clone());
        if let Err(e) = params.session.append(user_msg.clone()) {
            warn!(error = %e, "failed to append user message to transcript");
        }

        let (provider, model, prov_cfg) = cfg
            .resolve_provider_for_agent(&params.agent_config)
            .map_err(|e| Error::Config(e.to_string()))?;

        let policy = Self::policy_for(&cfg, &params.agent_config);
        let tool_defs = self.tools.list_tool_defs(&policy);

        let base_params = ChatParams {
            provider: provider.clone(),
            model,
            api_key: prov_cfg.api_key.clone(),
            base_url: prov_cfg.base_url.clone(),
            messages: Vec::new(),
            tools: tool_defs,
            system: params.system_prompt.clone(),
        };

        let mut total_in: u64 = 0;
        let mut total_out: u64 = 0;
        let mut tool_steps: Vec<ToolStep> = Vec::new();
        let mut iterations: u64 = 0;

        loop {
            if iterations >= max_iter {
                let err = AgentError::MaxIterations;
                emitter.emit(EventKind::Error, |e| e.error = Some(err.to_string()));
                return Err(err.into());
            }
            if params.cancel.is_cancelled() {
                return Err(AgentError::Aborted.into());
            }

            emitter.emit(EventKind::StreamStart, |e| {
                e.text = Some(format!("iteration {}", iterations + 1));
            });

            let mut llm_params = base_params.clone();
            llm_params.messages = messages.clone();

            let result = match self
                .call_with_fallback(llm_params, &params.agent_config, &mut emitter, &params.cancel)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    // Context overflow → compact and retry. The retry does
                    // not consume an iteration.
                    if is_overflow(&err) {
                        info!("context overflow, attempting compaction");
                        emitter.emit(EventKind::CompactStart, |_| {});
                        let client = self.resolve_client(&provider);
                        if let Err(compact_err) = params
                            .session
                            .do_compact(&client, &base_params, context_window)
                            .await
                        {
                            let err = AgentError::CompactionAfterOverflow {
                                compact_error: compact_err.to_string(),
                                original: err.to_string(),
                            };
                            emitter.emit(EventKind::Error, |e| e.error = Some(err.to_string()));
                            return Err(err.into());
                        }
                        emitter.emit(EventKind::CompactEnd, |_| {});
                        messages = params.session.load_transcript().unwrap_or_default();
                        messages.push(user_msg.clone());
                        continue;
                    }
                    // Cancellation ends the run without a terminal event,
                    // same as the other cancellation checkpoints.
                    if matches!(err, Error::Agent(AgentError::Aborted)) {
                        return Err(err);
                    }
                    let msg = err.to_string();
                    emitter.emit(EventKind::Error, |e| e.error = Some(msg.clone()));
                    return Err(err);
                }
            };
            iterations += 1;

            if let Some(usage) = result.usage {
                total_in += usage.input_tokens;
                total_out += usage.output_tokens;
                params.session.store().update_usage(
                    params.session.session_key(),
                    usage.input_tokens,
                    usage.output_tokens,
                );
            }

            if let Err(e) = params.session.append(result.message.clone()) {
                warn!(error = %e, "failed to append assistant message");
            }

            if !result.text.is_empty() {
                emitter.emit(EventKind::Assistant, |e| e.text = Some(result.text.clone()));
            }

            if result.tool_calls.is_empty() {
                emitter.emit(EventKind::Done, |e| {
                    e.total_tokens_in = Some(total_in);
                    e.total_tokens_out = Some(total_out);
                    e.iterations = Some(iterations);
                });
                return Ok(RunResult {
                    text: result.text,
                    tool_steps,
                });
            }

            messages.push(result.message.clone());
            for tc in &result.tool_calls {
                emitter.emit(EventKind::ToolStart, |e| {
                    e.tool_name = Some(tc.name.clone());
                    e.tool_params = Some(tc.arguments.clone());
                });

                let tool_result = tokio::select! {
                    _ = params.cancel.cancelled() => return Err(AgentError::Aborted.into()),
                    res = self.tools.execute(&tc.name, &tc.arguments) => match res {
                        Ok(out) => out,
                        Err(e) => {
                            debug!(tool = %tc.name, error = %e, "tool execution failed");
                            serde_json::json!({ "error": e.to_string() }).to_string()
                        }
                    },
                };

                emitter.emit(EventKind::ToolEnd, |e| {
                    e.tool_name = Some(tc.name.clone());
                    e.tool_result = Some(tool_result.clone());
                });
                tool_steps.push(ToolStep {
                    tool_name: tc.name.clone(),
                    tool_params: tc.arguments.clone(),
                    tool_result: tool_result.clone(),
                });

                let tool_msg = Message::tool_result(&tc.id, &tool_result);
                messages.push(tool_msg.clone());
                if let Err(e) = params.session.append(tool_msg) {
                    warn!(error = %e, "failed to append tool result");
                }
            }

            // Proactive compaction after a tool round.
            if params.session.should_compact(context_window).unwrap_or(false) {
                emitter.emit(EventKind::CompactStart, |_| {});
                let client = self.resolve_client(&provider);
                match params
                    .session
                    .do_compact(&client, &base_params, context_window)
                    .await
                {
                    Ok(()) => {
                        emitter.emit(EventKind::CompactEnd, |_| {});
                        if let Ok(reloaded) = params.session.load_transcript() {
                            messages = reloaded;
                        }
                    }
                    Err(e) => warn!(error = %e, "post-iteration compaction failed"),
                }
            }
        }
    }

    /// Try the primary model, then each fallback, on rate-limit or auth
    /// failures. Other errors are returned immediately.
    async fn call_with_fallback(
        &self,
        params: ChatParams,
        agent_cfg: &AgentConfig,
        emitter: &mut EventEmitter,
        cancel: &CancellationToken,
    ) -> Result<StreamResult, Error> {
        let cfg = self.config.get();

        let mut candidates = vec![agent_cfg.model.clone()];
        candidates.extend(agent_cfg.fallbacks.iter().cloned());

        let mut default_provider = agent_cfg.provider.clone();
        if default_provider.is_empty() && agent_cfg.model.contains('/') {
            if let Ok((p, _, _)) = cfg.resolve_provider(&agent_cfg.model) {
                default_provider = p;
            }
        }

        let mut last_err: Option<Error> = None;
        for model_ref in &candidates {
            let (provider, model, prov_cfg) =
                match cfg.resolve_provider_with_default(model_ref, &default_provider) {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        last_err = Some(Error::Config(e.to_string()));
                        continue;
                    }
                };

            let mut p = params.clone();
            p.provider = provider.clone();
            p.model = model;
            p.api_key = prov_cfg.api_key.clone();
            p.base_url = prov_cfg.base_url.clone();

            let client = self.resolve_client(&provider);
            let stream = match client.chat(p).await {
                Ok(rx) => rx,
                Err(e) => {
                    let retryable = e
                        .as_api()
                        .map(|api| api.is_rate_limit() || api.is_auth())
                        .unwrap_or(false);
                    if retryable {
                        warn!(model = %model_ref, error = %e, "model failover");
                        last_err = Some(e.into());
                        continue;
                    }
                    return Err(e.into());
                }
            };

            return consume_with_events(stream, emitter, cancel).await;
        }

        Err(AgentError::AllModelsFailed(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no models configured".into()),
        )
        .into())
    }
}

fn is_overflow(err: &Error) -> bool {
    matches!(err, Error::Provider(ProviderError::Api(api)) if api.is_context_overflow())
}

/// Convert the user text plus attachments into one LLM message: images are
/// carried inline, everything else is summarized textually.
fn build_user_message(text: &str, attachments: &[Attachment]) -> Message {
    let mut images = Vec::new();
    let mut other_parts = Vec::new();
    for a in attachments {
        if a.kind == "image" {
            images.push(ImageData {
                url: a.url.clone(),
                base64: a.base64.clone(),
                mime: a.mime.clone(),
            });
        } else if !a.kind.is_empty() {
            if !a.url.is_empty() {
                other_parts.push(format!("{}: {}", a.kind, a.url));
            } else {
                other_parts.push(format!("{} (inline)", a.kind));
            }
        }
    }

    let mut user_text = text.to_string();
    if !other_parts.is_empty() {
        if !user_text.is_empty() {
            user_text.push_str("\n\n");
        }
        user_text.push_str(&format!("[Attached: {}]", other_parts.join("; ")));
    }

    if images.is_empty() {
        Message::user(user_text)
    } else {
        Message::user_with_images(user_text, images)
    }
}

/// Drain the stream, emitting `text_delta` events as chunks arrive and
/// checking cancellation between events.
async fn consume_with_events(
    mut rx: mpsc::Receiver<StreamEvent>,
    emitter: &mut EventEmitter,
    cancel: &CancellationToken,
) -> Result<StreamResult, Error> {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut arg_buffers: Vec<String> = Vec::new();
    let mut usage: Option<Usage> = None;
    let mut stop_reason = String::new();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Aborted.into()),
            event = rx.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            StreamEvent::TextDelta { text: t } => {
                emitter.emit(EventKind::TextDelta, |e| e.text = Some(t.clone()));
                text.push_str(&t);
            }
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
            StreamEvent::Error(e) => return Err(e.into()),
        }
    }

    for (call, args) in tool_calls.iter_mut().zip(arg_buffers) {
        call.arguments = args;
    }

    let message = Message {
        role: aido_core::message::Role::Assistant,
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use aido_core::error::{ApiError, ToolError};
    use aido_core::tool::Tool;
    use aido_session::{Compactor, SessionManager, Store};

    use crate::events::Event;

    type Script = Result<Vec<StreamEvent>, ProviderError>;

    /// Replays canned streams in order and records every request.
    struct ScriptedProvider {
        scripts: StdMutex<VecDeque<Script>>,
        calls: StdMutex<Vec<ChatParams>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts.into()),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<ChatParams> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat(
            &self,
            params: ChatParams,
        ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
            self.calls.lock().unwrap().push(params);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("provider called more times than scripted");
            let events = script?;
            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    struct ClockTool;

    #[async_trait]
    impl Tool for ClockTool {
        fn name(&self) -> &str {
            "exec"
        }
        fn description(&self) -> &str {
            "Execute a shell command"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value) -> Result<String, ToolError> {
            Ok("Mon Jan 1 00:00:00 UTC 2024".into())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "exec"
        }
        fn description(&self) -> &str {
            "Execute a shell command"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value) -> Result<String, ToolError> {
            Err(ToolError::ExecutionFailed {
                tool_name: "exec".into(),
                reason: "command not found".into(),
            })
        }
    }

    fn test_config() -> aido_config::Config {
        let mut cfg = aido_config::Config::default();
        cfg.providers.insert(
            "mock".into(),
            aido_config::ProviderConfig {
                api_key: "sk-test".into(),
                ..Default::default()
            },
        );
        cfg.agents.insert(
            "default".into(),
            aido_config::AgentConfig {
                model: "mock/test-model".into(),
                ..Default::default()
            },
        );
        cfg
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        handle: ConfigHandle,
        events: Arc<StdMutex<Vec<Event>>>,
        sink: EventSink,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        store.get_or_create("direct:main", "default");
        let handle = ConfigHandle::new("/dev/null", test_config());
        let events: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: EventSink = Arc::new(move |e| sink_events.lock().unwrap().push(e));
        Fixture {
            _dir: dir,
            store,
            handle,
            events,
            sink,
        }
    }

    fn run_params(fx: &Fixture, text: &str) -> RunParams {
        RunParams {
            session: SessionManager::new(fx.store.clone(), Compactor::default(), "direct:main"),
            agent_config: fx.handle.get().agents["default"].clone(),
            system_prompt: "You are helpful".into(),
            user_message: text.into(),
            attachments: Vec::new(),
            event_sink: Some(fx.sink.clone()),
            cancel: CancellationToken::new(),
        }
    }

    fn loop_with(fx: &Fixture, provider: Arc<ScriptedProvider>, tools: ToolRegistry) -> Loop {
        Loop::with_providers(
            fx.handle.clone(),
            Arc::new(tools),
            provider.clone(),
            provider,
        )
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[tokio::test]
    async fn simple_echo_no_tools() {
        let fx = fixture();
        let provider = ScriptedProvider::new(vec![Ok(vec![
            StreamEvent::TextDelta {
                text: "Hi there.".into(),
            },
            StreamEvent::Usage(Usage {
                input_tokens: 5,
                output_tokens: 3,
            }),
            StreamEvent::Done {
                stop_reason: "stop".into(),
            },
        ])]);
        let agent = loop_with(&fx, provider.clone(), ToolRegistry::new());

        let result = agent.run(run_params(&fx, "hello")).await.unwrap();
        assert_eq!(result.text, "Hi there.");
        assert!(result.tool_steps.is_empty());

        let events = fx.events.lock().unwrap();
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::StreamStart,
                EventKind::TextDelta,
                EventKind::Assistant,
                EventKind::Done,
            ]
        );
        let done = events.last().unwrap();
        assert_eq!(done.iterations, Some(1));
        assert_eq!(done.total_tokens_in, Some(5));
        assert_eq!(done.total_tokens_out, Some(3));

        // seq strictly increasing across the run
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        drop(events);

        // Transcript: user then assistant.
        let mgr = SessionManager::new(fx.store.clone(), Compactor::default(), "direct:main");
        let messages = mgr.load_transcript().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "Hi there.");

        // Usage rolled into session metadata.
        let entry = fx.store.get("direct:main").unwrap();
        assert_eq!(entry.input_tokens, 5);
        assert_eq!(entry.output_tokens, 3);
    }

    #[tokio::test]
    async fn tool_round_trip() {
        let fx = fixture();
        let provider = ScriptedProvider::new(vec![
            Ok(vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("tc_1".into()),
                    name: Some("exec".into()),
                    args: r#"{"command":"date"}"#.into(),
                },
                StreamEvent::Done {
                    stop_reason: "tool_use".into(),
                },
            ]),
            Ok(vec![
                StreamEvent::TextDelta {
                    text: "It's midnight UTC.".into(),
                },
                StreamEvent::Done {
                    stop_reason: "stop".into(),
                },
            ]),
        ]);
        let tools = ToolRegistry::new();
        tools.register(Arc::new(ClockTool));
        let agent = loop_with(&fx, provider.clone(), tools);

        let result = agent.run(run_params(&fx, "what time is it?")).await.unwrap();
        assert_eq!(result.text, "It's midnight UTC.");
        assert_eq!(result.tool_steps.len(), 1);
        assert_eq!(result.tool_steps[0].tool_name, "exec");
        assert!(result.tool_steps[0].tool_result.contains("Mon Jan 1"));

        let events = fx.events.lock().unwrap();
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::StreamStart,
                EventKind::ToolStart,
                EventKind::ToolEnd,
                EventKind::StreamStart,
                EventKind::TextDelta,
                EventKind::Assistant,
                EventKind::Done,
            ]
        );
        assert_eq!(events.last().unwrap().iterations, Some(2));
        drop(events);

        // Transcript order: user, assistant-with-toolcall, tool result,
        // assistant — and the tool-call ids pair up.
        let mgr = SessionManager::new(fx.store.clone(), Compactor::default(), "direct:main");
        let messages = mgr.load_transcript().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].tool_calls[0].id, "tc_1");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("tc_1"));
        assert_eq!(messages[3].content, "It's midnight UTC.");

        // The second LLM call saw the tool result.
        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1]
            .messages
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("tc_1")));
    }

    #[tokio::test]
    async fn tool_errors_feed_back_as_json() {
        let fx = fixture();
        let provider = ScriptedProvider::new(vec![
            Ok(vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("tc_1".into()),
                    name: Some("exec".into()),
                    args: "{}".into(),
                },
                StreamEvent::Done {
                    stop_reason: "tool_use".into(),
                },
            ]),
            Ok(vec![
                StreamEvent::TextDelta {
                    text: "That failed.".into(),
                },
                StreamEvent::Done {
                    stop_reason: "stop".into(),
                },
            ]),
        ]);
        let tools = ToolRegistry::new();
        tools.register(Arc::new(FailingTool));
        let agent = loop_with(&fx, provider.clone(), tools);

        let result = agent.run(run_params(&fx, "try it")).await.unwrap();
        assert_eq!(result.text, "That failed.");

        // The error became data, not a run failure.
        let step = &result.tool_steps[0];
        let parsed: serde_json::Value = serde_json::from_str(&step.tool_result).unwrap();
        assert!(parsed["error"]
            .as_str()
            .unwrap()
            .contains("command not found"));
    }

    #[tokio::test]
    async fn rate_limit_falls_back_to_secondary() {
        let fx = fixture();
        let mut cfg = test_config();
        cfg.agents.get_mut("default").unwrap().fallbacks = vec!["secondary".into()];
        fx.handle.set(cfg);

        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::from(ApiError::new(429, "slow down"))),
            Ok(vec![
                StreamEvent::TextDelta {
                    text: "from secondary".into(),
                },
                StreamEvent::Done {
                    stop_reason: "stop".into(),
                },
            ]),
        ]);
        let agent = loop_with(&fx, provider.clone(), ToolRegistry::new());

        let mut params = run_params(&fx, "hello");
        params.agent_config = fx.handle.get().agents["default"].clone();
        let result = agent.run(params).await.unwrap();
        assert_eq!(result.text, "from secondary");

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].model, "test-model");
        assert_eq!(calls[1].model, "secondary");
        // Same conversation, same tools on the retry.
        assert_eq!(calls[0].messages.len(), calls[1].messages.len());
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let fx = fixture();
        let mut cfg = test_config();
        cfg.agents.get_mut("default").unwrap().fallbacks = vec!["secondary".into()];
        fx.handle.set(cfg);

        let provider = ScriptedProvider::new(vec![Err(ProviderError::from(ApiError::new(
            500, "boom",
        )))]);
        let agent = loop_with(&fx, provider.clone(), ToolRegistry::new());

        let mut params = run_params(&fx, "hello");
        params.agent_config = fx.handle.get().agents["default"].clone();
        let err = agent.run(params).await.unwrap_err();
        assert!(err.to_string().contains("500"));
        assert_eq!(provider.calls().len(), 1);

        let events = fx.events.lock().unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::Error);
    }

    #[tokio::test]
    async fn overflow_triggers_compaction_and_retry() {
        let fx = fixture();
        let mut cfg = test_config();
        {
            let agent_cfg = cfg.agents.get_mut("default").unwrap();
            agent_cfg.compaction.context_window = 400;
            agent_cfg.compaction.keep_recent_tokens = 50;
            agent_cfg.compaction.reserve_tokens = 100;
        }
        fx.handle.set(cfg);

        // Pre-fill history so the compactor has something to fold.
        let seed = SessionManager::new(fx.store.clone(), Compactor::default(), "direct:main");
        for _ in 0..3 {
            seed.append(Message::user("x".repeat(400))).unwrap();
        }

        let provider = ScriptedProvider::new(vec![
            // First attempt: the provider rejects for context length.
            Err(ProviderError::from(ApiError::new(
                400,
                "maximum context length exceeded",
            ))),
            // The compactor's summarize call.
            Ok(vec![
                StreamEvent::TextDelta {
                    text: "earlier chatter".into(),
                },
                StreamEvent::Done {
                    stop_reason: "stop".into(),
                },
            ]),
            // Retry succeeds.
            Ok(vec![
                StreamEvent::TextDelta {
                    text: "recovered".into(),
                },
                StreamEvent::Done {
                    stop_reason: "stop".into(),
                },
            ]),
        ]);
        let agent = loop_with(&fx, provider.clone(), ToolRegistry::new());

        let mut params = run_params(&fx, "continue");
        params.agent_config = fx.handle.get().agents["default"].clone();
        params.session = SessionManager::new(
            fx.store.clone(),
            Compactor {
                keep_recent_tokens: 50,
                reserve_tokens: 100,
                ..Default::default()
            },
            "direct:main",
        );
        let result = agent.run(params).await.unwrap();
        assert_eq!(result.text, "recovered");

        let events = fx.events.lock().unwrap();
        let k = kinds(&events);
        assert_eq!(
            k,
            vec![
                EventKind::StreamStart,
                EventKind::CompactStart,
                EventKind::CompactEnd,
                EventKind::StreamStart,
                EventKind::TextDelta,
                EventKind::Assistant,
                EventKind::Done,
            ]
        );
        // The compaction retry did not count as an iteration.
        assert_eq!(events.last().unwrap().iterations, Some(1));
        drop(events);

        assert_eq!(fx.store.get("direct:main").unwrap().compactions, 1);

        // The transcript now begins with the summary.
        let mgr = SessionManager::new(fx.store.clone(), Compactor::default(), "direct:main");
        let messages = mgr.load_transcript().unwrap();
        assert_eq!(messages[0].role, aido_core::message::Role::System);
        assert!(messages[0].content.contains("earlier chatter"));
    }

    #[tokio::test]
    async fn iteration_cap_is_terminal() {
        let fx = fixture();
        let tool_use_stream = || {
            Ok(vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("tc".into()),
                    name: Some("exec".into()),
                    args: "{}".into(),
                },
                StreamEvent::Done {
                    stop_reason: "tool_use".into(),
                },
            ])
        };
        let provider = ScriptedProvider::new(vec![tool_use_stream(), tool_use_stream()]);
        let tools = ToolRegistry::new();
        tools.register(Arc::new(ClockTool));
        let mut agent = loop_with(&fx, provider, tools);
        agent.max_iterations = 2;

        let err = agent.run(run_params(&fx, "loop forever")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Agent(AgentError::MaxIterations)
        ));
    }

    #[tokio::test]
    async fn pre_cancelled_run_aborts() {
        let fx = fixture();
        let provider = ScriptedProvider::new(vec![]);
        let agent = loop_with(&fx, provider, ToolRegistry::new());

        let mut params = run_params(&fx, "hello");
        params.cancel = CancellationToken::new();
        params.cancel.cancel();
        let err = agent.run(params).await.unwrap_err();
        assert!(matches!(err, Error::Agent(AgentError::Aborted)));

        // Cancelled runs end silently: no events at all, in particular no
        // stray error or done.
        assert!(fx.events.lock().unwrap().is_empty());
    }

    /// Sleeps long enough for the run to be cancelled mid-execution.
    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "exec"
        }
        fn description(&self) -> &str {
            "Execute a shell command"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value) -> Result<String, ToolError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok("never".into())
        }
    }

    #[tokio::test]
    async fn cancel_during_tool_execution_aborts_silently() {
        let fx = fixture();
        let provider = ScriptedProvider::new(vec![Ok(vec![
            StreamEvent::ToolCallDelta {
                index: 0,
                id: Some("tc_1".into()),
                name: Some("exec".into()),
                args: "{}".into(),
            },
            StreamEvent::Done {
                stop_reason: "tool_use".into(),
            },
        ])]);
        let tools = ToolRegistry::new();
        tools.register(Arc::new(SlowTool));
        let agent = loop_with(&fx, provider, tools);

        let mut params = run_params(&fx, "take your time");
        let cancel = CancellationToken::new();
        params.cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = agent.run(params).await.unwrap_err();
        assert!(matches!(err, Error::Agent(AgentError::Aborted)));

        // The run got as far as starting the tool, then stopped without a
        // terminal event.
        let events = fx.events.lock().unwrap();
        assert_eq!(
            kinds(&events),
            vec![EventKind::StreamStart, EventKind::ToolStart]
        );
    }

    #[test]
    fn non_image_attachments_noted_in_text() {
        let msg = build_user_message(
            "see attached",
            &[
                Attachment {
                    kind: "file".into(),
                    url: "https://example.com/report.pdf".into(),
                    ..Default::default()
                },
                Attachment {
                    kind: "audio".into(),
                    base64: "QUJD".into(),
                    ..Default::default()
                },
            ],
        );
        assert!(msg.images.is_empty());
        assert!(msg
            .content
            .contains("[Attached: file: https://example.com/report.pdf; audio (inline)]"));
    }

    #[test]
    fn image_attachments_inline() {
        let msg = build_user_message(
            "look",
            &[Attachment {
                kind: "image".into(),
                base64: "QUJD".into(),
                mime: "image/png".into(),
                ..Default::default()
            }],
        );
        assert_eq!(msg.images.len(), 1);
        assert_eq!(msg.content, "look");
    }

    #[test]
    fn policy_for_layers_gateway_and_agent() {
        let mut cfg = test_config();
        cfg.gateway.tools_profile = "full".into();
        let mut agent = aido_config::AgentConfig::default();
        agent.tools.deny = vec!["exec".into()];
        let policy = Loop::policy_for(&cfg, &agent);
        assert!(!policy.is_allowed("exec"));
        assert!(policy.is_allowed("read_file"));
    }
}
