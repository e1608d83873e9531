//! Message routing: agent selection, per-session serialization, prompt
//! assembly, and loop invocation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aido_config::ConfigHandle;
use aido_core::error::{AgentError, Error};
use aido_session::{Compactor, SessionManager, Store};

use crate::events::EventSink;
use crate::loop_runner::{Attachment, Loop, RunParams, RunResult};
use crate::prompt::PromptBuilder;
use crate::skills;

/// A message arriving from any transport.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    /// Requested agent. Overridden by `gateway.currentAgent`; falls back
    /// to "default".
    pub agent_id: String,
    /// Source channel (e.g. "webchat", "telegram", "openai").
    pub channel: String,
    /// Conversation id on that channel.
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub message_id: String,
}

/// Derive the session key for storage and locking. Agent identity is
/// deliberately not part of the key: switching agents keeps the history.
pub fn session_key(channel: &str, chat_id: &str) -> String {
    let channel = if channel.is_empty() { "direct" } else { channel };
    let chat_id = if chat_id.is_empty() { "main" } else { chat_id };
    format!("{channel}:{chat_id}")
}

/// Split a stored session key back into (channel, chatId). The chat id
/// may itself contain ':'.
pub fn parse_session_key(key: &str) -> (String, String) {
    let key = key.trim();
    if key.is_empty() {
        return ("direct".into(), "main".into());
    }
    match key.split_once(':') {
        Some((channel, chat_id)) => (channel.to_string(), chat_id.to_string()),
        None => (key.to_string(), "main".into()),
    }
}

/// Routes inbound messages into agent runs, one at a time per session.
pub struct Router {
    config: ConfigHandle,
    agent_loop: Arc<Loop>,
    store: Arc<Store>,
    locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Router {
    pub fn new(config: ConfigHandle, agent_loop: Arc<Loop>, store: Arc<Store>) -> Self {
        Self {
            config,
            agent_loop,
            store,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Process one inbound message end to end. Runs on the same session
    /// are serialized; distinct sessions proceed concurrently.
    pub async fn handle_message(
        &self,
        msg: InboundMessage,
        sink: Option<EventSink>,
        cancel: CancellationToken,
    ) -> Result<RunResult, Error> {
        let cfg = self.config.get();

        let mut agent_id = msg.agent_id.clone();
        if !cfg.gateway.current_agent.is_empty() {
            agent_id = cfg.gateway.current_agent.clone();
        }
        if agent_id.is_empty() {
            agent_id = "default".into();
        }

        let agent_cfg = cfg
            .agents
            .get(&agent_id)
            .ok_or_else(|| Error::Agent(AgentError::UnknownAgent(agent_id.clone())))?
            .clone();

        let mut skill_dirs = agent_cfg.skills.dirs.clone();
        if skill_dirs.is_empty() && !agent_cfg.workspace.is_empty() {
            skill_dirs.push(format!("{}/skills", agent_cfg.workspace));
        }
        let loaded_skills = skills::load_from_dirs(&skill_dirs);

        let key = session_key(&msg.channel, &msg.chat_id);

        let lock = self.session_lock(&key);
        let _guard = lock.lock().await;

        self.store.get_or_create(&key, &agent_id);

        let mut compactor = Compactor::default();
        let c = &agent_cfg.compaction;
        if c.keep_recent_tokens > 0 {
            compactor.keep_recent_tokens = c.keep_recent_tokens;
        }
        if c.reserve_tokens > 0 {
            compactor.reserve_tokens = c.reserve_tokens;
        }
        if c.chunk_ratio > 0.0 {
            compactor.chunk_ratio = c.chunk_ratio;
        }
        if cfg.gateway.locale == "zh" {
            compactor.summarize_template = crate::prompt::SUMMARIZE_TEMPLATE_ZH.into();
        }
        let session = SessionManager::new(self.store.clone(), compactor, &key);

        let policy = Loop::policy_for(&cfg, &agent_cfg);
        let tool_defs = self.agent_loop.tools().list_tool_defs(&policy);
        let system_prompt = PromptBuilder {
            agent_id: &agent_id,
            agent_config: &agent_cfg,
            tool_defs: &tool_defs,
            skills: &loaded_skills,
            workspace: &agent_cfg.workspace,
            config_path: Some(self.config.path().display().to_string()),
        }
        .build();

        info!(agent = %agent_id, session = %key, channel = %msg.channel, "agent run started");
        let started = Instant::now();

        let result = self
            .agent_loop
            .run(RunParams {
                session,
                agent_config: agent_cfg,
                system_prompt,
                user_message: msg.text,
                attachments: msg.attachments,
                event_sink: sink,
                cancel,
            })
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    agent = %agent_id,
                    session = %key,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "agent run completed"
                );
                if let Err(e) = self.store.save() {
                    warn!(error = %e, "failed to save session store");
                }
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    agent = %agent_id,
                    session = %key,
                    error = %e,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "agent run failed"
                );
                Err(e)
            }
        }
    }

    /// Keyed mutex map, grown lazily and never shrunk — sessionKey
    /// cardinality is bounded by real conversations.
    fn session_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
