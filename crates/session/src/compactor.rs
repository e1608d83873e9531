//! LLM-driven transcript compaction.
//!
//! When a conversation approaches the context window, older messages are
//! partitioned into chunks, each chunk is summarized by the LLM, and the
//! transcript is rewritten as one compaction entry followed by the kept
//! recent suffix.

use std::sync::Arc;

use tracing::debug;

use aido_core::error::{ProviderError, SessionError};
use aido_core::message::{Message, Role};
use aido_core::provider::{consume_stream, ChatParams, Provider};

use crate::store::Store;
use crate::token::{estimate_messages_tokens, estimate_tokens};
use crate::transcript::{Transcript, TranscriptEntry};

pub const DEFAULT_SUMMARIZE_TEMPLATE: &str = "Summarize the following conversation segment. \
Preserve key facts, decisions, open tasks, file paths, and tool results. Be concise.\n\n\
{conversation}\n\nSummary:";

/// Context-window management tunables and the compact algorithm.
#[derive(Debug, Clone)]
pub struct Compactor {
    /// Tokens to keep verbatim at the end of the conversation.
    pub keep_recent_tokens: u64,
    /// Tokens reserved for new content when deciding to compact.
    pub reserve_tokens: u64,
    /// Target chunk size as a fraction of the older portion.
    pub chunk_ratio: f64,
    /// Multiplier compensating for estimation inaccuracy (>= 1.2).
    pub safety_margin: f64,
    /// Summarization prompt; `{conversation}` is replaced with the chunk.
    pub summarize_template: String,
}

impl Default for Compactor {
    fn default() -> Self {
        Self {
            keep_recent_tokens: 20_000,
            reserve_tokens: 16_384,
            chunk_ratio: 0.4,
            safety_margin: 1.2,
            summarize_template: DEFAULT_SUMMARIZE_TEMPLATE.into(),
        }
    }
}

impl Compactor {
    /// Whether the conversation is close enough to the window to compact.
    pub fn should_compact(&self, messages: &[Message], context_window: u64) -> bool {
        let estimated =
            (estimate_messages_tokens(messages) as f64 * self.safety_margin) as u64;
        estimated > context_window.saturating_sub(self.reserve_tokens)
    }

    /// Summarize older messages. Returns the new message list (summary
    /// system message + recent suffix) and the combined summary text, or
    /// `None` when there is nothing to compress.
    pub async fn compact(
        &self,
        provider: &Arc<dyn Provider>,
        messages: &[Message],
        params: &ChatParams,
    ) -> Result<Option<(Vec<Message>, String)>, ProviderError> {
        let split = self.find_split_index(messages);
        if split == 0 {
            return Ok(None);
        }

        let (to_compress, to_keep) = messages.split_at(split);
        let chunks = self.chunk_messages(to_compress);
        debug!(
            older = to_compress.len(),
            kept = to_keep.len(),
            chunks = chunks.len(),
            "compacting transcript"
        );

        let mut summaries = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            summaries.push(self.summarize_chunk(provider, chunk, params).await?);
        }
        let full_summary = summaries.join("\n\n");

        let mut new_messages = Vec::with_capacity(to_keep.len() + 1);
        new_messages.push(Message::system(format!(
            "[Previous conversation summary]\n{full_summary}"
        )));
        new_messages.extend(to_keep.iter().cloned());

        Ok(Some((new_messages, full_summary)))
    }

    /// Walk newest-to-oldest until `keep_recent_tokens` is reached. The
    /// returned index is the first kept message. The split is then backed
    /// up so the kept suffix never starts with a tool-result whose
    /// assistant tool-call would be summarized away.
    fn find_split_index(&self, messages: &[Message]) -> usize {
        let mut total: u64 = 0;
        let mut split = 0;
        for (i, msg) in messages.iter().enumerate().rev() {
            let mut tokens = estimate_tokens(&msg.content) + 4;
            for tc in &msg.tool_calls {
                tokens += estimate_tokens(&tc.arguments);
            }
            total += tokens;
            if total >= self.keep_recent_tokens {
                split = i + 1;
                break;
            }
        }
        while split > 0 && split < messages.len() && messages[split].role == Role::Tool {
            split -= 1;
        }
        split
    }

    /// Partition the older portion into chunks of roughly
    /// `chunk_ratio × total` tokens, at least 2000 tokens each.
    fn chunk_messages<'a>(&self, messages: &'a [Message]) -> Vec<&'a [Message]> {
        if messages.is_empty() {
            return Vec::new();
        }

        let total = estimate_messages_tokens(messages);
        let chunk_size = ((total as f64 * self.chunk_ratio) as u64).max(2000);

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut current: u64 = 0;
        for (i, msg) in messages.iter().enumerate() {
            let tokens = estimate_tokens(&msg.content) + 4;
            if current + tokens > chunk_size && i > start {
                chunks.push(&messages[start..i]);
                start = i;
                current = 0;
            }
            current += tokens;
        }
        chunks.push(&messages[start..]);
        chunks
    }

    async fn summarize_chunk(
        &self,
        provider: &Arc<dyn Provider>,
        chunk: &[Message],
        base: &ChatParams,
    ) -> Result<String, ProviderError> {
        let mut body = String::new();
        for msg in chunk {
            body.push_str(&format!("[{}]: {}\n", msg.role, msg.content));
            for tc in &msg.tool_calls {
                body.push_str(&format!(
                    "  [tool_call {}]: {}({})\n",
                    tc.id,
                    tc.name,
                    truncate(&tc.arguments, 200)
                ));
            }
        }

        let prompt = self.summarize_template.replace("{conversation}", &body);
        let rx = provider
            .chat(ChatParams {
                provider: base.provider.clone(),
                model: base.model.clone(),
                api_key: base.api_key.clone(),
                base_url: base.base_url.clone(),
                messages: vec![Message::user(prompt)],
                tools: Vec::new(),
                system: String::new(),
            })
            .await?;
        let result = consume_stream(rx).await?;
        Ok(result.text)
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Ties together Store, Transcript, and Compactor for a single session.
pub struct SessionManager {
    store: Arc<Store>,
    compactor: Compactor,
    session_key: String,
    transcript: Transcript,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, compactor: Compactor, session_key: &str) -> Self {
        let transcript = Transcript::new(store.transcript_path(session_key));
        Self {
            store,
            compactor,
            session_key: session_key.to_string(),
            transcript,
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn load_transcript(&self) -> Result<Vec<Message>, SessionError> {
        self.transcript.load()
    }

    pub fn append(&self, msg: Message) -> Result<(), SessionError> {
        self.transcript.append(msg)
    }

    pub fn should_compact(&self, context_window: u64) -> Result<bool, SessionError> {
        let messages = self.transcript.load()?;
        Ok(self.compactor.should_compact(&messages, context_window))
    }

    /// Run compaction end to end: summarize, rewrite the transcript as one
    /// compaction entry plus the kept suffix, and bump the session's
    /// compaction counter.
    pub async fn do_compact(
        &self,
        provider: &Arc<dyn Provider>,
        params: &ChatParams,
        context_window: u64,
    ) -> Result<(), SessionError> {
        let messages = self.transcript.load()?;
        if !self.compactor.should_compact(&messages, context_window) {
            return Ok(());
        }

        let Some((new_messages, summary)) = self
            .compactor
            .compact(provider, &messages, params)
            .await
            .map_err(|e| SessionError::Compaction(e.to_string()))?
        else {
            return Ok(());
        };
        if summary.is_empty() {
            return Ok(());
        }

        // The summary system message is carried by the compaction entry
        // itself, so the rewrite starts at index 1.
        let mut entries = Vec::with_capacity(new_messages.len());
        entries.push(TranscriptEntry::compaction(&summary));
        for msg in &new_messages[1..] {
            entries.push(TranscriptEntry::message(msg.clone()));
        }
        self.transcript.rewrite(&entries)?;

        self.store.increment_compactions(&self.session_key);
        self.store.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use aido_core::message::ToolCall;
    use aido_core::provider::StreamEvent;

    /// A provider that answers every chat with a fixed summary text.
    struct SummaryProvider(&'static str);

    #[async_trait]
    impl Provider for SummaryProvider {
        async fn chat(
            &self,
            _params: ChatParams,
        ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
            let (tx, rx) = mpsc::channel(4);
            let text = self.0.to_string();
            tokio::spawn(async move {
                let _ = tx.send(StreamEvent::TextDelta { text }).await;
                let _ = tx
                    .send(StreamEvent::Done {
                        stop_reason: "stop".into(),
                    })
                    .await;
            });
            Ok(rx)
        }
    }

    fn long_message(role: Role, len: usize) -> Message {
        let content = "x".repeat(len);
        match role {
            Role::User => Message::user(content),
            Role::Assistant => Message::assistant(content),
            _ => Message::system(content),
        }
    }

    #[test]
    fn should_compact_respects_reserve() {
        let compactor = Compactor {
            keep_recent_tokens: 100,
            reserve_tokens: 1000,
            ..Default::default()
        };
        // 4800 ASCII chars ≈ 1201 tokens, ×1.2 ≈ 1445 > 1200 − 1000.
        let messages = vec![long_message(Role::User, 4800)];
        assert!(compactor.should_compact(&messages, 1200));
        assert!(!compactor.should_compact(&messages, 100_000));
    }

    #[test]
    fn split_keeps_recent_tokens() {
        let compactor = Compactor {
            keep_recent_tokens: 150,
            ..Default::default()
        };
        // Each message ≈ 105 tokens; the walk crosses 150 at the second
        // message from the end, which lands in the compressed portion.
        let messages: Vec<Message> = (0..5)
            .map(|_| long_message(Role::User, 400))
            .collect();
        let split = compactor.find_split_index(&messages);
        assert_eq!(split, 4);
    }

    #[test]
    fn split_zero_when_everything_fits() {
        let compactor = Compactor::default();
        let messages = vec![Message::user("short")];
        assert_eq!(compactor.find_split_index(&messages), 0);
    }

    #[test]
    fn split_never_starts_with_tool_result() {
        let compactor = Compactor {
            keep_recent_tokens: 200,
            ..Default::default()
        };
        let mut assistant = long_message(Role::Assistant, 400);
        assistant.tool_calls.push(ToolCall {
            id: "tc_1".into(),
            name: "exec".into(),
            arguments: "{}".into(),
        });
        let messages = vec![
            long_message(Role::User, 400),
            long_message(Role::User, 400),
            assistant,
            Message::tool_result("tc_1", &"y".repeat(400)),
            long_message(Role::Assistant, 40),
        ];
        let split = compactor.find_split_index(&messages);
        // The raw walk would land on the tool result (index 3); the
        // adjustment pulls the assistant tool-call into the kept suffix.
        assert!(split <= 2, "split {split} strands a tool result");
        if split > 0 {
            assert_ne!(messages[split].role, Role::Tool);
        }
    }

    #[test]
    fn chunks_cover_all_messages_in_order() {
        let compactor = Compactor::default();
        let messages: Vec<Message> = (0..40)
            .map(|_| long_message(Role::User, 800))
            .collect();
        let chunks = compactor.chunk_messages(&messages);
        assert!(!chunks.is_empty());
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, messages.len());
    }

    #[tokio::test]
    async fn compact_produces_summary_plus_suffix() {
        let compactor = Compactor {
            keep_recent_tokens: 150,
            ..Default::default()
        };
        let provider: Arc<dyn Provider> = Arc::new(SummaryProvider("compressed history"));
        let messages: Vec<Message> = (0..5)
            .map(|_| long_message(Role::User, 400))
            .collect();

        let (new_messages, summary) = compactor
            .compact(&provider, &messages, &ChatParams::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary, "compressed history");
        assert_eq!(new_messages[0].role, Role::System);
        assert!(new_messages[0].content.contains("compressed history"));
        assert_eq!(new_messages.len(), 2); // summary + 1 kept message
    }

    #[tokio::test]
    async fn manager_do_compact_rewrites_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        store.get_or_create("tg:12", "default");

        let compactor = Compactor {
            keep_recent_tokens: 100,
            reserve_tokens: 100,
            ..Default::default()
        };
        let mgr = SessionManager::new(store.clone(), compactor, "tg:12");
        for _ in 0..5 {
            mgr.append(Message::user("z".repeat(400))).unwrap();
        }

        let provider: Arc<dyn Provider> = Arc::new(SummaryProvider("what came before"));
        mgr.do_compact(&provider, &ChatParams::default(), 500)
            .await
            .unwrap();

        let messages = mgr.load_transcript().unwrap();
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("what came before"));
        assert!(messages.len() < 6);
        assert_eq!(store.get("tg:12").unwrap().compactions, 1);
    }

    #[tokio::test]
    async fn do_compact_noop_when_under_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        store.get_or_create("tg:12", "default");
        let mgr = SessionManager::new(store.clone(), Compactor::default(), "tg:12");
        mgr.append(Message::user("hi")).unwrap();

        let provider: Arc<dyn Provider> = Arc::new(SummaryProvider("unused"));
        mgr.do_compact(&provider, &ChatParams::default(), 200_000)
            .await
            .unwrap();

        assert_eq!(mgr.load_transcript().unwrap().len(), 1);
        assert_eq!(store.get("tg:12").unwrap().compactions, 0);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 200), "short");
        let truncated = truncate(&"配".repeat(100), 10);
        assert!(truncated.ends_with("..."));
    }
}
