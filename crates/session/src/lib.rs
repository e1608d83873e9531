//! Session persistence and context-window management.
//!
//! A session is one conversation keyed by `channel:chatId`. Metadata for
//! all sessions lives in a single JSON index; each session's history is an
//! append-only JSONL transcript. When a conversation outgrows the model's
//! context window, the [`Compactor`] summarizes older messages via the LLM
//! and atomically rewrites the transcript.

mod compactor;
mod store;
mod token;
mod transcript;

pub use compactor::{Compactor, SessionManager, DEFAULT_SUMMARIZE_TEMPLATE};
pub use store::{SessionEntry, Store};
pub use token::{estimate_messages_tokens, estimate_tokens};
pub use transcript::{Transcript, TranscriptEntry};
