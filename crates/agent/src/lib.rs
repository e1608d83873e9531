//! Agent orchestration for Aido.
//!
//! The [`Loop`] drives one turn against a streaming LLM provider: request,
//! incremental consumption, tool dispatch, result feedback, iterate. The
//! [`Router`] sits above it, serializing turns per session and assembling
//! the system prompt.

pub mod events;
pub mod loop_runner;
pub mod prompt;
pub mod router;
pub mod skills;

pub use events::{Event, EventEmitter, EventKind, EventSink, ToolStep};
pub use loop_runner::{Attachment, Loop, RunParams, RunResult};
pub use router::{session_key, InboundMessage, Router};
pub use skills::SkillEntry;
