//! Structured events emitted by the agent loop.
//!
//! The gateway fans these out to connected clients and bridges. Within one
//! run, `seq` is strictly increasing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StreamStart,
    TextDelta,
    ToolStart,
    ToolEnd,
    Assistant,
    CompactStart,
    CompactEnd,
    Error,
    Done,
}

/// One tool invocation, collected for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStep {
    pub tool_name: String,
    pub tool_params: String,
    pub tool_result: String,
}

/// A structured event scoped to one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_id: String,
    pub session_key: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_params: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
}

/// Receives events from the agent loop.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Stamps every emitted event with the run id, session key, and a
/// strictly increasing sequence number.
pub struct EventEmitter {
    run_id: String,
    session_key: String,
    sink: Option<EventSink>,
    seq: u64,
}

impl EventEmitter {
    pub fn new(run_id: &str, session_key: &str, sink: Option<EventSink>) -> Self {
        Self {
            run_id: run_id.to_string(),
            session_key: session_key.to_string(),
            sink,
            seq: 0,
        }
    }

    pub fn emit(&mut self, kind: EventKind, mutate: impl FnOnce(&mut Event)) {
        let Some(sink) = &self.sink else {
            return;
        };
        self.seq += 1;
        let mut event = Event {
            kind,
            run_id: self.run_id.clone(),
            session_key: self.session_key.clone(),
            seq: self.seq,
            timestamp: Utc::now(),
            text: None,
            tool_name: None,
            tool_params: None,
            tool_result: None,
            error: None,
            total_tokens_in: None,
            total_tokens_out: None,
            iterations: None,
        };
        mutate(&mut event);
        sink(event);
    }
}
