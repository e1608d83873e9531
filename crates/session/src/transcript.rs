//! Append-only JSONL transcripts.
//!
//! One JSON object per line. A `compaction` entry semantically replaces
//! everything before it: on load, the accumulated message list resets to a
//! single synthetic system message carrying the summary. Rewrites go
//! through a `.tmp` sibling and an atomic rename.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aido_core::error::SessionError;
use aido_core::message::Message;

/// Longest transcript line we are willing to parse.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// A single line in the JSONL transcript file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// "message" | "compaction". Unknown types are skipped on load.
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

impl TranscriptEntry {
    pub fn message(msg: Message) -> Self {
        Self {
            kind: "message".into(),
            id: format!("m{}", Utc::now().timestamp_millis()),
            timestamp: Utc::now(),
            message: Some(msg),
            summary: String::new(),
        }
    }

    pub fn compaction(summary: impl Into<String>) -> Self {
        Self {
            kind: "compaction".into(),
            id: format!("c{}", Utc::now().timestamp_millis()),
            timestamp: Utc::now(),
            message: None,
            summary: summary.into(),
        }
    }
}

/// Manages one session's transcript file.
pub struct Transcript {
    path: PathBuf,
}

impl Transcript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one message entry.
    pub fn append(&self, msg: Message) -> Result<(), SessionError> {
        self.append_entry(&TranscriptEntry::message(msg))
    }

    /// Append a compaction summary entry.
    pub fn append_compaction(&self, summary: &str) -> Result<(), SessionError> {
        self.append_entry(&TranscriptEntry::compaction(summary))
    }

    fn append_entry(&self, entry: &TranscriptEntry) -> Result<(), SessionError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| SessionError::Transcript(format!("create {}: {e}", dir.display())))?;
        }
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| SessionError::Transcript(format!("marshal entry: {e}")))?;
        line.push(b'\n');

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| SessionError::Transcript(format!("open {}: {e}", self.path.display())))?;
        file.write_all(&line)
            .map_err(|e| SessionError::Transcript(format!("append: {e}")))
    }

    /// Load the conversation. Malformed or oversized lines and unknown
    /// entry types are skipped; a compaction entry resets the accumulated
    /// list to a single summary system message.
    pub fn load(&self) -> Result<Vec<Message>, SessionError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SessionError::Transcript(format!(
                    "open {}: {e}",
                    self.path.display()
                )))
            }
        };

        let mut messages = Vec::new();
        let reader = BufReader::new(file);
        for line in reader.split(b'\n') {
            let line =
                line.map_err(|e| SessionError::Transcript(format!("read transcript: {e}")))?;
            if line.is_empty() || line.len() > MAX_LINE_BYTES {
                continue;
            }
            let Ok(entry) = serde_json::from_slice::<TranscriptEntry>(&line) else {
                continue;
            };
            match entry.kind.as_str() {
                "message" => {
                    if let Some(msg) = entry.message {
                        messages.push(msg);
                    }
                }
                "compaction" => {
                    messages = vec![Message::system(format!(
                        "[Previous conversation summary]\n{}",
                        entry.summary
                    ))];
                }
                _ => {}
            }
        }
        Ok(messages)
    }

    /// Replace the whole transcript. Write-temp-then-rename keeps the swap
    /// atomic.
    pub fn rewrite(&self, entries: &[TranscriptEntry]) -> Result<(), SessionError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)
                .map_err(|e| SessionError::Transcript(format!("create {}: {e}", tmp.display())))?;
            for entry in entries {
                let mut line = serde_json::to_vec(entry)
                    .map_err(|e| SessionError::Transcript(format!("marshal entry: {e}")))?;
                line.push(b'\n');
                file.write_all(&line)
                    .map_err(|e| SessionError::Transcript(format!("write entry: {e}")))?;
            }
        }
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| SessionError::Transcript(format!("rename {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aido_core::message::ToolCall;

    fn temp_transcript() -> (tempfile::TempDir, Transcript) {
        let dir = tempfile::tempdir().unwrap();
        let t = Transcript::new(dir.path().join("session.jsonl"));
        (dir, t)
    }

    #[test]
    fn load_missing_file_is_empty() {
        let (_dir, t) = temp_transcript();
        assert!(t.load().unwrap().is_empty());
    }

    #[test]
    fn append_then_load_preserves_order() {
        let (_dir, t) = temp_transcript();
        t.append(Message::user("hello")).unwrap();
        t.append(Message::assistant("hi there")).unwrap();

        let messages = t.load().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "hi there");
    }

    #[test]
    fn append_after_load_suffixes() {
        // Spec property: Load + Append(m) + Load == original ++ [m].
        let (_dir, t) = temp_transcript();
        t.append(Message::user("a")).unwrap();
        let before = t.load().unwrap();
        t.append(Message::user("b")).unwrap();
        let after = t.load().unwrap();
        assert_eq!(after.len(), before.len() + 1);
        assert_eq!(after[after.len() - 1].content, "b");
    }

    #[test]
    fn compaction_resets_history() {
        let (_dir, t) = temp_transcript();
        t.append(Message::user("old 1")).unwrap();
        t.append(Message::assistant("old 2")).unwrap();
        t.append_compaction("they talked about rust").unwrap();
        t.append(Message::user("new")).unwrap();

        let messages = t.load().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, aido_core::message::Role::System);
        assert!(messages[0]
            .content
            .starts_with("[Previous conversation summary]\n"));
        assert!(messages[0].content.contains("they talked about rust"));
        assert_eq!(messages[1].content, "new");
    }

    #[test]
    fn malformed_and_unknown_lines_skipped() {
        let (_dir, t) = temp_transcript();
        t.append(Message::user("keep me")).unwrap();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(t.path())
            .unwrap();
        writeln!(file, "this is not json").unwrap();
        writeln!(file, r#"{{"type":"mystery","id":"x","timestamp":"2024-01-01T00:00:00Z"}}"#)
            .unwrap();
        drop(file);

        let messages = t.load().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "keep me");
    }

    #[test]
    fn rewrite_is_atomic_replacement() {
        let (_dir, t) = temp_transcript();
        t.append(Message::user("old")).unwrap();

        let entries = vec![
            TranscriptEntry::compaction("summary of the past"),
            TranscriptEntry::message(Message::user("recent")),
        ];
        t.rewrite(&entries).unwrap();

        let messages = t.load().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("summary of the past"));
        assert_eq!(messages[1].content, "recent");
        assert!(!t.path().with_extension("jsonl.tmp").exists());
    }

    #[test]
    fn tool_calls_roundtrip_through_transcript() {
        let (_dir, t) = temp_transcript();
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(ToolCall {
            id: "tc_1".into(),
            name: "exec".into(),
            arguments: r#"{"command":"date"}"#.into(),
        });
        t.append(assistant).unwrap();
        t.append(Message::tool_result("tc_1", "Mon Jan 1")).unwrap();

        let messages = t.load().unwrap();
        assert_eq!(messages[0].tool_calls[0].id, "tc_1");
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("tc_1"));
    }
}
