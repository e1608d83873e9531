//! Session metadata index.
//!
//! One JSON file maps sessionKey → entry. Mutations update the in-memory
//! map; `save` persists the whole index with a write-temp-then-rename so a
//! crash never leaves a torn file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aido_core::error::SessionError;

/// Metadata for a single session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_key: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub compactions: u64,
}

/// Session metadata store plus transcript-path derivation.
pub struct Store {
    base_dir: PathBuf,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl Store {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Read the metadata index from disk. A missing file is an empty store.
    pub fn load(&self) -> Result<(), SessionError> {
        let path = self.meta_path();
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SessionError::Store(format!("read {}: {e}", path.display()))),
        };
        let entries: HashMap<String, SessionEntry> = serde_json::from_slice(&data)
            .map_err(|e| SessionError::Store(format!("parse {}: {e}", path.display())))?;
        *self.sessions.write().unwrap() = entries;
        Ok(())
    }

    /// Persist the metadata index atomically.
    pub fn save(&self) -> Result<(), SessionError> {
        let path = self.meta_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| SessionError::Store(format!("create {}: {e}", dir.display())))?;
        }
        let data = {
            let sessions = self.sessions.read().unwrap();
            serde_json::to_vec_pretty(&*sessions)
                .map_err(|e| SessionError::Store(format!("marshal session store: {e}")))?
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .map_err(|e| SessionError::Store(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| SessionError::Store(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn get(&self, session_key: &str) -> Option<SessionEntry> {
        self.sessions.read().unwrap().get(session_key).cloned()
    }

    /// Fetch a session, creating it lazily on first use.
    pub fn get_or_create(&self, session_key: &str, agent_id: &str) -> SessionEntry {
        let mut sessions = self.sessions.write().unwrap();
        sessions
            .entry(session_key.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                SessionEntry {
                    session_key: session_key.to_string(),
                    agent_id: agent_id.to_string(),
                    created_at: now,
                    updated_at: now,
                    input_tokens: 0,
                    output_tokens: 0,
                    compactions: 0,
                }
            })
            .clone()
    }

    pub fn list(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> =
            self.sessions.read().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        entries
    }

    /// Remove a session's metadata and transcript file.
    pub fn delete(&self, session_key: &str) -> Result<(), SessionError> {
        self.sessions.write().unwrap().remove(session_key);
        let path = self.transcript_path(session_key);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SessionError::Store(format!(
                    "remove {}: {e}",
                    path.display()
                )))
            }
        }
        self.save()
    }

    /// Add token usage to a session's cumulative counters.
    pub fn update_usage(&self, session_key: &str, input: u64, output: u64) {
        if let Some(entry) = self.sessions.write().unwrap().get_mut(session_key) {
            entry.input_tokens += input;
            entry.output_tokens += output;
            entry.updated_at = Utc::now();
        }
    }

    pub fn increment_compactions(&self, session_key: &str) {
        if let Some(entry) = self.sessions.write().unwrap().get_mut(session_key) {
            entry.compactions += 1;
            entry.updated_at = Utc::now();
        }
    }

    /// Where this session's transcript lives.
    pub fn transcript_path(&self, session_key: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.jsonl", safe_file_name(session_key)))
    }

    fn meta_path(&self) -> PathBuf {
        self.base_dir.join("meta.json")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with an underscore.
fn safe_file_name(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
