//! Bridge manifest (`aido-bridge.json`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MANIFEST_NAME: &str = "aido-bridge.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("read manifest: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Declares how to run one bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub description: String,
    /// "node" | "npx" | "python" | "exec".
    pub runtime: String,
    /// Argv lists executed in order. All but the last are one-shot setup
    /// steps; the last is the long-running bridge process.
    pub commands: Vec<Vec<String>>,
    /// Working directory relative to the bridge folder.
    pub cwd: String,
    /// Optional KEY=VALUE env file relative to the working directory.
    #[serde(rename = "envFile")]
    pub env_file: String,
    #[serde(rename = "envSchema")]
    pub env_schema: Vec<EnvSchemaEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvSchemaEntry {
    pub key: String,
    pub description: String,
    pub required: bool,
}

impl Manifest {
    /// Load `aido-bridge.json` from a bridge directory.
    pub fn load(bridge_dir: &Path) -> Result<Self, ManifestError> {
        let data = std::fs::read(bridge_dir.join(MANIFEST_NAME))?;
        let mut manifest: Manifest = serde_json::from_slice(&data)?;
        if manifest.cwd.is_empty() {
            manifest.cwd = ".".into();
        }
        Ok(manifest)
    }

    /// Split the command list into (setup steps, long-running command).
    pub fn split_commands(&self) -> Option<(&[Vec<String>], &[String])> {
        let (last, setup) = self.commands.split_last()?;
        if last.is_empty() {
            return None;
        }
        Some((setup, last))
    }
}

/// Parse KEY=VALUE lines; `#` comments and blanks are skipped.
pub fn parse_env_file(data: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                vars.push((key.to_string(), value.trim().to_string()));
            }
        }
    }
    vars
}
