//! Filesystem tools: read, write, edit, list.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use aido_core::error::ToolError;
use aido_core::tool::Tool;

const MAX_READ_BYTES: usize = 100_000;

fn resolve(workdir: &Path, p: &str) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

fn str_arg<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing '{key}' argument")))
}

/// Read a file's contents, truncated at 100 KB.
pub struct ReadFileTool {
    workdir: PathBuf,
}

impl ReadFileTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to read" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = resolve(&self.workdir, str_arg(&args, "path")?);
        let data = tokio::fs::read(&path).await.map_err(|e| {
            ToolError::ExecutionFailed {
                tool_name: "read_file".into(),
                reason: format!("{}: {e}", path.display()),
            }
        })?;
        let text = String::from_utf8_lossy(&data);
        if text.len() > MAX_READ_BYTES {
            let mut end = MAX_READ_BYTES;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            Ok(format!("{}\n[...truncated, file too large]", &text[..end]))
        } else {
            Ok(text.into_owned())
        }
    }
}

/// Create or overwrite a file.
pub struct WriteFileTool {
    workdir: PathBuf,
}

impl WriteFileTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file with content"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to write" },
                "content": { "type": "string", "description": "Content to write" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = resolve(&self.workdir, str_arg(&args, "path")?);
        let content = str_arg(&args, "content")?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool_name: "write_file".into(),
                    reason: e.to_string(),
                })?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "write_file".into(),
                reason: format!("{}: {e}", path.display()),
            })?;
        Ok(format!(
            "Written {} bytes to {}",
            content.len(),
            str_arg(&args, "path")?
        ))
    }
}

/// Replace exact string occurrences in a file.
pub struct EditFileTool {
    workdir: PathBuf,
}

impl EditFileTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace exact string occurrences in a file"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to edit" },
                "old_string": { "type": "string", "description": "Exact string to find" },
                "new_string": { "type": "string", "description": "Replacement string" }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let rel = str_arg(&args, "path")?;
        let old = str_arg(&args, "old_string")?;
        let new = str_arg(&args, "new_string")?;
        let path = resolve(&self.workdir, rel);

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ToolError::ExecutionFailed {
                tool_name: "edit_file".into(),
                reason: format!("{}: {e}", path.display()),
            }
        })?;

        let count = content.matches(old).count();
        if count == 0 {
            return Err(ToolError::ExecutionFailed {
                tool_name: "edit_file".into(),
                reason: format!("old_string not found in {rel}"),
            });
        }

        let updated = content.replace(old, new);
        tokio::fs::write(&path, updated)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "edit_file".into(),
                reason: e.to_string(),
            })?;
        Ok(format!("Replaced {count} occurrence(s) in {rel}"))
    }
}

/// List a directory's entries.
pub struct ListDirTool {
    workdir: PathBuf,
}

impl ListDirTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List files and directories at a path"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: workspace root)" }
            }
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let rel = args["path"].as_str().unwrap_or(".");
        let path = resolve(&self.workdir, rel);
        let mut reader =
            tokio::fs::read_dir(&path)
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool_name: "list_dir".into(),
                    reason: format!("{}: {e}", path.display()),
                })?;

        let mut lines = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "list_dir".into(),
                reason: e.to_string(),
            })?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            lines.push(if is_dir { format!("{name}/") } else { name });
        }
        lines.sort();
        Ok(lines.join("\n"))
    }
}
