//! System prompt assembly.
//!
//! The prompt is built from sections: identity, available tools, skill
//! descriptors, workspace bootstrap files, and runtime info. Bootstrap
//! files are truncated to 20 000 chars keeping 70% head and 20% tail.

use std::fmt::Write as _;
use std::path::Path;

use aido_config::AgentConfig;
use aido_core::provider::ToolDef;

use crate::skills::SkillEntry;

const MAX_BOOTSTRAP_CHARS: usize = 20_000;

/// Bootstrap files read from the workspace root, in prompt order.
const BOOTSTRAP_FILES: &[(&str, &str)] = &[
    ("AGENTS.md", "Agent instructions"),
    ("SOUL.md", "Personality"),
    ("USER.md", "User profile"),
];

pub const SUMMARIZE_TEMPLATE_ZH: &str =
    "请总结以下对话片段，保留关键事实、决定、未完成的任务、文件路径和工具结果。请简洁。\n\n{conversation}\n\n总结：";

/// Assembles the full system prompt from its sections.
pub struct PromptBuilder<'a> {
    pub agent_id: &'a str,
    pub agent_config: &'a AgentConfig,
    pub tool_defs: &'a [ToolDef],
    pub skills: &'a [SkillEntry],
    pub workspace: &'a str,
    pub config_path: Option<String>,
}

impl PromptBuilder<'_> {
    pub fn build(&self) -> String {
        let mut out = String::new();
        self.write_identity(&mut out);
        self.write_tooling(&mut out);
        self.write_skills(&mut out);
        self.write_workspace(&mut out);
        self.write_runtime(&mut out);
        out
    }

    fn write_identity(&self, out: &mut String) {
        out.push_str("You are Aido, a personal AI agent reachable through chat.\n");
        out.push_str(
            "You act on the user's behalf: answer questions, run tools, and manage tasks.\n",
        );
        out.push_str("Be direct. Prefer doing over explaining what you would do.\n\n");
    }

    fn write_tooling(&self, out: &mut String) {
        if self.tool_defs.is_empty() {
            return;
        }
        out.push_str("## Tools\n\n");
        out.push_str("You can call these tools:\n");
        for t in self.tool_defs {
            let _ = writeln!(out, "- **{}**: {}", t.name, t.description);
        }
        out.push_str("\nCall a tool whenever it gets you facts instead of guesses.\n");
        out.push_str("Chain tools as needed; results come back as tool messages.\n\n");
    }

    fn write_skills(&self, out: &mut String) {
        if self.skills.is_empty() {
            return;
        }
        out.push_str("## Skills\n\n<available_skills>\n");
        for s in self.skills {
            let _ = writeln!(
                out,
                "  <skill>\n    <name>{}</name>\n    <description>{}</description>\n    <location>{}</location>\n  </skill>",
                s.name, s.description, s.path
            );
        }
        out.push_str("</available_skills>\n\n");
        out.push_str("When a skill is relevant, read its file with read_file before acting.\n");
        out.push_str("Work through one skill at a time.\n\n");
    }

    fn write_workspace(&self, out: &mut String) {
        if self.workspace.is_empty() {
            return;
        }
        out.push_str("## Workspace\n\n");
        let _ = writeln!(out, "Working directory: {}\n", self.workspace);

        for (file, display) in BOOTSTRAP_FILES {
            let path = Path::new(self.workspace).join(file);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let text = content.trim();
            if text.is_empty() {
                continue;
            }
            let _ = writeln!(out, "### {display}\n");
            out.push_str(&truncate_bootstrap(text, file));
            out.push_str("\n\n");
        }
    }

    fn write_runtime(&self, out: &mut String) {
        out.push_str("## Runtime\n\n");
        let _ = writeln!(out, "- Agent: {}", self.agent_id);
        let model = if self.agent_config.provider.is_empty() {
            self.agent_config.model.clone()
        } else {
            format!("{}/{}", self.agent_config.provider, self.agent_config.model)
        };
        let _ = writeln!(out, "- Model: {model}");
        let _ = writeln!(
            out,
            "- OS: {}/{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        let _ = writeln!(
            out,
            "- Time: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z")
        );
        if !self.workspace.is_empty() {
            let _ = writeln!(out, "- Workspace: {}", self.workspace);
        }
        if let Some(path) = &self.config_path {
            let _ = writeln!(out, "- Config file: {path}");
        }
        out.push('\n');
    }
}

/// Truncate a bootstrap file to 70% head + 20% tail of the budget.
fn truncate_bootstrap(content: &str, filename: &str) -> String {
    if content.len() <= MAX_BOOTSTRAP_CHARS {
        return content.to_string();
    }
    let mut head_end = MAX_BOOTSTRAP_CHARS * 7 / 10;
    while !content.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = content.len() - MAX_BOOTSTRAP_CHARS * 2 / 10;
    while !content.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n\n[... {} truncated ...]\n\n{}",
        &content[..head_end],
        filename,
        &content[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_with<'a>(
        agent_config: &'a AgentConfig,
        tool_defs: &'a [ToolDef],
        skills: &'a [SkillEntry],
        workspace: &'a str,
    ) -> PromptBuilder<'a> {
        PromptBuilder {
            agent_id: "default",
            agent_config,
            tool_defs,
            skills,
            workspace,
            config_path: None,
        }
    }

    #[test]
    fn includes_identity_and_runtime() {
        let cfg = AgentConfig::default();
        let prompt = builder_with(&cfg, &[], &[], "").build();
        assert!(prompt.contains("You are Aido"));
        assert!(prompt.contains("## Runtime"));
        assert!(prompt.contains("- Agent: default"));
        assert!(prompt.contains(&cfg.model));
    }

    #[test]
    fn lists_tools_when_present() {
        let cfg = AgentConfig::default();
        let tools = vec![ToolDef {
            name: "exec".into(),
            description: "Run a command".into(),
            parameters: serde_json::json!({}),
        }];
        let prompt = builder_with(&cfg, &tools, &[], "").build();
        assert!(prompt.contains("## Tools"));
        assert!(prompt.contains("- **exec**: Run a command"));

        let without = builder_with(&cfg, &[], &[], "").build();
        assert!(!without.contains("## Tools"));
    }

    #[test]
    fn renders_skills_block() {
        let cfg = AgentConfig::default();
        let skills = vec![SkillEntry {
            name: "deploy".into(),
            description: "Deploy the service".into(),
            path: "/ws/skills/deploy/SKILL.md".into(),
        }];
        let prompt = builder_with(&cfg, &[], &skills, "").build();
        assert!(prompt.contains("<available_skills>"));
        assert!(prompt.contains("<name>deploy</name>"));
        assert!(prompt.contains("/ws/skills/deploy/SKILL.md"));
    }

    #[test]
    fn embeds_bootstrap_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Always answer in haiku.").unwrap();
        let cfg = AgentConfig::default();
        let ws = dir.path().to_string_lossy().into_owned();
        let prompt = builder_with(&cfg, &[], &[], &ws).build();
        assert!(prompt.contains("## Workspace"));
        assert!(prompt.contains("### Agent instructions"));
        assert!(prompt.contains("Always answer in haiku."));
    }

    #[test]
    fn pinned_provider_shows_in_model_line() {
        let cfg = AgentConfig {
            provider: "groq".into(),
            model: "llama-3.3-70b".into(),
            ..Default::default()
        };
        let prompt = builder_with(&cfg, &[], &[], "").build();
        assert!(prompt.contains("- Model: groq/llama-3.3-70b"));
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let content = format!("HEAD{}TAIL", "x".repeat(30_000));
        let truncated = truncate_bootstrap(&content, "AGENTS.md");
        assert!(truncated.len() < content.len());
        assert!(truncated.starts_with("HEAD"));
        assert!(truncated.ends_with("TAIL"));
        assert!(truncated.contains("[... AGENTS.md truncated ...]"));
        // Head is 70% and tail 20% of the budget, plus the marker.
        assert!(truncated.len() <= MAX_BOOTSTRAP_CHARS + 100);
    }

    #[test]
    fn short_files_untouched() {
        assert_eq!(truncate_bootstrap("short", "X.md"), "short");
    }
}
