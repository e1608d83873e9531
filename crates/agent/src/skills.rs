//! Skill discovery.
//!
//! A skill is a folder containing `SKILL.md` with a short YAML frontmatter.
//! Only the name, description, and path go into the system prompt; the LLM
//! reads the full file on demand via the read_file tool.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

/// A discovered skill descriptor.
#[derive(Debug, Clone)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    pub path: String,
}

/// Scan directories for skill folders. First occurrence of a name wins.
pub fn load_from_dirs(dirs: &[String]) -> Vec<SkillEntry> {
    let mut skills = Vec::new();
    let mut seen = HashSet::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut folders: Vec<_> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .collect();
        folders.sort_by_key(|e| e.file_name());

        for folder in folders {
            let skill_path = folder.path().join("SKILL.md");
            if !skill_path.is_file() {
                continue;
            }
            let name = folder.file_name().to_string_lossy().into_owned();
            if !seen.insert(name.clone()) {
                continue;
            }
            skills.push(SkillEntry {
                description: parse_skill_description(&skill_path),
                path: skill_path.to_string_lossy().into_owned(),
                name,
            });
        }
    }

    skills
}

/// Extract `description:` from the YAML frontmatter; fall back to the
/// first non-empty, non-heading body line (truncated to 200 chars).
fn parse_skill_description(path: &Path) -> String {
    let Ok(file) = std::fs::File::open(path) else {
        return String::new();
    };
    let reader = std::io::BufReader::new(file);
    let mut in_frontmatter = false;
    let mut frontmatter_done = false;

    for line in reader.lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();

        if trimmed == "---" && !frontmatter_done {
            if in_frontmatter {
                frontmatter_done = true;
            } else {
                in_frontmatter = true;
            }
            continue;
        }

        if in_frontmatter && !frontmatter_done {
            if let Some(desc) = trimmed.strip_prefix("description:") {
                return desc.trim().trim_matches(['"', '\'']).to_string();
            }
            continue;
        }

        if frontmatter_done || !in_frontmatter {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.len() > 200 {
                let mut end = 200;
                while !trimmed.is_char_boundary(end) {
                    end -= 1;
                }
                return format!("{}...", &trimmed[..end]);
            }
            return trimmed.to_string();
        }
    }

    String::new()
}
