//! Config file I/O: YAML parsing with environment expansion, atomic writes.

use std::path::Path;

use thiserror::Error;

use crate::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Load and parse the config file. `${VAR}` references are replaced with
/// the environment value when set, and left verbatim otherwise.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let expanded = expand_env_vars(&raw);
    let mut cfg: Config = serde_yaml::from_str(&expanded)?;
    resolve_relative_paths(&mut cfg, path.parent().unwrap_or(Path::new(".")));
    Ok(cfg)
}

/// Serialize `cfg` to YAML and atomically replace the file at `path`.
pub fn write(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let data = serde_yaml::to_string(cfg)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Replace `${VAR}` with the value of the environment variable `VAR`.
/// Unset variables are left untouched so the placeholder stays visible.
pub fn expand_env_vars(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                match std::env::var(var) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(var);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Workspace and skills paths in the file may be relative; anchor them to
/// the config file's directory.
fn resolve_relative_paths(cfg: &mut Config, base: &Path) {
    for agent in cfg.agents.values_mut() {
        if !agent.workspace.is_empty() && !Path::new(&agent.workspace).is_absolute() {
            agent.workspace = base.join(&agent.workspace).to_string_lossy().into_owned();
        }
        for dir in &mut agent.skills.dirs {
            if !Path::new(dir.as_str()).is_absolute() {
                *dir = base.join(dir.as_str()).to_string_lossy().into_owned();
            }
        }
    }
}

/// The Aido home directory: `$AIDO_HOME`, else `~/.aido`.
pub fn resolve_home() -> std::path::PathBuf {
    if let Ok(home) = std::env::var("AIDO_HOME") {
        if !home.is_empty() {
            return home.into();
        }
    }
    match std::env::var("HOME") {
        Ok(user_home) if !user_home.is_empty() => Path::new(&user_home).join(".aido"),
        _ => ".aido".into(),
    }
}

/// Where the config file lives by default.
pub fn default_config_path() -> std::path::PathBuf {
    resolve_home().join("config.yaml")
}

/// Generate a random 64-hex-char token for gateway auth.
pub fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn expand_known_var() {
        std::env::set_var("AIDO_TEST_TOKEN", "tok123");
        let out = expand_env_vars("token: ${AIDO_TEST_TOKEN}");
        assert_eq!(out, "token: tok123");
    }

    #[test]
    fn unknown_var_left_verbatim() {
        let out = expand_env_vars("token: ${AIDO_DEFINITELY_UNSET_VAR}");
        assert_eq!(out, "token: ${AIDO_DEFINITELY_UNSET_VAR}");
    }

    #[test]
    fn unterminated_placeholder() {
        let out = expand_env_vars("broken ${OOPS");
        assert_eq!(out, "broken ${OOPS");
    }

    #[test]
    fn load_resolves_relative_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "agents:\n  default:\n    model: anthropic/claude-sonnet-4-20250514\n    workspace: workspace"
        )
        .unwrap();

        let cfg = load(&path).unwrap();
        let ws = &cfg.agents["default"].workspace;
        assert!(Path::new(ws).is_absolute(), "workspace not resolved: {ws}");
        assert!(ws.ends_with("workspace"));
    }

    #[test]
    fn write_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut cfg = Config::default();
        cfg.gateway.port = 12345;
        cfg.gateway.auth.token = "secret".into();

        write(&path, &cfg).unwrap();
        let back = load(&path).unwrap();
        assert_eq!(back.gateway.port, 12345);
        assert_eq!(back.gateway.auth.token, "secret");
        // Temp file from the atomic write must be gone.
        assert!(!path.with_extension("yaml.tmp").exists());
    }

    #[test]
    fn generated_token_is_64_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }
}
