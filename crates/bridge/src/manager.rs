//! Bridge process lifecycle.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::manifest::{parse_env_file, Manifest};

/// Setup commands get this long before they are abandoned.
const SETUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub path: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

struct ProcEntry {
    child: Child,
    started_at: DateTime<Utc>,
}

/// Starts and stops bridge child processes.
pub struct BridgeManager {
    gateway: Mutex<(String, String)>, // (ws url, auth token)
    procs: Mutex<HashMap<String, ProcEntry>>,
}

impl BridgeManager {
    pub fn new(ws_url: &str, token: &str) -> Self {
        Self {
            gateway: Mutex::new((ws_url.to_string(), token.to_string())),
            procs: Mutex::new(HashMap::new()),
        }
    }

    /// Update the connection info handed to newly started bridges.
    pub fn set_gateway(&self, ws_url: &str, token: &str) {
        *self.gateway.lock().unwrap() = (ws_url.to_string(), token.to_string());
    }

    /// Start one bridge: run its setup commands, then spawn the
    /// long-running process. Returns whether the bridge is running.
    pub async fn start(
        &self,
        bridge_dir: &Path,
        id: &str,
        enabled: bool,
        extra_env: &HashMap<String, String>,
    ) -> bool {
        if !enabled {
            return false;
        }
        let manifest = match Manifest::load(bridge_dir) {
            Ok(m) => m,
            Err(e) => {
                warn!(id = %id, dir = %bridge_dir.display(), error = %e, "bridge manifest load failed");
                return false;
            }
        };
        if manifest.id != id {
            warn!(
                config_id = %id,
                manifest_id = %manifest.id,
                "bridge not started: config id must equal manifest id"
            );
            return false;
        }

        let Some((setup, run_argv)) = manifest.split_commands() else {
            warn!(id = %id, "bridge has no runnable command");
            return false;
        };

        let workdir = bridge_dir.join(&manifest.cwd);
        let env = self.build_env(&manifest, &workdir, extra_env);

        for (step, argv) in setup.iter().enumerate() {
            if argv.is_empty() {
                continue;
            }
            let mut cmd = build_command(&manifest, &workdir, &env, argv);
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            let status = tokio::time::timeout(SETUP_TIMEOUT, async {
                cmd.status().await
            })
            .await;
            match status {
                Ok(Ok(status)) if status.success() => {
                    info!(id = %id, step = step + 1, ?argv, "bridge setup done");
                }
                Ok(Ok(status)) => {
                    warn!(id = %id, step = step + 1, ?argv, %status, "bridge setup command failed");
                    return false;
                }
                Ok(Err(e)) => {
                    warn!(id = %id, step = step + 1, error = %e, "bridge setup command failed");
                    return false;
                }
                Err(_) => {
                    warn!(id = %id, step = step + 1, "bridge setup command timed out");
                    return false;
                }
            }
        }

        // Replace any previous instance of this bridge.
        self.stop(id);

        let mut cmd = build_command(&manifest, &workdir, &env, run_argv);
        cmd.stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(id = %id, error = %e, "bridge start failed");
                return false;
            }
        };

        info!(id = %id, pid = child.id().unwrap_or(0), "bridge started");
        self.procs.lock().unwrap().insert(
            id.to_string(),
            ProcEntry {
                child,
                started_at: Utc::now(),
            },
        );
        true
    }

    /// Kill one bridge if running.
    pub fn stop(&self, id: &str) {
        if let Some(mut entry) = self.procs.lock().unwrap().remove(id) {
            if let Err(e) = entry.child.start_kill() {
                warn!(id = %id, error = %e, "bridge kill failed");
            }
            info!(id = %id, "bridge stopped");
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.procs.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut procs = self.procs.lock().unwrap();
        // Reap exited children while we are here.
        procs.retain(|_, entry| matches!(entry.child.try_wait(), Ok(None)));
        let mut ids: Vec<String> = procs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Status for every configured instance.
    pub fn list(&self, instances: &[(String, bool, String)]) -> Vec<InstanceStatus> {
        let running = self.running_ids();
        let procs = self.procs.lock().unwrap();

        instances
            .iter()
            .map(|(id, enabled, path)| {
                let entry = running
                    .contains(id)
                    .then(|| procs.get(id))
                    .flatten();
                let name = Manifest::load(Path::new(path))
                    .map(|m| m.name)
                    .unwrap_or_else(|_| id.clone());
                InstanceStatus {
                    id: id.clone(),
                    name,
                    enabled: *enabled,
                    path: path.clone(),
                    running: entry.is_some(),
                    pid: entry.and_then(|e| e.child.id()),
                    started_at: entry.map(|e| e.started_at),
                }
            })
            .collect()
    }

    fn build_env(
        &self,
        manifest: &Manifest,
        workdir: &Path,
        extra: &HashMap<String, String>,
    ) -> Vec<(String, String)> {
        let (ws_url, token) = self.gateway.lock().unwrap().clone();
        let mut env: Vec<(String, String)> = std::env::vars().collect();
        upsert(&mut env, "AIDO_WS_URL", &ws_url);
        upsert(&mut env, "AIDO_TOKEN", &token);
        for (k, v) in extra {
            upsert(&mut env, k, v);
        }
        if !manifest.env_file.is_empty() {
            if let Ok(data) = std::fs::read_to_string(workdir.join(&manifest.env_file)) {
                for (k, v) in parse_env_file(&data) {
                    upsert(&mut env, &k, &v);
                }
            }
        }
        env
    }
}

fn upsert(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    match env.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = value.to_string(),
        None => env.push((key.to_string(), value.to_string())),
    }
}

/// Translate a manifest argv into a command for its runtime.
fn build_command(
    manifest: &Manifest,
    workdir: &Path,
    env: &[(String, String)],
    argv: &[String],
) -> Command {
    let (program, args) = match manifest.runtime.as_str() {
        "python" => ("python".to_string(), argv.to_vec()),
        // node, npx, exec, and anything else: argv[0] is the program.
        _ => (argv[0].clone(), argv[1..].to_vec()),
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir).env_clear();
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd
}
