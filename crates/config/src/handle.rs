//! Shared config snapshots with reload callbacks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::{loader, Config, ConfigError};

type ReloadCallback = Box<dyn Fn(&Config) + Send + Sync>;

struct Inner {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
    callbacks: Mutex<Vec<ReloadCallback>>,
}

/// A cloneable handle to the current configuration.
///
/// `get` returns an immutable snapshot; `set`/`reload` swap in a complete
/// new snapshot and run the registered callbacks. Readers never observe a
/// partially updated config.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<Inner>,
}

impl ConfigHandle {
    pub fn new(path: impl Into<PathBuf>, cfg: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                current: RwLock::new(Arc::new(cfg)),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Load the file at `path` and wrap it in a handle.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let cfg = loader::load(&path)?;
        Ok(Self::new(path, cfg))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<Config> {
        self.inner.current.read().unwrap().clone()
    }

    /// Publish a new snapshot and notify reload callbacks.
    pub fn set(&self, cfg: Config) {
        let snapshot = Arc::new(cfg);
        *self.inner.current.write().unwrap() = snapshot.clone();
        let callbacks = self.inner.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            cb(&snapshot);
        }
    }

    /// Re-read the config file and publish it.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let cfg = loader::load(&self.inner.path)?;
        self.set(cfg);
        Ok(())
    }

    /// Register a callback invoked after every snapshot swap (e.g. MCP
    /// server teardown/startup).
    pub fn on_reload(&self, f: impl Fn(&Config) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().push(Box::new(f));
    }

    /// Spawn a task that polls the file's mtime and reloads on change.
    pub fn watch(&self) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut last_mtime = file_mtime(handle.path());
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mtime = file_mtime(handle.path());
                if mtime != last_mtime {
                    last_mtime = mtime;
                    match handle.reload() {
                        Ok(()) => info!(path = %handle.path().display(), "config reloaded"),
                        Err(e) => {
                            warn!(path = %handle.path().display(), error = %e, "config reload failed")
                        }
                    }
                }
            }
        })
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
