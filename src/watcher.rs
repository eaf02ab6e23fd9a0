//! Configuration file watching and hot reload.
//!
//! The watcher polls the config file's mtime once a second. When the file
//! changes it is re-parsed and re-validated; only a fully valid snapshot is
//! handed to the registered callbacks, so a broken edit leaves the running
//! configuration untouched. Polling was chosen over platform file events for
//! portability; operator edits are rare, so 1s granularity is plenty.

use crate::config::Config;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{error, info};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

type ReloadCallback = Box<dyn Fn(&Config) + Send + Sync>;

struct Inner {
    file_path: PathBuf,
    last_mod: Mutex<Option<SystemTime>>,
    callbacks: RwLock<Vec<ReloadCallback>>,
    stop_tx: watch::Sender<bool>,
}

/// Watches one configuration file and fans reloaded snapshots out to
/// callbacks. Cloning shares the same watcher.
#[derive(Clone)]
pub struct ConfigWatcher {
    inner: Arc<Inner>,
}

impl ConfigWatcher {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                file_path: file_path.into(),
                last_mod: Mutex::new(None),
                callbacks: RwLock::new(Vec::new()),
                stop_tx,
            }),
        }
    }

    /// Registers a callback invoked with every accepted snapshot.
    pub fn watch<F>(&self, callback: F)
    where
        F: Fn(&Config) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push(Box::new(callback));
    }

    /// Spawns the poll loop.
    pub fn start(&self) {
        let watcher = self.clone();
        let mut stop_rx = self.inner.stop_tx.subscribe();

        tokio::spawn(async move {
            info!(path = %watcher.inner.file_path.display(), "watching config file");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {
                        watcher.check_for_update();
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Signals the poll loop to exit.
    pub fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);
    }

    fn check_for_update(&self) {
        let modified = match std::fs::metadata(&self.inner.file_path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                error!(
                    path = %self.inner.file_path.display(),
                    error = %e,
                    "failed to stat config file"
                );
                return;
            }
        };

        let mut last_mod = self.inner.last_mod.lock();
        match *last_mod {
            // First observation only records the baseline; startup has its
            // own initial load path.
            None => {
                *last_mod = Some(modified);
                return;
            }
            Some(last) if modified <= last => return,
            Some(_) => {}
        }
        *last_mod = Some(modified);
        drop(last_mod);

        let config = match Config::load_from_file(&self.inner.file_path) {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.inner.file_path.display(),
                    error = %e,
                    "config reload rejected, keeping previous configuration"
                );
                return;
            }
        };

        info!(path = %self.inner.file_path.display(), "configuration reloaded");
        for callback in self.inner.callbacks.read().iter() {
            callback(&config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const VALID: &str = r#"
listen_addr: ":8080"
services:
  - name: svc
    balancer_type: round_robin
    servers:
      - address: "http://127.0.0.1:8081"
routes:
  - name: r
    match:
      path: /
    service: svc
health_check:
  interval: 10s
  timeout: 2s
"#;

    fn temp_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_first_observation_does_not_fire() {
        let (_dir, path) = temp_config(VALID);
        let watcher = ConfigWatcher::new(&path);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watcher.watch(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        watcher.check_for_update();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_change_fires_callback_with_new_snapshot() {
        let (_dir, path) = temp_config(VALID);
        let watcher = ConfigWatcher::new(&path);
        watcher.check_for_update();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watcher.watch(move |config: &Config| {
            sink.lock().push(config.listen_addr.clone());
        });

        let updated = VALID.replace(":8080", ":9090");
        std::fs::write(&path, updated).unwrap();
        bump_mtime(&path);

        watcher.check_for_update();
        assert_eq!(seen.lock().clone(), vec![":9090".to_string()]);
    }

    #[test]
    fn test_invalid_reload_keeps_previous_config() {
        let (_dir, path) = temp_config(VALID);
        let watcher = ConfigWatcher::new(&path);
        watcher.check_for_update();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watcher.watch(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        std::fs::write(&path, "listen_addr: \"\"\n").unwrap();
        bump_mtime(&path);

        watcher.check_for_update();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unchanged_file_does_not_fire_again() {
        let (_dir, path) = temp_config(VALID);
        let watcher = ConfigWatcher::new(&path);
        watcher.check_for_update();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watcher.watch(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        watcher.check_for_update();
        watcher.check_for_update();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    /// Filesystem mtime granularity can swallow quick successive writes, so
    /// tests force the timestamp forward explicitly.
    fn bump_mtime(path: &PathBuf) {
        let future = SystemTime::now() + Duration::from_secs(2);
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(future).unwrap();
    }
}
