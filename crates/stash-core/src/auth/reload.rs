//! Hot-reload of the auth config file.
//!
//! Watches the *directory* containing the config file, which survives the
//! atomic-rename dance editors and configuration management tools perform.
//! Events are debounced for 100 ms; each burst triggers one load-validate-
//! swap cycle. A config that fails to load keeps the running snapshot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::AuthService;
use super::config::AuthSnapshot;

/// Debounce window for filesystem event bursts.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Spawn the config watcher task.
///
/// The task runs until `shutdown` fires. Watcher setup failures are logged
/// and the task exits — the service keeps running with its current
/// snapshot.
pub fn spawn_config_watcher(
    auth: Arc<AuthService>,
    path: PathBuf,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(watch_loop(auth, path, shutdown))
}

async fn watch_loop(auth: Arc<AuthService>, path: PathBuf, mut shutdown: watch::Receiver<bool>) {
    let Some(dir) = path.parent().map(std::path::Path::to_path_buf) else {
        error!(path = %path.display(), "auth config path has no parent directory, reload disabled");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = match notify::recommended_watcher(move |event| {
        // Deliver into the async loop; errors surface there.
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create config watcher, reload disabled");
            return;
        }
    };
    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        error!(dir = %dir.display(), error = %e, "failed to watch config directory, reload disabled");
        return;
    }

    info!(path = %path.display(), "auth config hot-reload enabled");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    None => return,
                    Some(Err(e)) => {
                        warn!(error = %e, "config watcher error");
                        continue;
                    }
                    Some(Ok(_)) => {}
                }
                // Let the burst settle, then collapse it into one reload.
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}
                reload(&auth, &path).await;
            }
            _ = shutdown.changed() => {
                info!("config watcher shutting down");
                return;
            }
        }
    }
}

async fn reload(auth: &AuthService, path: &std::path::Path) {
    let loaded = {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || AuthSnapshot::load(&path)).await
    };

    match loaded {
        Ok(Ok(snapshot)) => match auth.apply_snapshot(snapshot).await {
            Ok(affected) => {
                info!(affected = affected.len(), "auth config reloaded");
            }
            Err(e) => warn!(error = %e, "session invalidation failed after reload"),
        },
        Ok(Err(e)) => {
            // Keep the running snapshot.
            error!(error = %e, "auth config reload rejected, keeping previous snapshot");
        }
        Err(e) => error!(error = %e, "auth config reload task failed"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use stash_storage::{MemoryStore, Store};

    fn hash() -> String {
        bcrypt::hash("pw", 4).unwrap()
    }

    fn yaml(name: &str, hash: &str) -> String {
        format!("users:\n  - name: {name}\n    password: \"{hash}\"\n")
    }

    #[tokio::test]
    async fn watcher_reloads_after_file_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.yaml");
        let h = hash();
        std::fs::write(&path, yaml("alice", &h)).unwrap();

        let auth = Arc::new(AuthService::new(
            AuthSnapshot::load(&path).unwrap(),
            Arc::new(MemoryStore::new()) as Arc<dyn Store>,
            TimeDelta::days(1),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_config_watcher(Arc::clone(&auth), path.clone(), shutdown_rx);

        // Give the watcher a moment to register.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Atomic-rename style replace with a different user.
        let tmp = dir.path().join("auth.yaml.tmp");
        std::fs::write(&tmp, yaml("carol", &h)).unwrap();
        std::fs::rename(&tmp, &path).unwrap();

        // Wait for debounce + reload.
        let mut reloaded = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let snapshot = auth.snapshot().await;
            if snapshot.user("carol").is_some() {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded, "watcher did not pick up the replaced config");

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn invalid_config_keeps_running_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.yaml");
        let h = hash();
        std::fs::write(&path, yaml("alice", &h)).unwrap();

        let auth = Arc::new(AuthService::new(
            AuthSnapshot::load(&path).unwrap(),
            Arc::new(MemoryStore::new()) as Arc<dyn Store>,
            TimeDelta::days(1),
        ));

        // Break the file, then drive a reload directly.
        std::fs::write(&path, "users:\n  - name: broken\n    password: notbcrypt\n").unwrap();
        reload(&auth, &path).await;

        let snapshot = auth.snapshot().await;
        assert!(snapshot.user("alice").is_some());
        assert!(snapshot.user("broken").is_none());
    }
}
