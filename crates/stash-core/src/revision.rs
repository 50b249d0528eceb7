//! Git-backed revision store.
//!
//! Every KV write lands as a commit in a local repository: the key becomes
//! a path in the working tree, the value its content, and the format hint a
//! `format:` trailer in the commit message. The KV row remains the source
//! of truth — commit failures are reported to the caller as a warning and
//! never roll back the write, and history may lag behind a just-committed
//! write.
//!
//! A single mutex serializes access to the working tree; all git work runs
//! on the blocking pool. An optional remote mirror is pushed after each
//! commit, strictly best-effort: a divergent remote keeps its warning in
//! the log and the local history keeps its commits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use git2::{Commit, Repository, Signature};
use tracing::{info, warn};

use crate::error::RevisionError;

/// One commit touching a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionEntry {
    /// Full commit hash.
    pub commit_id: String,
    /// Commit time, epoch milliseconds.
    pub timestamp: i64,
    /// Author name (`<username>` or a masked token).
    pub author: String,
    /// The key this entry describes.
    pub key: String,
    /// Value before this commit; `None` when the commit created the key.
    pub previous_value: Option<Vec<u8>>,
    /// Value at this commit; `None` for a delete marker.
    pub current_value: Option<Vec<u8>>,
    /// Format hint recorded with the commit.
    pub format: String,
}

/// The revision store. One mutex per repository.
pub struct RevisionStore {
    repo: Arc<Mutex<Repository>>,
    workdir: PathBuf,
    remote: Option<String>,
}

impl std::fmt::Debug for RevisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionStore")
            .field("workdir", &self.workdir)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl RevisionStore {
    /// Open the repository at `path`, initializing it if absent. `remote`
    /// names an optional mirror to push after each commit.
    ///
    /// # Errors
    ///
    /// Returns [`RevisionError::Git`] if the repository cannot be opened or
    /// created.
    pub fn open(path: &Path, remote: Option<String>) -> Result<Self, RevisionError> {
        let repo = match Repository::open(path) {
            Ok(repo) => repo,
            Err(_) => Repository::init(path)?,
        };
        let workdir = repo
            .workdir()
            .ok_or_else(|| RevisionError::Git {
                reason: "bare repositories are not supported".to_owned(),
            })?
            .to_path_buf();

        info!(path = %workdir.display(), "history repository opened");
        Ok(Self {
            repo: Arc::new(Mutex::new(repo)),
            workdir,
            remote,
        })
    }

    /// Record a write. Returns the new commit id.
    ///
    /// # Errors
    ///
    /// [`RevisionError::InvalidKey`] for keys that cannot be tree paths,
    /// [`RevisionError::Git`] for repository failures.
    pub async fn commit(
        &self,
        key: &str,
        value: &[u8],
        format: &str,
        author: &str,
    ) -> Result<String, RevisionError> {
        let rel = rel_path(key)?;
        let full = self.workdir.join(&rel);
        let message = format!("set {key}\n\nformat: {format}");
        let value = value.to_vec();
        let author = author.to_owned();
        let remote = self.remote.clone();
        let repo = Arc::clone(&self.repo);

        run_blocking(move || {
            let repo = lock(&repo)?;
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RevisionError::Git {
                    reason: format!("failed to create tree path: {e}"),
                })?;
            }
            std::fs::write(&full, &value).map_err(|e| RevisionError::Git {
                reason: format!("failed to write tree file: {e}"),
            })?;

            let mut index = repo.index()?;
            index.add_path(&rel)?;
            index.write()?;

            let commit_id = write_commit(&repo, &author, &message)?;
            push_mirror(&repo, remote.as_deref());
            Ok(commit_id)
        })
        .await
    }

    /// Record a delete as a marker commit.
    ///
    /// # Errors
    ///
    /// As for [`commit`](Self::commit).
    pub async fn delete(&self, key: &str, author: &str) -> Result<String, RevisionError> {
        let rel = rel_path(key)?;
        let full = self.workdir.join(&rel);
        let message = format!("delete {key}");
        let author = author.to_owned();
        let remote = self.remote.clone();
        let repo = Arc::clone(&self.repo);

        run_blocking(move || {
            let repo = lock(&repo)?;
            match std::fs::remove_file(&full) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(RevisionError::Git {
                        reason: format!("failed to remove tree file: {e}"),
                    });
                }
            }

            let mut index = repo.index()?;
            if index.get_path(&rel, 0).is_some() {
                index.remove_path(&rel)?;
            }
            index.write()?;

            let commit_id = write_commit(&repo, &author, &message)?;
            push_mirror(&repo, remote.as_deref());
            Ok(commit_id)
        })
        .await
    }

    /// Commits touching `key`, newest first, at most `limit` entries.
    ///
    /// # Errors
    ///
    /// [`RevisionError::InvalidKey`] or [`RevisionError::Git`].
    pub async fn history(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<RevisionEntry>, RevisionError> {
        let rel = rel_path(key)?;
        let key = key.to_owned();
        let repo = Arc::clone(&self.repo);

        run_blocking(move || {
            let repo = lock(&repo)?;
            if repo.head().is_err() {
                return Ok(Vec::new());
            }

            // Default revwalk order follows parent links from HEAD: strictly
            // newest-first on this linear history, immune to the one-second
            // resolution of commit timestamps.
            let mut walk = repo.revwalk()?;
            walk.push_head()?;

            let mut entries = Vec::new();
            for oid in walk {
                let oid = oid?;
                let commit = repo.find_commit(oid)?;
                let current = value_at(&repo, &commit, &rel);
                let previous = commit
                    .parent(0)
                    .ok()
                    .and_then(|parent| value_at(&repo, &parent, &rel));

                let touched = match (&current, &previous) {
                    (None, None) => false,
                    (Some(cur), Some(prev)) => cur != prev,
                    _ => true,
                };
                if !touched {
                    continue;
                }

                entries.push(RevisionEntry {
                    commit_id: oid.to_string(),
                    timestamp: commit.time().seconds() * 1000,
                    author: commit
                        .author()
                        .name()
                        .unwrap_or("unknown")
                        .to_owned(),
                    key: key.clone(),
                    previous_value: previous,
                    current_value: current,
                    format: format_trailer(commit.message().unwrap_or_default()),
                });
                if entries.len() >= limit {
                    break;
                }
            }
            Ok(entries)
        })
        .await
    }

    /// The value and format of `key` at a given commit.
    ///
    /// # Errors
    ///
    /// [`RevisionError::NotFound`] when the commit is unknown or the key
    /// was absent at that commit.
    pub async fn get_revision(
        &self,
        key: &str,
        commit_id: &str,
    ) -> Result<(Vec<u8>, String), RevisionError> {
        let rel = rel_path(key)?;
        let key = key.to_owned();
        let commit_id = commit_id.to_owned();
        let repo = Arc::clone(&self.repo);

        run_blocking(move || {
            let repo = lock(&repo)?;
            let oid = git2::Oid::from_str(&commit_id).map_err(|_| RevisionError::NotFound {
                key: key.clone(),
            })?;
            let commit = repo
                .find_commit(oid)
                .map_err(|_| RevisionError::NotFound { key: key.clone() })?;
            let value = value_at(&repo, &commit, &rel)
                .ok_or_else(|| RevisionError::NotFound { key: key.clone() })?;
            Ok((value, format_trailer(commit.message().unwrap_or_default())))
        })
        .await
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, RevisionError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RevisionError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RevisionError::Git {
            reason: format!("blocking task failed: {e}"),
        })?
}

fn lock(repo: &Arc<Mutex<Repository>>) -> Result<std::sync::MutexGuard<'_, Repository>, RevisionError> {
    repo.lock().map_err(|_| RevisionError::Git {
        reason: "repository lock poisoned".to_owned(),
    })
}

/// Map a normalized key to a working-tree path. Traversal segments and the
/// repository's own metadata directory are refused.
fn rel_path(key: &str) -> Result<PathBuf, RevisionError> {
    let mut path = PathBuf::new();
    for (idx, segment) in key.split('/').enumerate() {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(RevisionError::InvalidKey {
                reason: format!("segment '{segment}' is not allowed"),
            });
        }
        if idx == 0 && segment == ".git" {
            return Err(RevisionError::InvalidKey {
                reason: "keys may not enter .git".to_owned(),
            });
        }
        path.push(segment);
    }
    Ok(path)
}

fn write_commit(repo: &Repository, author: &str, message: &str) -> Result<String, RevisionError> {
    let mut index = repo.index()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let signature = Signature::now(author, &format!("{author}@stash"))?;

    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&Commit<'_>> = parent.iter().collect();

    let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
    Ok(oid.to_string())
}

/// Push to the configured mirror. Strictly best-effort: divergence or an
/// unreachable remote leaves local history intact and only logs a warning.
fn push_mirror(repo: &Repository, remote_name: Option<&str>) {
    let Some(remote_name) = remote_name else {
        return;
    };
    let Ok(head) = repo.head() else { return };
    let Some(branch) = head.shorthand().map(str::to_owned) else {
        return;
    };

    match repo.find_remote(remote_name) {
        Ok(mut remote) => {
            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            if let Err(e) = remote.push(&[&refspec], None) {
                warn!(remote = remote_name, error = %e, "history push failed, local commits retained");
            }
        }
        Err(e) => {
            warn!(remote = remote_name, error = %e, "history remote not found");
        }
    }
}

fn value_at(repo: &Repository, commit: &Commit<'_>, rel: &Path) -> Option<Vec<u8>> {
    let tree = commit.tree().ok()?;
    let entry = tree.get_path(rel).ok()?;
    let object = entry.to_object(repo).ok()?;
    object.as_blob().map(|blob| blob.content().to_vec())
}

fn format_trailer(message: &str) -> String {
    message
        .lines()
        .find_map(|line| line.strip_prefix("format: "))
        .unwrap_or("text")
        .to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> RevisionStore {
        RevisionStore::open(dir.path(), None).unwrap()
    }

    #[tokio::test]
    async fn commit_and_read_back_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.commit("app/cfg", b"v1", "text", "alice").await.unwrap();
        store.commit("app/cfg", b"v2", "json", "alice").await.unwrap();

        let history = store.history("app/cfg", 10).await.unwrap();
        assert_eq!(history.len(), 2);

        // Newest first.
        assert_eq!(history[0].current_value.as_deref(), Some(b"v2".as_slice()));
        assert_eq!(history[0].previous_value.as_deref(), Some(b"v1".as_slice()));
        assert_eq!(history[0].format, "json");
        assert_eq!(history[0].author, "alice");

        assert_eq!(history[1].current_value.as_deref(), Some(b"v1".as_slice()));
        assert_eq!(history[1].previous_value, None);
        assert_eq!(history[1].format, "text");
    }

    #[tokio::test]
    async fn history_ignores_commits_for_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.commit("app/a", b"1", "text", "alice").await.unwrap();
        store.commit("app/b", b"2", "text", "alice").await.unwrap();

        let history = store.history("app/a", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].key, "app/a");
    }

    #[tokio::test]
    async fn history_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        for i in 0..5 {
            store
                .commit("k", format!("v{i}").as_bytes(), "text", "alice")
                .await
                .unwrap();
        }
        let history = store.history("k", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].current_value.as_deref(), Some(b"v4".as_slice()));
    }

    #[tokio::test]
    async fn get_revision_returns_value_at_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let first = store.commit("k", b"old", "text", "alice").await.unwrap();
        store.commit("k", b"new", "yaml", "alice").await.unwrap();

        let (value, format) = store.get_revision("k", &first).await.unwrap();
        assert_eq!(value, b"old");
        assert_eq!(format, "text");
    }

    #[tokio::test]
    async fn get_revision_unknown_commit_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.commit("k", b"v", "text", "alice").await.unwrap();

        assert!(matches!(
            store.get_revision("k", "not-a-hash").await,
            Err(RevisionError::NotFound { .. })
        ));
        assert!(matches!(
            store
                .get_revision("k", &"0".repeat(40))
                .await,
            Err(RevisionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_records_a_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.commit("k", b"v", "text", "alice").await.unwrap();
        store.delete("k", "ci-t****").await.unwrap();

        let history = store.history("k", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].current_value, None);
        assert_eq!(history[0].previous_value.as_deref(), Some(b"v".as_slice()));
        assert_eq!(history[0].author, "ci-t****");
    }

    #[tokio::test]
    async fn history_of_unknown_key_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.history("ghost", 10).await.unwrap().is_empty());

        store.commit("real", b"v", "text", "alice").await.unwrap();
        assert!(store.history("ghost", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn traversal_keys_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for bad in ["../escape", "a/../b", ".git/config", "a//b", "a/./b"] {
            assert!(
                matches!(
                    store.commit(bad, b"v", "text", "alice").await,
                    Err(RevisionError::InvalidKey { .. })
                ),
                "accepted {bad:?}"
            );
        }
        // A nested .git segment is a plain directory name, not the repo's.
        store
            .commit("vendor/.git-keep", b"v", "text", "alice")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reopening_preserves_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir);
            store.commit("k", b"v", "text", "alice").await.unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.history("k", 10).await.unwrap().len(), 1);
    }
}
