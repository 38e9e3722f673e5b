use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

#[derive(thiserror::Error, Debug)]
pub enum WatcherError {
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, WatcherError>;

/// A filesystem change under the watched root.
#[derive(Debug, Clone)]
pub enum ArchiveChange {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

/// Watches an archive root for changes, bridging `notify`'s
/// synchronous callback into an async channel of `ArchiveChange`s.
///
/// `notify`'s callback runs on its own OS thread, so the bridge uses a
/// blocking-task-fed std channel rather than trying to call async code
/// from inside the watcher callback.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    receiver: mpsc::UnboundedReceiver<ArchiveChange>,
}

impl FileWatcher {
    pub fn watch(root: impl AsRef<Path>) -> Result<Self> {
        let (std_tx, std_rx) = std_mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = std_tx.send(res);
        })?;
        watcher.watch(root.as_ref(), RecursiveMode::Recursive)?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for res in std_rx {
                match res {
                    Ok(event) => {
                        for change in translate(event) {
                            if tx.send(change).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "watcher error"),
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
        })
    }

    pub async fn recv(&mut self) -> Option<ArchiveChange> {
        self.receiver.recv().await
    }
}

fn translate(event: Event) -> Vec<ArchiveChange> {
    match event.kind {
        EventKind::Create(_) => event.paths.into_iter().map(ArchiveChange::Created).collect(),
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .map(ArchiveChange::Modified)
            .collect(),
        EventKind::Remove(_) => event.paths.into_iter().map(ArchiveChange::Removed).collect(),
        _ => Vec::new(),
    }
}

/// Recursively lists every regular file under `root`, following
/// symlinks but tracking visited canonicalized directories so a
/// symlink cycle can't cause an infinite walk.
pub fn walk_archive(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut visited = std::collections::HashSet::new();
    let mut out = Vec::new();
    walk_inner(root, &mut visited, &mut out)?;
    Ok(out)
}

fn walk_inner(
    dir: &Path,
    visited: &mut std::collections::HashSet<PathBuf>,
    out: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    let canonical = dir.canonicalize()?;
    if !visited.insert(canonical) {
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() || (file_type.is_symlink() && path.is_dir()) {
            walk_inner(&path, visited, out)?;
        } else if file_type.is_file() || (file_type.is_symlink() && path.is_file()) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_archive_finds_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/f.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"x").unwrap();

        let mut found = walk_archive(dir.path()).unwrap();
        found.sort();
        assert_eq!(found.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn walk_archive_follows_symlinks_without_looping() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/f.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("a/loop")).unwrap();

        let found = walk_archive(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
    }
}
