//! Tells the host when the open file changes on disk.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use flume::{Receiver, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

/// Watches the parent directory so that editors replacing the file by rename
/// are still noticed. Dropping the watcher stops it.
pub struct FileWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    pub fn new(path: &Path) -> Result<(Self, Receiver<FileEvent>)> {
        let path = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let directory = path
            .parent()
            .ok_or_else(|| anyhow!("{:?} has no parent directory", path))?
            .to_path_buf();
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("{:?} has no file name", path))?
            .to_os_string();

        let (tx, rx) = flume::unbounded();
        let target = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => forward(&event, &file_name, &target, &tx),
            Err(err) => warn!(error = %err, "file watch error"),
        })
        .context("failed to create file watcher")?;
        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {:?}", directory))?;
        debug!(path = %path.display(), "watching for changes");

        Ok((
            Self {
                path,
                _watcher: watcher,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn forward(event: &Event, file_name: &OsString, target: &Path, tx: &Sender<FileEvent>) {
    let touches_target = event
        .paths
        .iter()
        .any(|path| path.file_name() == Some(file_name.as_os_str()));
    if !touches_target {
        return;
    }
    let message = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => FileEvent::Changed(target.to_path_buf()),
        EventKind::Remove(_) => FileEvent::Removed(target.to_path_buf()),
        _ => return,
    };
    let _ = tx.send(message);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tempfile::tempdir;

    #[test]
    fn rewriting_the_file_is_reported() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("watched.pdf");
        let sibling = dir.path().join("other.pdf");
        std::fs::write(&file_path, b"first").unwrap();

        let (watcher, events) = FileWatcher::new(&file_path).unwrap();
        std::fs::write(&sibling, b"unrelated").unwrap();
        std::fs::write(&file_path, b"second").unwrap();

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, FileEvent::Changed(watcher.path().to_path_buf()));
    }
}
