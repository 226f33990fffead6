//! Queue processor that applies changes to project files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::Handle;

use crate::conflict::ConflictResolver;
use crate::core::{ChangeKind, ProjectId};
use crate::debug;
use crate::queue::{ChangeProcessor, QueueError, QueuedChange};
use crate::utils::path::join_within;

/// Writes queued changes inside their project root.
///
/// Runs on the blocking pool. A change carrying a base that no longer
/// matches disk goes through the conflict resolver first.
pub struct DiskWriter {
    roots: Arc<DashMap<ProjectId, PathBuf>>,
    resolver: Arc<ConflictResolver>,
    handle: Handle,
}

impl DiskWriter {
    /// Must be called from within a tokio runtime.
    pub fn new(roots: Arc<DashMap<ProjectId, PathBuf>>, resolver: Arc<ConflictResolver>) -> Self {
        Self {
            roots,
            resolver,
            handle: Handle::current(),
        }
    }

    fn target(&self, change: &QueuedChange) -> Result<PathBuf, QueueError> {
        let root = self
            .roots
            .get(&change.project_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| {
                QueueError::WriteFailed(format!("project `{}` is not registered", change.project_id))
            })?;
        join_within(&root, Path::new(&change.file_path))
            .ok_or_else(|| QueueError::InvalidPath(change.file_path.clone()))
    }

    /// Content to write, or `None` when disk already holds the answer.
    fn reconcile(&self, path: &Path, proposed: String, base: &str) -> Result<Option<String>, QueueError> {
        let disk = match fs::read_to_string(path) {
            Ok(disk) => disk,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Some(proposed)),
            Err(e) => return Err(write_failed(path, e)),
        };
        if disk == base || disk == proposed {
            return Ok(Some(proposed));
        }

        let key = path.display().to_string();
        if !self
            .resolver
            .detect_conflict(&key, &proposed, &disk, Some(base))
        {
            // Only disk moved on since the author's base: keep it.
            debug!("queue"; "{} changed on disk, edit had nothing new", key);
            return Ok(None);
        }

        let resolved = self
            .handle
            .block_on(self.resolver.resolve_conflict(&key, None))
            .map_err(|e| QueueError::Conflict(e.to_string()))?;
        Ok(Some(resolved.unwrap_or(proposed)))
    }
}

impl ChangeProcessor for DiskWriter {
    fn process(&self, change: &QueuedChange) -> Result<(), QueueError> {
        let path = self.target(change)?;

        if change.kind == ChangeKind::Delete {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(write_failed(&path, e)),
            };
        }

        let proposed = change.content.clone().unwrap_or_default();
        let content = match &change.base {
            Some(base) => self.reconcile(&path, proposed, base)?,
            None => Some(proposed),
        };
        match content {
            Some(content) => write_atomic(&path, content.as_bytes()),
            None => Ok(()),
        }
    }
}

fn write_failed(path: &Path, err: io::Error) -> QueueError {
    QueueError::WriteFailed(format!("{}: {}", path.display(), err))
}

/// Write through a sibling temp file and rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let parent = path
        .parent()
        .ok_or_else(|| QueueError::InvalidPath(path.display().to_string()))?;
    fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{name}.previewd.tmp"));

    let result = fs::File::create(&temp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&temp, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(write_failed(path, e));
    }
    Ok(())
}
