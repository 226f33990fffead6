//! Mapping raw notify events to change kinds.

use std::path::{Path, PathBuf};

use notify::EventKind;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};

use crate::core::ChangeKind;

/// Translate one notify event into `(path, kind)` pairs.
///
/// Metadata-only modifications and directory events produce nothing.
pub fn classify(event: &notify::Event) -> Vec<(PathBuf, ChangeKind)> {
    let single = |kind: ChangeKind| -> Vec<(PathBuf, ChangeKind)> {
        event.paths.iter().map(|p| (p.clone(), kind)).collect()
    };

    match event.kind {
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => Vec::new(),
        EventKind::Create(_) => single(ChangeKind::Create),
        EventKind::Remove(_) => single(ChangeKind::Delete),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => single(ChangeKind::Update),
        EventKind::Modify(ModifyKind::Name(mode)) => rename(mode, &event.paths),
        _ => Vec::new(),
    }
}

fn rename(mode: RenameMode, paths: &[PathBuf]) -> Vec<(PathBuf, ChangeKind)> {
    match mode {
        RenameMode::From => paths.iter().map(|p| (p.clone(), ChangeKind::Delete)).collect(),
        RenameMode::To => paths.iter().map(|p| (p.clone(), ChangeKind::Create)).collect(),
        RenameMode::Both => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = paths.first() {
                out.push((from.clone(), ChangeKind::Delete));
            }
            if let Some(to) = paths.get(1) {
                out.push((to.clone(), ChangeKind::Create));
            }
            out
        }
        // Backends that cannot tell the sides apart: trust the filesystem.
        RenameMode::Any | RenameMode::Other => paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    ChangeKind::Create
                } else {
                    ChangeKind::Delete
                };
                (p.clone(), kind)
            })
            .collect(),
    }
}

/// Editor temp/backup artifacts.
pub fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "swx" | "tmp")
        || name.ends_with('~')
        || name.starts_with(".#")
        || name == "4913"
}
