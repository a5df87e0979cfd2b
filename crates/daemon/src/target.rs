//! Expansion of path arguments into individual scan targets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bulwark_core::{io_reason, Engine, Verdict};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    File(PathBuf),
    /// Found during the walk but could not be visited.
    Unreadable { path: PathBuf, reason: String },
}

impl Target {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::File(path) | Self::Unreadable { path, .. } => path,
        }
    }
}

/// A directory expands to its regular files in name order. Anything else,
/// including a missing path, is a single target whose scan reports the problem.
#[must_use]
pub fn expand(root: &Path) -> Vec<Target> {
    if !root.is_dir() {
        return vec![Target::File(root.to_path_buf())];
    }

    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) if e.file_type().is_file() => Some(Target::File(e.into_path())),
            Ok(_) => None,
            Err(e) => {
                let path = e.path().unwrap_or(root).to_path_buf();
                let reason = e.io_error().map_or_else(|| e.to_string(), io_reason);
                Some(Target::Unreadable { path, reason })
            }
        })
        .collect()
}

/// Scan one target on the blocking pool.
pub async fn evaluate(engine: Arc<Engine>, target: Target) -> (PathBuf, Verdict) {
    match target {
        Target::Unreadable { path, reason } => (path, Verdict::Error(reason)),
        Target::File(path) => {
            let scanned = path.clone();
            let verdict = tokio::task::spawn_blocking(move || engine.scan_file(&scanned))
                .await
                .unwrap_or_else(|e| Verdict::Error(format!("Scan task failed: {e}")));
            (path, verdict)
        }
    }
}
