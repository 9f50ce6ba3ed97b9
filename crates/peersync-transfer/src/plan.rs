/// Transfer plan: the ordered list of paths the responder sends.
///
/// Directories are walked recursively. The resulting order must be stable
/// between attempts because the resume offset is a plain file count.
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::logging::{TransferEvent, TransferLogger};

/// One file on the wire: where to read it and the name the receiver sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub source: PathBuf,
    /// `/`-separated path relative to the receiver's output directory.
    pub relative: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransferPlan {
    paths: Vec<PathBuf>,
}

impl TransferPlan {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self { paths: paths.into_iter().map(Into::into).collect() }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Flatten the plan into files.
    ///
    /// A top-level file keeps its file name; files found under a directory
    /// are named `dir/sub/file`. Paths that no longer exist are skipped and
    /// logged.
    pub fn expand(&self, logger: &dyn TransferLogger, component: &'static str) -> Vec<PlanEntry> {
        let mut entries = Vec::new();
        for path in &self.paths {
            if path.is_file() {
                entries.push(PlanEntry { source: path.clone(), relative: file_name(path) });
            } else if path.is_dir() {
                expand_dir(path, &mut entries, logger, component);
            } else {
                let path = path.display().to_string();
                logger.emit(component, TransferEvent::FileSkipped { path });
            }
        }
        entries
    }
}

fn expand_dir(
    root: &Path,
    entries: &mut Vec<PlanEntry>,
    logger: &dyn TransferLogger,
    component: &'static str,
) {
    let base = file_name(root);
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(root).display().to_string();
                tracing::warn!(%path, error = %e, "cannot walk plan directory entry");
                logger.emit(component, TransferEvent::FileSkipped { path });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        // walkdir only yields paths under root
        let Ok(inner) = entry.path().strip_prefix(root) else {
            continue;
        };
        let mut relative = base.clone();
        for part in inner.components() {
            if !relative.is_empty() {
                relative.push('/');
            }
            relative.push_str(&part.as_os_str().to_string_lossy());
        }
        entries.push(PlanEntry { source: entry.into_path(), relative });
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}
