//! Manifest differ: removes local files a manifest no longer lists

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::content::Manifest;

/// Outcome of one prune pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    /// Paths (relative to the pruned directory) that were deleted
    pub deleted: Vec<PathBuf>,
    /// Paths that could not be deleted or listed, with the error
    pub failed: Vec<(PathBuf, String)>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Case-insensitive, separator-agnostic form of a relative path
fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_lowercase()
}

/// Delete every file under `local_dir` that has no case-insensitive match
/// among the manifest's file names
///
/// Directories are never removed and file contents are never read. A failed
/// deletion is recorded and the pass continues.
pub async fn prune(local_dir: &Path, manifest: &Manifest) -> PruneReport {
    prune_with(local_dir, manifest, |path| fs::remove_file(path)).await
}

/// [`prune`] with the file deletion supplied by the caller
async fn prune_with<F, Fut>(local_dir: &Path, manifest: &Manifest, mut remove: F) -> PruneReport
where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let mut report = PruneReport::default();

    if !fs::try_exists(local_dir).await.unwrap_or(false) {
        debug!("Nothing to prune, '{}' does not exist", local_dir.display());
        return report;
    }

    let expected: HashSet<String> = manifest.files.iter().map(|f| normalize(&f.file_name)).collect();
    let mut pending = vec![local_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not list '{}': {}", dir.display(), e);
                report.failed.push((relative(local_dir, &dir), e.to_string()));
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Could not read entry in '{}': {}", dir.display(), e);
                    report.failed.push((relative(local_dir, &dir), e.to_string()));
                    break;
                }
            };

            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(e) => {
                    report.failed.push((relative(local_dir, &path), e.to_string()));
                    continue;
                }
            };

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }

            let relative_path = relative(local_dir, &path);
            if expected.contains(&normalize(&relative_path.to_string_lossy())) {
                continue;
            }

            info!("Deleting local file {}", relative_path.display());
            match remove(path.clone()).await {
                Ok(()) => report.deleted.push(relative_path),
                Err(e) => {
                    warn!("Failed to delete '{}': {}", path.display(), e);
                    report.failed.push((relative_path, e.to_string()));
                }
            }
        }
    }

    report.deleted.sort();
    report
}

fn relative(base: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(base).unwrap_or(path).to_path_buf()
}
