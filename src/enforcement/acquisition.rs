use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::ChannelOutcome;
use crate::platform;

/// Extensions of files treated as installers or installer archives
pub const INSTALLER_EXTENSIONS: &[&str] = &["exe", "msi", "dmg", "pkg", "zip", "rar"];

/// Filesystem operations needed by acquisition blocking
pub trait FileSystem: Send + Sync {
    /// Regular files directly inside `dir` (non-recursive)
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    fn is_dir(&self, path: &Path) -> bool;
}

#[derive(Debug, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

        let mut files = Vec::new();
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete file: {}", path.display()))
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

/// Well-known download-adjacent directories plus configured extras
///
/// Candidates may not exist; [`existing_download_dirs`] filters them.
pub fn download_dir_candidates(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    let home = platform::home_dir();
    for name in ["Downloads", "downloads", "Desktop", "desktop"] {
        candidates.push(home.join(name));
    }
    if cfg!(target_os = "windows") {
        candidates.push(home.join("Documents").join("Downloads"));
    }

    if let Some(user_dirs) = directories::UserDirs::new() {
        candidates.extend(user_dirs.download_dir().map(Path::to_path_buf));
        candidates.extend(user_dirs.desktop_dir().map(Path::to_path_buf));
    }

    candidates.extend(extra.iter().cloned());
    candidates
}

/// Existing candidate directories, deduplicated and sorted
pub fn existing_download_dirs(fs: &dyn FileSystem, candidates: &[PathBuf]) -> Vec<PathBuf> {
    candidates
        .iter()
        .filter(|dir| fs.is_dir(dir))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn is_installer(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| INSTALLER_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Delete installer files whose name contains a prohibited-software token
pub fn block_acquisition(
    fs: &dyn FileSystem,
    dirs: &[PathBuf],
    tokens: &BTreeSet<String>,
) -> ChannelOutcome {
    let mut outcome = ChannelOutcome::default();
    if tokens.is_empty() {
        return outcome;
    }
    if dirs.is_empty() {
        info!("No download directories found for acquisition blocking");
        return outcome;
    }

    let mut checked = 0usize;
    // Case-insensitive filesystems can list one file under two spellings of a directory
    let mut seen = HashSet::new();

    for dir in dirs {
        let files = match fs.list_files(dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("Error scanning download directory {}: {:#}", dir.display(), e);
                continue;
            }
        };

        for path in files {
            if !is_installer(&path) {
                continue;
            }
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
                continue;
            };
            checked += 1;

            if !tokens.iter().any(|token| file_name.contains(token.as_str())) {
                continue;
            }
            if !seen.insert(path.to_string_lossy().to_lowercase()) {
                continue;
            }

            outcome.matched += 1;
            match fs.remove_file(&path) {
                Ok(()) => {
                    outcome.applied += 1;
                    info!("Deleted prohibited installer: {}", path.display());
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!("Could not delete installer {}: {:#}", path.display(), e);
                }
            }
        }
    }

    if outcome.applied > 0 {
        info!(
            "Acquisition blocking: removed {} installer file(s) (checked {})",
            outcome.applied, checked
        );
    } else {
        debug!("Acquisition blocking: no matching installer files (checked {})", checked);
    }

    outcome
}
