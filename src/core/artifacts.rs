//! Inspection of a target's output area after a run.
//!
//! These walks are blocking; callers run them on the blocking pool.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TreeScan {
    pub files: Vec<FileInfo>,
    pub total_bytes: u64,
}

impl TreeScan {
    pub fn count_with_extension(&self, extensions: &[&str]) -> u64 {
        self.files
            .iter()
            .filter(|f| has_extension(&f.path, extensions))
            .count() as u64
    }
}

/// Recursively list regular files under `root`. A missing root is an empty
/// tree. Symlinks are not followed.
pub fn scan_tree(root: &Path) -> Result<TreeScan> {
    let mut scan = TreeScan::default();
    if !root.exists() {
        return Ok(scan);
    }
    scan_recursive(root, &mut scan)?;
    Ok(scan)
}

fn scan_recursive(current: &Path, scan: &mut TreeScan) -> Result<()> {
    let entries = fs::read_dir(current)
        .with_context(|| format!("Failed to read directory {}", current.display()))?;

    for entry in entries {
        let entry = entry.context("Failed to read directory entry")?;
        let path = entry.path();

        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            scan_recursive(&path, scan)?;
        } else if metadata.is_file() {
            scan.total_bytes += metadata.len();
            scan.files.push(FileInfo {
                path,
                size: metadata.len(),
            });
        }
    }

    Ok(())
}

/// Immediate subdirectories of `root`.
pub fn subdirectories(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))? {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("example.org/css")).unwrap();
        fs::write(dir.path().join("example.org/index.html"), b"<html></html>").unwrap();
        fs::write(dir.path().join("example.org/about.HTML"), b"<p>").unwrap();
        fs::write(dir.path().join("example.org/css/site.css"), b"body{}").unwrap();

        let scan = scan_tree(dir.path()).unwrap();
        assert_eq!(scan.files.len(), 3);
        assert_eq!(scan.total_bytes, 13 + 3 + 6);
        assert_eq!(scan.count_with_extension(&["html", "htm"]), 2);
    }

    #[test]
    fn missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let scan = scan_tree(&dir.path().join("absent")).unwrap();
        assert!(scan.files.is_empty());
        assert!(subdirectories(&dir.path().join("absent")).unwrap().is_empty());
    }
}
