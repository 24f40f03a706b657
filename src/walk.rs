//! Two-phase walk of a dataset tree.
//!
//! Phase one enumerates every file into a flat, sorted worklist before any
//! conversion is scheduled. Phase two groups that worklist into a
//! [`MergePlan`]: each leaf folder depends on its files, the dataset on its
//! leaf folders and top-level files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::models::{extension_chain, SourceFile};

/// Version-control and annex bookkeeping never belongs to a document.
const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/.git", "**/.datalad/**", "**/.DS_Store"];

pub fn build_excludes(extra: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in DEFAULT_EXCLUDES.iter().copied().chain(extra.iter().map(String::as_str)) {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

/// Enumerate regular files and symbolic links under `root`, sorted by
/// relative path. Links are recorded, never traversed. Files that are
/// listed but cannot be inspected are kept as [`unreadable_entry`]s.
pub fn enumerate(root: &Path, excludes: &GlobSet) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        bail!("dataset root does not exist: {}", root.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                match e.path() {
                    Some(path) if e.loop_ancestor().is_none() && !path.is_dir() => {
                        let rel = relative_path(root, path);
                        if !excludes.is_match(&rel) {
                            debug!(path = %path.display(), error = %e, "entry cannot be inspected");
                            files.push(unreadable_entry(path, rel, &e.to_string()));
                        }
                    }
                    _ => warn!(root = %root.display(), error = %e, "skipping unreadable directory"),
                }
                continue;
            }
        };
        let file_type = entry.file_type();
        if !(file_type.is_file() || file_type.is_symlink()) {
            continue;
        }
        let rel = relative_path(root, entry.path());
        if excludes.is_match(&rel) {
            continue;
        }
        match source_file(entry.path(), rel.clone()) {
            Ok(file) => files.push(file),
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "entry cannot be inspected");
                files.push(unreadable_entry(entry.path(), rel, &e.to_string()));
            }
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Describe the entry at `path` without following it.
pub fn source_file(path: &Path, relative_path: String) -> std::io::Result<SourceFile> {
    let meta = std::fs::symlink_metadata(path)?;
    let is_symlink = meta.file_type().is_symlink();
    let link_target = if is_symlink {
        Some(std::fs::read_link(path)?.to_string_lossy().into_owned())
    } else {
        None
    };
    let name = relative_path.rsplit('/').next().unwrap_or(&relative_path);
    Ok(SourceFile {
        extension_chain: extension_chain(name),
        abs_path: path.to_path_buf(),
        byte_size: meta.len(),
        is_symlink,
        link_target,
        modified: meta.modified().ok(),
        unreadable: None,
        relative_path,
    })
}

/// Placeholder for a listed file whose metadata could not be read.
pub fn unreadable_entry(path: &Path, relative_path: String, reason: &str) -> SourceFile {
    let name = relative_path.rsplit('/').next().unwrap_or(&relative_path);
    SourceFile {
        extension_chain: extension_chain(name),
        abs_path: path.to_path_buf(),
        byte_size: 0,
        is_symlink: false,
        link_target: None,
        modified: None,
        unreadable: Some(reason.to_string()),
        relative_path,
    }
}

/// Dataset directories directly under a collection root, sorted by name.
/// Hidden directories (output roots, caches) are skipped.
pub fn list_datasets(collection_root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut datasets = Vec::new();
    let entries = std::fs::read_dir(collection_root)
        .with_context(|| format!("cannot list collection {}", collection_root.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        datasets.push((name, entry.path()));
    }
    datasets.sort();
    Ok(datasets)
}

/// Explicit merge dependency graph of one dataset, as worklist indices.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergePlan {
    /// Leaf folder name → files beneath it.
    pub folders: BTreeMap<String, Vec<usize>>,
    /// Files directly at the dataset root.
    pub top_level: Vec<usize>,
}

impl MergePlan {
    pub fn build(worklist: &[SourceFile]) -> Self {
        let mut plan = MergePlan::default();
        for (idx, file) in worklist.iter().enumerate() {
            match file.relative_path.split_once('/') {
                Some((folder, _)) => plan.folders.entry(folder.to_string()).or_default().push(idx),
                None => plan.top_level.push(idx),
            }
        }
        plan
    }
}

/// Fingerprint of a worklist: path, size, mtime and link target of every
/// file. Any change to the tree changes the fingerprint.
pub fn fingerprint(worklist: &[SourceFile]) -> String {
    let mut hasher = Sha256::new();
    for file in worklist {
        let mtime = file
            .modified
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        hasher.update(file.relative_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.byte_size.to_le_bytes());
        hasher.update(mtime.to_le_bytes());
        hasher.update(file.link_target.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, content).unwrap();
    }

    #[test]
    fn enumerates_sorted_and_excludes_git() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "sub-02/a.tsv", "x");
        touch(tmp.path(), "sub-01/anat/t1.nii.gz", "x");
        touch(tmp.path(), "README", "x");
        touch(tmp.path(), ".git/config", "x");
        touch(tmp.path(), "sub-01/skip.log", "x");

        let excludes = build_excludes(&["**/*.log".to_string()]).unwrap();
        let files = enumerate(tmp.path(), &excludes).unwrap();
        let rels: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["README", "sub-01/anat/t1.nii.gz", "sub-02/a.tsv"]);
        assert_eq!(files[1].extension_chain, "nii.gz");
    }

    #[cfg(unix)]
    #[test]
    fn records_broken_symlinks_without_following() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub-01")).unwrap();
        std::os::unix::fs::symlink("/missing/target", tmp.path().join("sub-01/x")).unwrap();
        let files = enumerate(tmp.path(), &build_excludes(&[]).unwrap()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].is_symlink);
        assert_eq!(files[0].link_target.as_deref(), Some("/missing/target"));
    }

    #[test]
    fn unreadable_entries_keep_their_place() {
        let tmp = TempDir::new().unwrap();
        let entry = unreadable_entry(
            &tmp.path().join("sub-01/scan.tsv"),
            "sub-01/scan.tsv".to_string(),
            "Permission denied (os error 13)",
        );
        assert_eq!(entry.relative_path, "sub-01/scan.tsv");
        assert_eq!(entry.extension_chain, "tsv");
        assert_eq!(entry.byte_size, 0);
        assert!(entry.modified.is_none());
        assert_eq!(entry.unreadable.as_deref(), Some("Permission denied (os error 13)"));
    }

    #[test]
    fn plan_groups_by_top_level_folder() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "README", "x");
        touch(tmp.path(), "sub-01/a.tsv", "x");
        touch(tmp.path(), "sub-01/anat/t1.nii", "x");
        touch(tmp.path(), "sub-02/a.tsv", "x");
        let files = enumerate(tmp.path(), &build_excludes(&[]).unwrap()).unwrap();
        let plan = MergePlan::build(&files);
        assert_eq!(plan.top_level, vec![0]);
        assert_eq!(plan.folders["sub-01"], vec![1, 2]);
        assert_eq!(plan.folders["sub-02"], vec![3]);
    }

    #[test]
    fn fingerprint_tracks_changes() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "sub-01/a.tsv", "x");
        let excludes = build_excludes(&[]).unwrap();
        let before = fingerprint(&enumerate(tmp.path(), &excludes).unwrap());
        assert_eq!(before, fingerprint(&enumerate(tmp.path(), &excludes).unwrap()));
        touch(tmp.path(), "sub-01/b.tsv", "y");
        assert_ne!(before, fingerprint(&enumerate(tmp.path(), &excludes).unwrap()));
    }

    #[test]
    fn lists_dataset_directories_only() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "ds002/README", "x");
        touch(tmp.path(), "ds001/README", "x");
        touch(tmp.path(), ".out/x", "x");
        touch(tmp.path(), "notes.txt", "x");
        let names: Vec<String> = list_datasets(tmp.path())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["ds001", "ds002"]);
    }
}
