//! File-backed [`DedupStore`] shared by every process converting a dataset.
//!
//! Layout: `<root>/<dataset>/<content-digest>`, the file body being the
//! canonical relative path. Registration writes a temp file in the same
//! directory and links it into place without clobbering, which makes
//! check-then-insert atomic across processes.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::error::{FoldError, Result};
use crate::models::{ContentDigest, DedupRecord};

use super::{validate_dataset, DedupStore};

/// Dedup records persisted as one small file per digest.
pub struct FsDedupStore {
    root: PathBuf,
}

impl FsDedupStore {
    /// `root` is the `.hash` directory, normally `<output_root>/.hash`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dataset_dir(&self, dataset: &str) -> Result<PathBuf> {
        validate_dataset(dataset)?;
        Ok(self.root.join(dataset))
    }

    fn record_path(&self, dataset: &str, digest: &ContentDigest) -> Result<PathBuf> {
        if !digest.as_str().chars().all(|c| c.is_ascii_hexdigit()) || digest.as_str().is_empty() {
            return Err(FoldError::Config(format!("digest is not hex: '{}'", digest)));
        }
        Ok(self.dataset_dir(dataset)?.join(digest.as_str()))
    }
}

async fn read_record(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(body) => Ok(Some(body.trim_end_matches('\n').to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn persist_record(dir: &Path, target: &Path, canonical: &str) -> std::io::Result<bool> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(canonical.as_bytes())?;
    tmp.flush()?;
    match tmp.persist_noclobber(target) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

#[async_trait]
impl DedupStore for FsDedupStore {
    async fn lookup(&self, dataset: &str, digest: &ContentDigest) -> Result<Option<String>> {
        read_record(&self.record_path(dataset, digest)?).await
    }

    async fn register(&self, dataset: &str, digest: &ContentDigest, path: &str) -> Result<()> {
        let dir = self.dataset_dir(dataset)?;
        let target = self.record_path(dataset, digest)?;
        let canonical = path.to_string();
        let target_for_write = target.clone();
        let created = tokio::task::spawn_blocking(move || {
            persist_record(&dir, &target_for_write, &canonical)
        })
        .await
        .map_err(|e| FoldError::Io(std::io::Error::other(e.to_string())))??;

        if created {
            return Ok(());
        }
        match read_record(&target).await? {
            Some(existing) if existing == path => Ok(()),
            Some(existing) => Err(FoldError::DuplicateDigest {
                digest: digest.to_string(),
                existing,
                attempted: path.to_string(),
            }),
            // removed by a concurrent reset between link and read
            None => Err(FoldError::DuplicateDigest {
                digest: digest.to_string(),
                existing: String::new(),
                attempted: path.to_string(),
            }),
        }
    }

    async fn reset(&self, dataset: &str) -> Result<()> {
        let dir = self.dataset_dir(dataset)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn records(&self, dataset: &str) -> Result<Vec<DedupRecord>> {
        let dir = self.dataset_dir(dataset)?;
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // skip leftover temp files from interrupted registrations
            if !name.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }
            if let Some(canonical) = read_record(&entry.path()).await? {
                out.push(DedupRecord {
                    digest: ContentDigest(name),
                    canonical_path: canonical,
                });
            }
        }
        Ok(out)
    }
}
