//! Attachment store for offloaded content.
//!
//! Attachments live at `<output_root>/.att/<dataset>/<path-hash>.<ext>`.
//! The name depends only on the dataset-relative path, so re-running a
//! conversion overwrites the same attachment instead of accumulating copies.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::expand_template;
use crate::error::{FoldError, Result};
use crate::hash::path_hash;
use crate::layout::{write_atomic, OutputLayout};
use crate::models::DataLink;

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    layout: OutputLayout,
    /// URL prefix template (`%DB%`, `%DS%`); `file://` paths when unset.
    url_template: Option<String>,
    database: String,
}

/// A stored attachment and the link that points at it.
#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub path: PathBuf,
    pub link: DataLink,
}

impl AttachmentStore {
    pub fn new(layout: OutputLayout, url_template: Option<String>, database: &str) -> Self {
        Self {
            layout,
            url_template,
            database: database.to_string(),
        }
    }

    /// `<path-hash>.<ext>`, or the bare hash for extension-less files.
    pub fn attachment_name(relative_path: &str, extension: &str) -> String {
        let stem = path_hash(relative_path);
        if extension.is_empty() {
            stem
        } else {
            format!("{}.{}", stem, extension)
        }
    }

    pub fn attachment_path(&self, dataset: &str, relative_path: &str, extension: &str) -> PathBuf {
        self.layout
            .attach_dir(dataset)
            .join(Self::attachment_name(relative_path, extension))
    }

    /// Copy `source` verbatim into the store.
    pub fn store_copy(
        &self,
        dataset: &str,
        relative_path: &str,
        extension: &str,
        source: &Path,
    ) -> Result<StoredAttachment> {
        let target = self.attachment_path(dataset, relative_path, extension);
        let mut input = std::fs::File::open(source).map_err(|e| FoldError::UnreadableFile {
            path: source.to_path_buf(),
            source: e,
        })?;
        let size = write_atomic(&target, |out| {
            std::io::copy(&mut input, out).map_err(FoldError::from)
        })?;
        Ok(self.stored(dataset, target, size))
    }

    /// Write adapter-produced bytes into the store.
    pub fn store_bytes(
        &self,
        dataset: &str,
        relative_path: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StoredAttachment> {
        let target = self.attachment_path(dataset, relative_path, extension);
        let size = write_atomic(&target, |out| {
            out.write_all(bytes)?;
            Ok(bytes.len() as u64)
        })?;
        Ok(self.stored(dataset, target, size))
    }

    fn stored(&self, dataset: &str, path: PathBuf, size: u64) -> StoredAttachment {
        let url = self.url_for(dataset, &path);
        StoredAttachment {
            link: DataLink::new(url).with_size(size),
            path,
        }
    }

    fn url_for(&self, dataset: &str, path: &Path) -> String {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match &self.url_template {
            Some(template) => {
                let mut prefix = expand_template(template, &self.database, dataset);
                if !prefix.ends_with('/') {
                    prefix.push('/');
                }
                format!("{}{}", prefix, name)
            }
            None => format!("file://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn names_are_stable_per_path() {
        let a = AttachmentStore::attachment_name("sub-01/anat/t1.nii.gz", "nii.gz");
        let b = AttachmentStore::attachment_name("sub-01/anat/t1.nii.gz", "nii.gz");
        let c = AttachmentStore::attachment_name("sub-02/anat/t1.nii.gz", "nii.gz");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with(".nii.gz"));
        assert_eq!(a.len(), 32 + ".nii.gz".len());
    }

    #[test]
    fn copy_overwrites_and_links_with_size() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("big.bin");
        std::fs::write(&src, vec![7u8; 300]).unwrap();

        let store = AttachmentStore::new(OutputLayout::new(tmp.path().join("out")), None, "db");
        let first = store.store_copy("ds", "sub-01/big.bin", "bin", &src).unwrap();
        std::fs::write(&src, vec![1u8; 10]).unwrap();
        let second = store.store_copy("ds", "sub-01/big.bin", "bin", &src).unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(std::fs::read(&second.path).unwrap(), vec![1u8; 10]);
        assert_eq!(second.link.size, Some(10));
        assert!(second.link.url.starts_with("file://"));
    }

    #[test]
    fn url_template_is_expanded() {
        let tmp = TempDir::new().unwrap();
        let store = AttachmentStore::new(
            OutputLayout::new(tmp.path()),
            Some("https://h/att/%DB%/%DS%".into()),
            "openneuro",
        );
        let stored = store.store_bytes("ds001", "a.nii", "bnii", b"xyz").unwrap();
        let name = AttachmentStore::attachment_name("a.nii", "bnii");
        assert_eq!(stored.link.url, format!("https://h/att/openneuro/ds001/{}", name));
        assert_eq!(stored.link.size, Some(3));
    }
}
