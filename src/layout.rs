//! On-disk layout of an output root.
//!
//! ```text
//! <output_root>/
//!   .hash/<dataset>/<content-digest>         dedup records
//!   .att/<dataset>/<path-hash>.<ext>         attachments
//!   .frag/<dataset>/<relpath>.<conv>         per-file fragments (intermediate)
//!   .fold/<dataset>/<folder>.doc.json        leaf-folder documents
//!   .stamp/<dataset>.json                    input fingerprint of the last run
//!   <dataset>.doc.json                       dataset documents (final)
//!   <collection>.collection.json             collection document (final)
//! ```
//!
//! Every intermediate fragment carries exactly one conversion suffix, so the
//! source file name is recovered by removing it.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::{FoldError, Result};

pub const HASH_DIR: &str = ".hash";
pub const ATTACH_DIR: &str = ".att";
pub const FRAGMENT_DIR: &str = ".frag";
pub const FOLDER_DIR: &str = ".fold";
pub const STAMP_DIR: &str = ".stamp";
pub const DOC_SUFFIX: &str = ".doc.json";
pub const COLLECTION_SUFFIX: &str = ".collection.json";

/// Conversion suffixes appended to per-file fragments.
const CONVERSION_SUFFIXES: &[(&str, &str)] = &[
    ("nii.gz", "jnii"),
    ("nii", "jnii"),
    ("snirf", "jsnirf"),
];
const DEFAULT_CONVERSION: &str = "json";

/// Suffix the converter appends to the fragment of a file with `chain`.
pub fn conversion_suffix(chain: &str) -> &'static str {
    CONVERSION_SUFFIXES
        .iter()
        .find(|(orig, _)| *orig == chain)
        .map(|(_, conv)| *conv)
        .unwrap_or(DEFAULT_CONVERSION)
}

/// Original file name of a fragment file name, if it carries a conversion
/// suffix.
pub fn source_name(fragment_name: &str) -> Option<&str> {
    let (stem, suffix) = fragment_name.rsplit_once('.')?;
    let known = suffix == DEFAULT_CONVERSION
        || CONVERSION_SUFFIXES.iter().any(|(_, conv)| *conv == suffix);
    if known && !stem.is_empty() {
        Some(stem)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_root(&self) -> PathBuf {
        self.root.join(HASH_DIR)
    }

    pub fn attach_dir(&self, dataset: &str) -> PathBuf {
        self.root.join(ATTACH_DIR).join(dataset)
    }

    pub fn fragment_dir(&self, dataset: &str) -> PathBuf {
        self.root.join(FRAGMENT_DIR).join(dataset)
    }

    /// `.frag/<dataset>/<relpath>.<conv>`
    pub fn fragment_path(&self, dataset: &str, relative_path: &str, chain: &str) -> PathBuf {
        let mut path = self.fragment_dir(dataset);
        for segment in relative_path.split('/') {
            path.push(segment);
        }
        let name = format!(
            "{}.{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            conversion_suffix(chain)
        );
        path.set_file_name(name);
        path
    }

    pub fn folder_dir(&self, dataset: &str) -> PathBuf {
        self.root.join(FOLDER_DIR).join(dataset)
    }

    /// `.fold/<dataset>/<folder>.doc.json`
    pub fn folder_doc_path(&self, dataset: &str, folder: &str) -> PathBuf {
        self.folder_dir(dataset)
            .join(format!("{}{}", folder, DOC_SUFFIX))
    }

    pub fn dataset_doc_path(&self, dataset: &str) -> PathBuf {
        self.root.join(format!("{}{}", dataset, DOC_SUFFIX))
    }

    pub fn collection_doc_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{}{}", collection, COLLECTION_SUFFIX))
    }

    pub fn stamp_path(&self, dataset: &str) -> PathBuf {
        self.root.join(STAMP_DIR).join(format!("{}.json", dataset))
    }
}

/// Write through a temp file in the target directory and rename it into
/// place, replacing any previous file. Readers never see a partial file.
pub fn write_atomic<F>(target: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut NamedTempFile) -> Result<u64>,
{
    let dir = target.parent().ok_or_else(|| {
        FoldError::Config(format!("no parent directory for {}", target.display()))
    })?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    let written = write(&mut tmp)?;
    tmp.flush()?;
    tmp.persist(target).map_err(|e| FoldError::Io(e.error))?;
    Ok(written)
}

/// Serialize `value` to `target` atomically.
pub fn write_json(target: &Path, value: &Value, pretty: bool) -> Result<()> {
    let bytes = if pretty {
        serde_json::to_vec_pretty(value)?
    } else {
        serde_json::to_vec(value)?
    };
    write_atomic(target, |out| {
        out.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    })?;
    Ok(())
}

/// Parse a JSON artifact written by [`write_json`].
pub fn read_json(path: &Path) -> Result<Value> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_paths_carry_one_conversion_suffix() {
        let layout = OutputLayout::new("/out");
        assert_eq!(
            layout.fragment_path("ds", "sub-01/anat/t1.nii.gz", "nii.gz"),
            PathBuf::from("/out/.frag/ds/sub-01/anat/t1.nii.gz.jnii")
        );
        assert_eq!(
            layout.fragment_path("ds", "sub-01/a.tsv", "tsv"),
            PathBuf::from("/out/.frag/ds/sub-01/a.tsv.json")
        );
        assert_eq!(
            layout.fragment_path("ds", "README", ""),
            PathBuf::from("/out/.frag/ds/README.json")
        );
    }

    #[test]
    fn source_name_strips_conversion_suffix() {
        assert_eq!(source_name("t1.nii.gz.jnii"), Some("t1.nii.gz"));
        assert_eq!(source_name("README.json"), Some("README"));
        assert_eq!(source_name("dataset_description.json.json"), Some("dataset_description.json"));
        assert_eq!(source_name("x.bin"), None);
        assert_eq!(source_name(".json"), None);
    }

    #[test]
    fn document_paths() {
        let layout = OutputLayout::new("/out");
        assert_eq!(layout.dataset_doc_path("ds001"), PathBuf::from("/out/ds001.doc.json"));
        assert_eq!(
            layout.folder_doc_path("ds001", "sub-01"),
            PathBuf::from("/out/.fold/ds001/sub-01.doc.json")
        );
        assert_eq!(
            layout.collection_doc_path("openneuro"),
            PathBuf::from("/out/openneuro.collection.json")
        );
        assert_eq!(layout.stamp_path("ds001"), PathBuf::from("/out/.stamp/ds001.json"));
    }

    #[test]
    fn json_artifacts_are_replaced_atomically() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a/b/doc.json");
        write_json(&path, &serde_json::json!({"k": 1}), true).unwrap();
        write_json(&path, &serde_json::json!([1, 2]), false).unwrap();
        assert_eq!(read_json(&path).unwrap(), serde_json::json!([1, 2]));
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
