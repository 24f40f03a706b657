//! Core data types that flow through the conversion-and-merge engine.
//!
//! A [`SourceFile`] is classified into a [`Category`], turned into a
//! [`Fragment`] and finally folded into a nested document. Documents are
//! plain `serde_json` objects; insertion order is preserved.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON key marking a reference descriptor.
pub const DATALINK_KEY: &str = "_DataLink_";
/// JSON key carrying the raw target of a symbolic link.
pub const SYMLINK_KEY: &str = "_SymLink_";
/// JSON key carrying a byte size next to a link descriptor.
pub const BYTESIZE_KEY: &str = "_ByteSize_";
/// JSON key carrying a failure or classification diagnostic.
pub const DIAGNOSTIC_KEY: &str = "_Diagnostic_";

/// A file-system entry under a dataset root. Read-only input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the dataset root, always `/`-separated.
    pub relative_path: String,
    /// Absolute location on disk.
    pub abs_path: PathBuf,
    pub byte_size: u64,
    pub is_symlink: bool,
    pub link_target: Option<String>,
    /// Lowercase extension chain, e.g. `tsv` or `nii.gz`. Empty if none.
    pub extension_chain: String,
    pub modified: Option<SystemTime>,
    /// Set when the entry was listed but could not be inspected; such
    /// entries become failure markers instead of being converted.
    pub unreadable: Option<String>,
}

/// Outer compression suffixes that keep the inner extension in the chain.
const COMPRESSION_SUFFIXES: &[&str] = &["gz", "bz2", "xz", "zst", "lz4"];

impl SourceFile {
    /// File name (last path segment).
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

}

/// Derive the lowercase extension chain of a file name.
///
/// Dotfiles without a further dot have no extension. A compression suffix
/// keeps one inner extension: `bold.nii.gz` → `nii.gz`.
pub fn extension_chain(file_name: &str) -> String {
    let lower = file_name.to_ascii_lowercase();
    let trimmed = lower.trim_start_matches('.');
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.len() < 2 {
        return String::new();
    }
    let last = parts[parts.len() - 1];
    if COMPRESSION_SUFFIXES.contains(&last) && parts.len() >= 3 {
        format!("{}.{}", parts[parts.len() - 2], last)
    } else {
        last.to_string()
    }
}

/// Hex digest of a file's logical content. Only ever used as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentDigest(pub String);

impl ContentDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `{digest → canonical_relative_path}`, scoped to one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub digest: ContentDigest,
    pub canonical_path: String,
}

/// Closed set of file categories. Produced by [`crate::classify::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Tabular,
    Structured,
    ScientificBinary,
    VectorNumeric,
    GenericBinary,
    ImageDocument,
    Text,
    Symlink,
    Empty,
    Unrecognized,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Tabular => "tabular",
            Category::Structured => "structured",
            Category::ScientificBinary => "scientific",
            Category::VectorNumeric => "vector",
            Category::GenericBinary => "binary",
            Category::ImageDocument => "image",
            Category::Text => "text",
            Category::Symlink => "symlink",
            Category::Empty => "empty",
            Category::Unrecognized => "unrecognized",
        }
    }

    /// Categories whose inline conversion goes through the dedup cache.
    pub fn deduplicates(&self) -> bool {
        matches!(
            self,
            Category::Tabular | Category::Structured | Category::Text
        )
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to content stored outside the document, or to another path
/// inside the same document (a back-reference, `$.a.b`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLink {
    pub url: String,
    pub size: Option<u64>,
    pub file: Option<String>,
    /// Sub-structure address inside a larger external blob.
    pub byte_pointer: Option<String>,
}

impl DataLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            size: None,
            file: None,
            byte_pointer: None,
        }
    }

    /// Back-reference to a key path in the dataset document:
    /// `["sub-01", "a.tsv"]` → `$.sub-01.a.tsv`.
    pub fn back_reference<S: AsRef<str>>(keys: &[S]) -> Self {
        let dotted = keys
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(".");
        Self::new(format!("$.{}", dotted))
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.byte_pointer = Some(pointer.into());
        self
    }

    /// Encoded link string: `<url>[&size=N][&file=rel][:pointer]`.
    pub fn encode(&self) -> String {
        let mut out = self.url.clone();
        if let Some(size) = self.size {
            out.push_str(&format!("&size={}", size));
        }
        if let Some(file) = &self.file {
            out.push_str(&format!("&file={}", file));
        }
        if let Some(ptr) = &self.byte_pointer {
            out.push(':');
            out.push_str(ptr);
        }
        out
    }

    pub fn to_value(&self) -> Value {
        json!({ DATALINK_KEY: self.encode() })
    }

    /// Recognize a bare `{"_DataLink_": "..."}` object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let encoded = obj.get(DATALINK_KEY)?.as_str()?;
        Some(Self::decode(encoded))
    }

    fn decode(encoded: &str) -> Self {
        if encoded.starts_with("$.") {
            return Self::new(encoded);
        }
        let mut link = Self::new(encoded);
        let mut base = encoded.to_string();
        if let Some(idx) = base.find("&file=") {
            link.file = Some(base[idx + "&file=".len()..].to_string());
            base.truncate(idx);
        }
        if let Some(idx) = base.find("&size=") {
            link.size = base[idx + "&size=".len()..].parse().ok();
            base.truncate(idx);
        }
        link.url = base;
        link
    }
}

/// The JSON-compatible value produced for one source file.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Converted content embedded in the document.
    Inline(Value),
    /// Points at the canonical in-document path of identical content.
    BackReference(DataLink),
    /// Content offloaded to an attachment or a remote URL.
    Link(DataLink),
    /// Symbolic link, recorded without being followed.
    Symlink { target: String, size: Option<u64> },
    /// Unrecognized or failed file: link to its original location.
    Opaque { link: DataLink, diagnostic: String },
}

impl Fragment {
    pub fn to_value(&self) -> Value {
        match self {
            Fragment::Inline(v) => v.clone(),
            Fragment::BackReference(link) | Fragment::Link(link) => link.to_value(),
            Fragment::Symlink { target, size } => {
                let mut obj = Map::new();
                obj.insert(SYMLINK_KEY.to_string(), Value::String(target.clone()));
                if let Some(size) = size {
                    obj.insert(BYTESIZE_KEY.to_string(), Value::from(*size));
                }
                Value::Object(obj)
            }
            Fragment::Opaque { link, diagnostic } => json!({
                DATALINK_KEY: link.encode(),
                DIAGNOSTIC_KEY: diagnostic,
            }),
        }
    }
}

/// Levels of the document hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    File,
    LeafFolder,
    Dataset,
    Collection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_chain_keeps_compressed_inner_ext() {
        assert_eq!(extension_chain("sub-01_T1w.nii.gz"), "nii.gz");
        assert_eq!(extension_chain("participants.TSV"), "tsv");
        assert_eq!(extension_chain("README"), "");
        assert_eq!(extension_chain(".bidsignore"), "");
        assert_eq!(extension_chain("archive.gz"), "gz");
    }

    #[test]
    fn back_reference_uses_dotted_path() {
        let link = DataLink::back_reference(&["sub-01", "a.tsv"]);
        assert_eq!(link.to_value(), json!({"_DataLink_": "$.sub-01.a.tsv"}));
    }

    #[test]
    fn datalink_encodes_size_and_file() {
        let link = DataLink::new("https://host/db/ds?x=1")
            .with_size(42)
            .with_file("sub-01/anat/t1.nii.gz");
        assert_eq!(
            link.encode(),
            "https://host/db/ds?x=1&size=42&file=sub-01/anat/t1.nii.gz"
        );
        let parsed = DataLink::from_value(&link.to_value()).unwrap();
        assert_eq!(parsed, link);
    }

    #[test]
    fn symlink_fragment_shape() {
        let frag = Fragment::Symlink {
            target: "/missing/target".into(),
            size: None,
        };
        assert_eq!(frag.to_value(), json!({"_SymLink_": "/missing/target"}));
    }
}
