//! Map a [`SourceFile`] onto its [`Category`].
//!
//! This is the only place extension strings are inspected; everything
//! downstream dispatches on the closed `Category` enum.

use crate::models::{Category, SourceFile};

const TABULAR: &[&str] = &["tsv", "csv"];

const STRUCTURED: &[&str] = &[
    "json", "jnii", "jsnirf", "jmsh", "jdt", "jdat", "bjd", "jdb", "jbat", "bnii", "bnirs",
    "bmsh", "ubj",
];

/// Structured formats encoded as binary JSON rather than text.
pub const BINARY_JSON: &[&str] = &["bjd", "jdb", "jbat", "bnii", "bnirs", "bmsh", "ubj"];

const SCIENTIFIC: &[&str] = &[
    "nii", "nii.gz", "snirf", "nwb", "edf", "bdf", "set", "fdt", "fif", "eeg", "mef", "h5",
    "hdf5", "mat", "dcm", "mgz", "mgh", "gii", "mnc",
];

const VECTOR: &[&str] = &["bval", "bvec"];

const IMAGE_DOCUMENT: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp", "pdf", "doc", "docx", "ppt",
    "pptx", "xls", "xlsx", "odt", "ods",
];

const GENERIC_BINARY: &[&str] = &[
    "bin", "dat", "raw", "gz", "tsv.gz", "csv.gz", "zip", "tar", "tar.gz", "tgz", "bz2", "xz",
    "7z", "npy", "npz", "mp4", "avi", "mov", "wav", "mp3", "flac", "ogg", "pkl",
];

const TEXT: &[&str] = &[
    "txt", "md", "rst", "m", "py", "sh", "r", "tex", "html", "htm", "xml", "yml", "yaml",
    "toml", "cfg", "ini", "log", "vhdr", "vmrk", "cff", "bib",
];

/// Extension-less file names treated as text.
const TEXT_NAMES: &[&str] = &[
    "readme",
    "changes",
    "license",
    "licence",
    "authors",
    "citation",
    ".bidsignore",
    "copying",
];

/// Classify a file. Symbolic links and empty files take priority over
/// extensions.
pub fn classify(file: &SourceFile) -> Category {
    if file.is_symlink {
        return Category::Symlink;
    }
    if file.byte_size == 0 {
        return Category::Empty;
    }
    classify_extension(&file.extension_chain, file.file_name())
}

fn classify_extension(chain: &str, file_name: &str) -> Category {
    if chain.is_empty() {
        let lower = file_name.to_ascii_lowercase();
        return if TEXT_NAMES.contains(&lower.as_str()) {
            Category::Text
        } else {
            Category::Unrecognized
        };
    }
    let ext = chain;
    if TABULAR.contains(&ext) {
        Category::Tabular
    } else if STRUCTURED.contains(&ext) {
        Category::Structured
    } else if SCIENTIFIC.contains(&ext) {
        Category::ScientificBinary
    } else if VECTOR.contains(&ext) {
        Category::VectorNumeric
    } else if IMAGE_DOCUMENT.contains(&ext) {
        Category::ImageDocument
    } else if GENERIC_BINARY.contains(&ext) {
        Category::GenericBinary
    } else if TEXT.contains(&ext) {
        Category::Text
    } else if let Some((_, outer)) = ext.split_once('.') {
        // unknown inner format under a known wrapper, e.g. `foo.gz`
        classify_extension(outer, file_name)
    } else {
        Category::Unrecognized
    }
}

/// MIME type for inline binary payloads, when one is well known.
pub fn media_type(chain: &str) -> Option<&'static str> {
    Some(match chain {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" | "tar.gz" => "application/gzip",
        _ => return None,
    })
}
