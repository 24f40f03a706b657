//! Error taxonomy for the conversion-and-merge engine.
//!
//! File-level errors are contained by the aggregator: the failing file is
//! recorded as an opaque reference and its siblings keep converting.
//! Structural errors (merge conflicts, configuration gaps) abort only the
//! folder or dataset they occur in.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FoldError>;

#[derive(Debug, Error)]
pub enum FoldError {
    /// The source file could not be read (permissions, vanished file).
    #[error("cannot read {path}: {source}")]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external format adapter crashed or produced invalid output.
    #[error("format adapter failed on {path}: {reason}")]
    FormatAdapter { path: PathBuf, reason: String },

    /// A digest is already registered for a different canonical path.
    #[error("digest {digest} already registered for '{existing}', refused '{attempted}'")]
    DuplicateDigest {
        digest: String,
        existing: String,
        attempted: String,
    },

    /// Two fragments normalize to the same document key.
    #[error("merge conflict at key '{key}': '{first}' and '{second}'")]
    MergeConflict {
        key: String,
        first: String,
        second: String,
    },

    /// The file must be offloaded but neither an attachment store nor a
    /// fallback URL is configured.
    #[error("{path} is {size} bytes (threshold {threshold}) and no attachment store or fallback URL is configured")]
    OversizedWithoutFallback {
        path: String,
        size: u64,
        threshold: u64,
    },

    #[error("malformed {format} content in {path}: {reason}")]
    Malformed {
        format: &'static str,
        path: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FoldError {
    /// True for errors that only affect a single file and must not abort
    /// the surrounding folder or dataset.
    pub fn is_file_level(&self) -> bool {
        matches!(
            self,
            FoldError::UnreadableFile { .. }
                | FoldError::FormatAdapter { .. }
                | FoldError::OversizedWithoutFallback { .. }
                | FoldError::Malformed { .. }
                | FoldError::DuplicateDigest { .. }
        )
    }

    /// Short machine-friendly label written into failure markers.
    pub fn kind(&self) -> &'static str {
        match self {
            FoldError::UnreadableFile { .. } => "UnreadableFile",
            FoldError::FormatAdapter { .. } => "FormatAdapter",
            FoldError::DuplicateDigest { .. } => "DuplicateDigest",
            FoldError::MergeConflict { .. } => "MergeConflict",
            FoldError::OversizedWithoutFallback { .. } => "OversizedWithoutFallback",
            FoldError::Malformed { .. } => "Malformed",
            FoldError::Config(_) => "Config",
            FoldError::Io(_) => "Io",
            FoldError::Json(_) => "Json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_conflict_names_both_paths() {
        let err = FoldError::MergeConflict {
            key: "a.tsv".into(),
            first: "sub-01/a.tsv.json".into(),
            second: "sub-01/a.tsv".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sub-01/a.tsv.json"));
        assert!(msg.contains("'sub-01/a.tsv'"));
        assert!(!err.is_file_level());
    }

    #[test]
    fn oversized_is_file_level() {
        let err = FoldError::OversizedWithoutFallback {
            path: "big.tsv".into(),
            size: 10,
            threshold: 5,
        };
        assert!(err.is_file_level());
        assert_eq!(err.kind(), "OversizedWithoutFallback");
    }
}
