//! Path-to-tree merge engine.
//!
//! Folds `(relative_path, value)` pairs rooted at one base directory into a
//! single nested JSON object whose keys mirror the directory hierarchy:
//!
//! ```text
//! ds/sub-01/anat/t1.nii.gz.jnii  ─┐        {
//! ds/sub-01/a.tsv.json           ─┼──▶       "sub-01": { "anat": { "t1.nii.gz": .. },
//! ds/README                      ─┘                      "a.tsv": .. },
//!                                            "README": ..
//!                                          }
//! ```
//!
//! The first segment (the base directory) is dropped. The last segment is
//! normalized through [`COMPOUND_SUFFIXES`]. A key is never written twice:
//! a second value targeting an occupied key is a
//! [`FoldError::MergeConflict`].

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{FoldError, Result};

/// Converter-added compound suffixes and the original-format suffix they
/// normalize back to. Longest entries are matched first.
pub const COMPOUND_SUFFIXES: &[(&str, &str)] = &[
    ("nii.gz.jnii", "nii.gz"),
    ("nii.gz.bnii", "nii.gz"),
    ("snirf.jsnirf", "snirf"),
    ("snirf.bnirs", "snirf"),
    ("nii.jnii", "nii"),
    ("nii.bnii", "nii"),
    ("bval.json", "bval"),
    ("bvec.json", "bvec"),
    ("json.json", "json"),
    ("tsv.json", "tsv"),
    ("csv.json", "csv"),
];

/// Normalize a file-name key: `x.tsv.json` → `x.tsv`, `t1.nii.gz.jnii` →
/// `t1.nii.gz`. Names without a known compound suffix are returned as is.
/// Matching ignores case; the kept part keeps the case of `name`.
pub fn normalize_key(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    let mut best: Option<(&str, &str)> = None;
    for (compound, original) in COMPOUND_SUFFIXES {
        let dotted_len = compound.len() + 1;
        if lower.len() > dotted_len
            && lower.ends_with(compound)
            && lower.as_bytes()[lower.len() - dotted_len] == b'.'
            && best.map_or(true, |(c, _)| compound.len() > c.len())
        {
            best = Some((compound, original));
        }
    }
    match best {
        Some((compound, original)) => {
            let keep = name.len() - compound.len() + original.len();
            name[..keep].to_string()
        }
        None => name.to_string(),
    }
}

fn segments(path: &str) -> Vec<String> {
    path.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .map(str::to_string)
        .collect()
}

/// Key path at which the file at dataset-relative `relative_path` lands in
/// its dataset document: `sub-01/a.tsv.json` → `["sub-01", "a.tsv"]`.
pub fn document_key(relative_path: &str) -> Vec<String> {
    let mut keys = segments(relative_path);
    if let Some(last) = keys.last_mut() {
        *last = normalize_key(last);
    }
    keys
}

/// Split a `/`-separated path and drop the base directory segment.
fn key_path(relative_path: &str, normalize_last: bool) -> Result<Vec<String>> {
    let mut keys = segments(relative_path);
    if keys.len() < 2 {
        return Err(FoldError::Malformed {
            format: "merge path",
            path: relative_path.to_string(),
            reason: "needs a base directory and at least one key".to_string(),
        });
    }
    keys.remove(0);
    if normalize_last {
        if let Some(last) = keys.last_mut() {
            *last = normalize_key(last);
        }
    }
    Ok(keys)
}

/// Incrementally builds one document from path/value pairs.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    root: Map<String, Value>,
    /// Source path that produced each occupied key path (leaves and the
    /// intermediate nodes they created).
    origins: HashMap<Vec<String>, Origin>,
}

#[derive(Debug, Clone)]
enum Origin {
    Leaf(String),
    Node(String),
}

impl Origin {
    fn source(&self) -> &str {
        match self {
            Origin::Leaf(s) | Origin::Node(s) => s,
        }
    }
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file fragment at the key path derived from `relative_path`.
    pub fn insert(&mut self, relative_path: &str, value: Value) -> Result<()> {
        self.insert_keys(relative_path, key_path(relative_path, true)?, value)
    }

    /// Insert a merged folder document. Folder names are used verbatim.
    pub fn insert_folder(&mut self, relative_path: &str, value: Value) -> Result<()> {
        self.insert_keys(relative_path, key_path(relative_path, false)?, value)
    }

    fn insert_keys(&mut self, relative_path: &str, keys: Vec<String>, value: Value) -> Result<()> {
        let (last, parents) = keys.split_last().ok_or_else(|| FoldError::Malformed {
            format: "merge path",
            path: relative_path.to_string(),
            reason: "empty key path".to_string(),
        })?;

        // validate the whole path first so a conflict leaves the tree untouched
        for depth in 1..=parents.len() {
            if let Some(Origin::Leaf(first)) = self.origins.get(&keys[..depth]) {
                return Err(conflict(&keys[..depth], first, relative_path));
            }
        }
        if let Some(existing) = self.origins.get(&keys) {
            return Err(conflict(&keys, existing.source(), relative_path));
        }

        let mut node = &mut self.root;
        for (depth, segment) in parents.iter().enumerate() {
            self.origins
                .entry(keys[..=depth].to_vec())
                .or_insert_with(|| Origin::Node(relative_path.to_string()));
            let child = node
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            node = match child {
                Value::Object(map) => map,
                _ => {
                    return Err(conflict(&keys[..=depth], "<non-object>", relative_path));
                }
            };
        }
        node.insert(last.clone(), value);
        self.origins
            .insert(keys.clone(), Origin::Leaf(relative_path.to_string()));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn finish(self) -> Map<String, Value> {
        self.root
    }
}

fn conflict(keys: &[String], first: &str, second: &str) -> FoldError {
    FoldError::MergeConflict {
        key: keys.join("/"),
        first: first.to_string(),
        second: second.to_string(),
    }
}

/// Merge all pairs into one document. Fails on the first conflict.
pub fn merge_fragments<I, P>(entries: I) -> Result<Map<String, Value>>
where
    I: IntoIterator<Item = (P, Value)>,
    P: AsRef<str>,
{
    let mut builder = DocumentBuilder::new();
    for (path, value) in entries {
        builder.insert(path.as_ref(), value)?;
    }
    Ok(builder.finish())
}
