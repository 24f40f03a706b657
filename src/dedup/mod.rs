//! Per-dataset dedup cache: content digest → canonical document path.
//!
//! The [`DedupStore`] trait is the only resource concurrent file tasks
//! mutate. Backends must make [`register`](DedupStore::register) an atomic
//! check-then-insert so the first writer of a digest wins.
//!
//! | Backend | Scope |
//! |---------|-------|
//! | [`memory::MemoryDedupStore`] | single process, `Mutex<HashMap>` |
//! | [`fs::FsDedupStore`] | many processes, `<output_root>/.hash/<dataset>/<digest>` |

pub mod fs;
pub mod memory;

use async_trait::async_trait;

use crate::error::{FoldError, Result};
use crate::models::{ContentDigest, DedupRecord};

/// Storage backend for dedup records.
///
/// Records are write-once per digest per dataset. Datasets are fully
/// independent namespaces.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Canonical path registered for `digest`, if any.
    async fn lookup(&self, dataset: &str, digest: &ContentDigest) -> Result<Option<String>>;

    /// Record `path` as canonical for `digest`.
    ///
    /// Re-registering the identical pair succeeds. A different path for an
    /// already registered digest fails with [`FoldError::DuplicateDigest`].
    async fn register(&self, dataset: &str, digest: &ContentDigest, path: &str) -> Result<()>;

    /// Drop every record of `dataset`.
    async fn reset(&self, dataset: &str) -> Result<()>;

    /// All records of `dataset`, in no particular order.
    async fn records(&self, dataset: &str) -> Result<Vec<DedupRecord>>;
}

/// Outcome of [`claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the canonical copy and must convert inline.
    Canonical,
    /// Identical content was already claimed at this path.
    Duplicate(String),
}

/// Look up `digest` and register `path` when absent.
///
/// A lost registration race is resolved by a second lookup; only when that
/// lookup still finds nothing is the [`FoldError::DuplicateDigest`] surfaced.
pub async fn claim(
    store: &dyn DedupStore,
    dataset: &str,
    digest: &ContentDigest,
    path: &str,
) -> Result<Claim> {
    if let Some(existing) = store.lookup(dataset, digest).await? {
        return Ok(classify_existing(existing, path));
    }
    match store.register(dataset, digest, path).await {
        Ok(()) => Ok(Claim::Canonical),
        Err(err @ FoldError::DuplicateDigest { .. }) => {
            match store.lookup(dataset, digest).await? {
                Some(existing) => Ok(classify_existing(existing, path)),
                None => Err(err),
            }
        }
        Err(e) => Err(e),
    }
}

fn classify_existing(existing: String, path: &str) -> Claim {
    if existing == path {
        Claim::Canonical
    } else {
        Claim::Duplicate(existing)
    }
}

fn validate_dataset(dataset: &str) -> Result<()> {
    if dataset.is_empty() || dataset.contains(['/', '\\']) || dataset == "." || dataset == ".." {
        return Err(FoldError::Config(format!(
            "invalid dataset name for dedup cache: '{}'",
            dataset
        )));
    }
    Ok(())
}
