//! In-memory [`DedupStore`] for single-process runs and tests.
//!
//! One `Mutex<HashMap>` guards all datasets, so register is trivially an
//! atomic check-then-insert.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{FoldError, Result};
use crate::models::{ContentDigest, DedupRecord};

use super::{validate_dataset, DedupStore};

type DatasetRecords = HashMap<ContentDigest, String>;

/// Dedup records held in process memory.
pub struct MemoryDedupStore {
    datasets: Mutex<HashMap<String, DatasetRecords>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self {
            datasets: Mutex::new(HashMap::new()),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, DatasetRecords>> {
        // a panicking holder cannot leave a half-written record behind
        self.datasets.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn lookup(&self, dataset: &str, digest: &ContentDigest) -> Result<Option<String>> {
        validate_dataset(dataset)?;
        Ok(self
            .guard()
            .get(dataset)
            .and_then(|records| records.get(digest))
            .cloned())
    }

    async fn register(&self, dataset: &str, digest: &ContentDigest, path: &str) -> Result<()> {
        validate_dataset(dataset)?;
        let mut datasets = self.guard();
        let records = datasets.entry(dataset.to_string()).or_default();
        match records.get(digest) {
            Some(existing) if existing == path => Ok(()),
            Some(existing) => Err(FoldError::DuplicateDigest {
                digest: digest.to_string(),
                existing: existing.clone(),
                attempted: path.to_string(),
            }),
            None => {
                records.insert(digest.clone(), path.to_string());
                Ok(())
            }
        }
    }

    async fn reset(&self, dataset: &str) -> Result<()> {
        validate_dataset(dataset)?;
        self.guard().remove(dataset);
        Ok(())
    }

    async fn records(&self, dataset: &str) -> Result<Vec<DedupRecord>> {
        validate_dataset(dataset)?;
        Ok(self
            .guard()
            .get(dataset)
            .map(|records| {
                records
                    .iter()
                    .map(|(digest, path)| DedupRecord {
                        digest: digest.clone(),
                        canonical_path: path.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_write_once() {
        let store = MemoryDedupStore::new();
        let d = ContentDigest("d1".into());
        store.register("ds", &d, "a.tsv").await.unwrap();
        store.register("ds", &d, "a.tsv").await.unwrap();
        let err = store.register("ds", &d, "b.tsv").await.unwrap_err();
        assert!(matches!(err, FoldError::DuplicateDigest { .. }));
        assert_eq!(store.lookup("ds", &d).await.unwrap().as_deref(), Some("a.tsv"));
    }

    #[tokio::test]
    async fn datasets_are_independent() {
        let store = MemoryDedupStore::new();
        let d = ContentDigest("d1".into());
        store.register("ds1", &d, "a.tsv").await.unwrap();
        store.register("ds2", &d, "b.tsv").await.unwrap();
        store.reset("ds1").await.unwrap();
        assert!(store.lookup("ds1", &d).await.unwrap().is_none());
        assert_eq!(store.records("ds2").await.unwrap().len(), 1);
    }
}
