//! Hierarchical aggregator: files → leaf folders → dataset → collection.
//!
//! # Per-dataset state machine
//!
//! ```text
//! NotStarted ──▶ FilesConverting ──▶ FolderMerging ──▶ DatasetMerging ──▶ Done
//!      │                                    │                  │
//!      └──── stamp matches, doc exists ─────┼──────────────────┼────────▶ Done (skipped)
//!                                           └── merge conflict ┴────────▶ Failed
//! ```
//!
//! File conversions run as tasks on a bounded worker pool shared by every
//! dataset of a run. Draining the task set is the barrier between
//! `FilesConverting` and `FolderMerging`: each leaf folder is merged only
//! after every file beneath it has produced a fragment or a failure marker.
//!
//! # Incremental runs
//!
//! | Situation | Action |
//! |-----------|--------|
//! | `force`, or no stamp from a previous run | full reset, convert everything |
//! | stamp matches and dataset doc exists | skip |
//! | output-shaping configuration changed | full reset |
//! | stamp differs | keep dedup cache, reuse fragments not older than their source |
//! | a dedup record points at a missing or changed file | full reset |

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::GlobSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::adapter::{CommandAdapter, FormatAdapter};
use crate::classify::classify;
use crate::config::Config;
use crate::dedup::fs::FsDedupStore;
use crate::dedup::{claim, DedupStore};
use crate::gateway::{failure_fragment, DatasetContext, FileReport, Gateway, Outcome};
use crate::layout::{self, read_json, write_json, OutputLayout};
use crate::merge::{merge_fragments, DocumentBuilder};
use crate::models::{ContentDigest, Level, SourceFile};
use crate::walk::{self, MergePlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    NotStarted,
    FilesConverting,
    FolderMerging,
    DatasetMerging,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub name: String,
    pub state: DatasetState,
    /// Unchanged since the last run; nothing was converted.
    pub skipped: bool,
    /// Dedup cache and intermediate artifacts were cleared first.
    pub full_reset: bool,
    pub files: Vec<FileReport>,
    pub document: Option<PathBuf>,
    pub error: Option<String>,
}

impl DatasetReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: DatasetState::NotStarted,
            skipped: false,
            full_reset: false,
            files: Vec::new(),
            document: None,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == DatasetState::Failed
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.files.iter().filter(|f| f.outcome == outcome).count()
    }

    pub fn failed_files(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| f.outcome == Outcome::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub name: String,
    pub datasets: Vec<DatasetReport>,
    pub document: Option<PathBuf>,
    pub error: Option<String>,
}

impl CollectionReport {
    pub fn failed(&self) -> impl Iterator<Item = &DatasetReport> {
        self.datasets.iter().filter(|d| d.is_failed())
    }

    pub fn skipped(&self) -> usize {
        self.datasets.iter().filter(|d| d.skipped).count()
    }

    pub fn converted(&self) -> usize {
        self.datasets
            .iter()
            .filter(|d| d.state == DatasetState::Done && !d.skipped)
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed().next().is_none()
    }
}

/// Fingerprint of the inputs of the last completed run of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stamp {
    fingerprint: String,
    /// [`Config::output_digest`] of the run; empty in stamps written
    /// before it was recorded.
    #[serde(default)]
    config: String,
    files: usize,
    completed_at: DateTime<Utc>,
}

pub struct Aggregator {
    gateway: Arc<Gateway>,
    dedup: Arc<dyn DedupStore>,
    layout: OutputLayout,
    excludes: GlobSet,
    database: Option<String>,
    config_digest: String,
    file_slots: Arc<Semaphore>,
}

impl Aggregator {
    pub fn new(
        config: &Config,
        output_root: impl Into<PathBuf>,
        dedup: Arc<dyn DedupStore>,
        adapter: Option<Arc<dyn FormatAdapter>>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = OutputLayout::new(output_root);
        let gateway = Gateway::new(config, layout.clone(), Arc::clone(&dedup), adapter);
        Ok(Self {
            gateway: Arc::new(gateway),
            dedup,
            layout,
            excludes: walk::build_excludes(&config.pipeline.exclude_globs)?,
            database: config.pipeline.database.clone(),
            config_digest: config.output_digest(),
            file_slots: Arc::new(Semaphore::new(config.pipeline.workers.max(1))),
        })
    }

    /// Aggregator with the on-disk dedup cache under `<output_root>/.hash`
    /// and the configured external adapter, if any.
    pub fn from_config(config: &Config, output_root: impl Into<PathBuf>) -> Result<Self> {
        let layout = OutputLayout::new(output_root);
        let dedup: Arc<dyn DedupStore> = Arc::new(FsDedupStore::new(layout.hash_root()));
        let adapter = CommandAdapter::from_config(&config.adapter, config.numeric.external)
            .map(|a| Arc::new(a) as Arc<dyn FormatAdapter>);
        Self::new(config, layout.root().to_path_buf(), dedup, adapter)
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    // ═══════════════════════════════════════════════════════════════════
    // Collection level
    // ═══════════════════════════════════════════════════════════════════

    /// Convert every dataset under `collection_root` (or only the named
    /// ones), then merge the finished dataset documents into the
    /// collection document. A failed dataset never stops its siblings.
    pub async fn convert_collection(
        self: &Arc<Self>,
        collection_root: &Path,
        only: &[String],
        force: bool,
    ) -> Result<CollectionReport> {
        let collection = dir_name(collection_root)?;
        let database = self.database.clone().unwrap_or_else(|| collection.clone());
        let output_root = std::fs::canonicalize(self.layout.root()).ok();

        let mut datasets = walk::list_datasets(collection_root)?;
        datasets.retain(|(name, path)| {
            let wanted = only.is_empty() || only.iter().any(|o| o == name);
            let is_output = output_root.is_some() && std::fs::canonicalize(path).ok() == output_root;
            wanted && !is_output
        });
        for name in only {
            if !datasets.iter().any(|(n, _)| n == name) {
                bail!("dataset '{}' not found under {}", name, collection_root.display());
            }
        }
        info!(collection = %collection, datasets = datasets.len(), "converting collection");

        let mut tasks: JoinSet<DatasetReport> = JoinSet::new();
        let mut pending: HashSet<String> = HashSet::new();
        for (name, path) in datasets {
            pending.insert(name.clone());
            let this = Arc::clone(self);
            let database = database.clone();
            tasks.spawn(async move { this.convert_dataset(&database, &name, &path, force).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    pending.remove(&report.name);
                    reports.push(report);
                }
                Err(e) => warn!(collection = %collection, error = %e, "dataset task panicked"),
            }
        }
        for name in pending {
            let mut report = DatasetReport::new(&name);
            report.state = DatasetState::Failed;
            report.error = Some("dataset task panicked".to_string());
            reports.push(report);
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));

        let mut report = CollectionReport {
            name: collection.clone(),
            datasets: reports,
            document: None,
            error: None,
        };
        match self.merge_collection(&collection, &report.datasets) {
            Ok(path) => report.document = Some(path),
            Err(e) => {
                warn!(collection = %collection, error = %format!("{:#}", e), "collection merge failed");
                report.error = Some(format!("{:#}", e));
            }
        }
        Ok(report)
    }

    fn merge_collection(&self, collection: &str, datasets: &[DatasetReport]) -> Result<PathBuf> {
        let mut builder = DocumentBuilder::new();
        for dataset in datasets.iter().filter(|d| d.state == DatasetState::Done) {
            let doc_path = self.layout.dataset_doc_path(&dataset.name);
            let doc = read_json(&doc_path)
                .with_context(|| format!("cannot read {}", doc_path.display()))?;
            builder.insert_folder(&format!("{}/{}", collection, dataset.name), doc)?;
        }
        let path = self.layout.collection_doc_path(collection);
        write_json(&path, &Value::Object(builder.finish()), true)?;
        info!(collection = %collection, level = ?Level::Collection, path = %path.display(), "document written");
        Ok(path)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Dataset level
    // ═══════════════════════════════════════════════════════════════════

    /// Run one dataset through the state machine. Never fails: errors are
    /// reported through the returned report's `Failed` state.
    pub async fn convert_dataset(
        &self,
        database: &str,
        name: &str,
        root: &Path,
        force: bool,
    ) -> DatasetReport {
        let mut report = DatasetReport::new(name);
        if let Err(e) = self.run_dataset(database, name, root, force, &mut report).await {
            let message = format!("{:#}", e);
            warn!(dataset = %name, state = ?report.state, error = %message, "dataset failed");
            report.state = DatasetState::Failed;
            report.error = Some(message);
        }
        report
    }

    async fn run_dataset(
        &self,
        database: &str,
        name: &str,
        root: &Path,
        force: bool,
        report: &mut DatasetReport,
    ) -> Result<()> {
        validate_name(name)?;
        let worklist = walk::enumerate(root, &self.excludes)?;
        let fingerprint = walk::fingerprint(&worklist);
        let doc_path = self.layout.dataset_doc_path(name);
        let stamp = self.read_stamp(name);

        if !force {
            if let Some(stamp) = &stamp {
                if stamp.fingerprint == fingerprint
                    && stamp.config == self.config_digest
                    && doc_path.exists()
                {
                    info!(dataset = %name, "unchanged since last run, skipping");
                    report.skipped = true;
                    report.document = Some(doc_path);
                    report.state = DatasetState::Done;
                    return Ok(());
                }
            }
        }

        let reconfigured = stamp
            .as_ref()
            .is_some_and(|s| s.config != self.config_digest);
        if reconfigured {
            info!(dataset = %name, "configuration changed since last run, full reset");
        }
        let full = force
            || stamp.is_none()
            || reconfigured
            || self.cache_is_stale(name, &worklist).await?;
        if full {
            self.reset_dataset(name).await?;
        } else {
            self.prune_fragments(name, &worklist)?;
            remove_dir_if_exists(&self.layout.folder_dir(name))?;
        }
        report.full_reset = full;

        report.state = DatasetState::FilesConverting;
        info!(dataset = %name, files = worklist.len(), full_reset = full, "converting files");
        let ctx = Arc::new(DatasetContext::new(name, database));
        let (mut values, files) = self.convert_files(&ctx, &worklist, !full).await?;
        report.files = files;

        report.state = DatasetState::FolderMerging;
        let plan = MergePlan::build(&worklist);
        let mut dataset_doc = DocumentBuilder::new();
        for (folder, indices) in &plan.folders {
            let entries = indices.iter().map(|&i| {
                (worklist[i].relative_path.as_str(), std::mem::take(&mut values[i]))
            });
            let folder_doc = Value::Object(merge_fragments(entries)?);
            write_json(&self.layout.folder_doc_path(name, folder), &folder_doc, true)?;
            debug!(
                dataset = %name,
                level = ?Level::LeafFolder,
                folder = %folder,
                files = indices.len(),
                "document written"
            );
            dataset_doc.insert_folder(&format!("{}/{}", name, folder), folder_doc)?;
        }

        report.state = DatasetState::DatasetMerging;
        for &i in &plan.top_level {
            let path = format!("{}/{}", name, worklist[i].relative_path);
            dataset_doc.insert(&path, std::mem::take(&mut values[i]))?;
        }
        write_json(&doc_path, &Value::Object(dataset_doc.finish()), true)?;
        self.write_stamp(name, &fingerprint, worklist.len())?;

        report.state = DatasetState::Done;
        report.document = Some(doc_path.clone());
        info!(
            dataset = %name,
            level = ?Level::Dataset,
            files = report.files.len(),
            failed = report.count(Outcome::Failed),
            reused = report.count(Outcome::Reused),
            path = %doc_path.display(),
            "document written"
        );
        Ok(())
    }

    /// Convert every file of the worklist. Returns fragment values and
    /// reports indexed like the worklist.
    ///
    /// Dedup-eligible files are hashed in parallel first, then claimed in
    /// worklist order, so the canonical copy of duplicated content is always
    /// the first path in sort order regardless of task scheduling.
    async fn convert_files(
        &self,
        ctx: &Arc<DatasetContext>,
        worklist: &[SourceFile],
        reuse: bool,
    ) -> Result<(Vec<Value>, Vec<FileReport>)> {
        let mut values: Vec<Option<Value>> = vec![None; worklist.len()];
        let mut reports: Vec<Option<FileReport>> = vec![None; worklist.len()];
        let mut pending = Vec::new();

        for (idx, file) in worklist.iter().enumerate() {
            if reuse {
                let fragment_path =
                    self.layout
                        .fragment_path(&ctx.dataset, &file.relative_path, &file.extension_chain);
                if let Some(value) = reusable_fragment(&fragment_path, file) {
                    values[idx] = Some(value);
                    reports[idx] = Some(FileReport {
                        relative_path: file.relative_path.clone(),
                        category: classify(file),
                        decision: None,
                        outcome: Outcome::Reused,
                        error: None,
                    });
                    continue;
                }
            }
            pending.push(idx);
        }

        let digests = self.hash_files(ctx, worklist, &pending).await?;
        for &idx in &pending {
            if let Some(digest) = &digests[idx] {
                let path = &worklist[idx].relative_path;
                if let Err(e) = claim(self.dedup.as_ref(), &ctx.dataset, digest, path).await {
                    debug!(dataset = %ctx.dataset, path = %path, error = %e, "early claim failed");
                }
            }
        }

        let mut digests = digests;
        let mut tasks: JoinSet<(usize, Value, FileReport)> = JoinSet::new();
        for &idx in &pending {
            let permit = Arc::clone(&self.file_slots).acquire_owned().await?;
            let gateway = Arc::clone(&self.gateway);
            let ctx = Arc::clone(ctx);
            let file = worklist[idx].clone();
            let digest = digests[idx].take();
            let fragment_path =
                self.layout
                    .fragment_path(&ctx.dataset, &file.relative_path, &file.extension_chain);
            tasks.spawn(async move {
                let (fragment, mut report) = gateway.convert_with_digest(&ctx, &file, digest).await;
                let value = fragment.to_value();
                if let Err(e) = write_json(&fragment_path, &value, false) {
                    warn!(dataset = %ctx.dataset, path = %file.relative_path, error = %e, "cannot write fragment");
                    report.error.get_or_insert_with(|| format!("{}: {}", e.kind(), e));
                }
                drop(permit);
                (idx, value, report)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, value, report)) => {
                    values[idx] = Some(value);
                    reports[idx] = Some(report);
                }
                Err(e) => warn!(dataset = %ctx.dataset, error = %e, "file task panicked"),
            }
        }

        // a panicked task still leaves a failure marker behind
        let mut out_values = Vec::with_capacity(worklist.len());
        let mut out_reports = Vec::with_capacity(worklist.len());
        for (idx, (value, report)) in values.into_iter().zip(reports).enumerate() {
            match (value, report) {
                (Some(v), Some(r)) => {
                    out_values.push(v);
                    out_reports.push(r);
                }
                _ => {
                    let file = &worklist[idx];
                    let diagnostic = "Panic: conversion task aborted".to_string();
                    out_values.push(failure_fragment(file, diagnostic.clone()).to_value());
                    out_reports.push(FileReport {
                        relative_path: file.relative_path.clone(),
                        category: classify(file),
                        decision: None,
                        outcome: Outcome::Failed,
                        error: Some(diagnostic),
                    });
                }
            }
        }
        Ok((out_values, out_reports))
    }

    /// Digests of the dedup-eligible files among `indices`, indexed like
    /// the worklist.
    async fn hash_files(
        &self,
        ctx: &DatasetContext,
        worklist: &[SourceFile],
        indices: &[usize],
    ) -> Result<Vec<Option<ContentDigest>>> {
        let mut digests = vec![None; worklist.len()];
        let mut tasks: JoinSet<(usize, Option<ContentDigest>)> = JoinSet::new();
        for &idx in indices {
            let permit = Arc::clone(&self.file_slots).acquire_owned().await?;
            let gateway = Arc::clone(&self.gateway);
            let file = worklist[idx].clone();
            tasks.spawn(async move {
                let digest = gateway.dedup_digest(&file).await;
                drop(permit);
                (idx, digest)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, digest)) => digests[idx] = digest,
                Err(e) => warn!(dataset = %ctx.dataset, error = %e, "hash task panicked"),
            }
        }
        Ok(digests)
    }

    /// True when a dedup record points at a file that is gone or whose
    /// fragment must be rebuilt; back-references to it would dangle.
    async fn cache_is_stale(&self, name: &str, worklist: &[SourceFile]) -> Result<bool> {
        let by_path: HashMap<&str, &SourceFile> = worklist
            .iter()
            .map(|f| (f.relative_path.as_str(), f))
            .collect();
        for record in self.dedup.records(name).await? {
            let file = match by_path.get(record.canonical_path.as_str()) {
                Some(f) => f,
                None => {
                    info!(dataset = %name, path = %record.canonical_path, "canonical file removed, full reset");
                    return Ok(true);
                }
            };
            let fragment =
                self.layout
                    .fragment_path(name, &file.relative_path, &file.extension_chain);
            if !fragment_is_fresh(&fragment, file) {
                info!(dataset = %name, path = %record.canonical_path, "canonical file changed, full reset");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove fragments whose source file no longer exists.
    fn prune_fragments(&self, name: &str, worklist: &[SourceFile]) -> Result<()> {
        let dir = self.layout.fragment_dir(name);
        if !dir.exists() {
            return Ok(());
        }
        let expected: HashSet<PathBuf> = worklist
            .iter()
            .map(|f| {
                self.layout
                    .fragment_path(name, &f.relative_path, &f.extension_chain)
            })
            .collect();
        for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && !expected.contains(entry.path()) {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Clear the dedup cache and every artifact of `name` under the output
    /// root. Source files are never touched.
    pub async fn reset_dataset(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.dedup.reset(name).await?;
        remove_dir_if_exists(&self.layout.fragment_dir(name))?;
        remove_dir_if_exists(&self.layout.folder_dir(name))?;
        remove_dir_if_exists(&self.layout.attach_dir(name))?;
        remove_file_if_exists(&self.layout.stamp_path(name))?;
        remove_file_if_exists(&self.layout.dataset_doc_path(name))?;
        info!(dataset = %name, "dataset reset");
        Ok(())
    }

    fn read_stamp(&self, name: &str) -> Option<Stamp> {
        let bytes = std::fs::read(self.layout.stamp_path(name)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write_stamp(&self, name: &str, fingerprint: &str, files: usize) -> Result<()> {
        let stamp = Stamp {
            fingerprint: fingerprint.to_string(),
            config: self.config_digest.clone(),
            files,
            completed_at: Utc::now(),
        };
        write_json(&self.layout.stamp_path(name), &serde_json::to_value(&stamp)?, true)?;
        Ok(())
    }
}

/// Merge every fragment under `dir` into one document rooted at `dir`.
///
/// Fragment names lose their conversion suffix (`a.tsv.json` → `a.tsv`,
/// `README.json` → `README`); files without one are ignored.
pub fn merge_directory(dir: &Path) -> Result<serde_json::Map<String, Value>> {
    let base = dir_name(dir)?;
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let source = match layout::source_name(&file_name) {
            Some(s) => s.to_string(),
            None => continue,
        };
        let parent = entry
            .path()
            .parent()
            .and_then(|p| p.strip_prefix(dir).ok())
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let mut segments = vec![base.clone()];
        segments.extend(parent);
        segments.push(source);
        let value = read_json(entry.path())
            .with_context(|| format!("cannot parse {}", entry.path().display()))?;
        entries.push((segments.join("/"), value));
    }
    let mut builder = DocumentBuilder::new();
    for (path, value) in entries {
        builder.insert_folder(&path, value)?;
    }
    Ok(builder.finish())
}

fn reusable_fragment(fragment: &Path, file: &SourceFile) -> Option<Value> {
    if !fragment_is_fresh(fragment, file) {
        return None;
    }
    read_json(fragment).ok()
}

/// Fragment exists and was written no earlier than the source changed.
fn fragment_is_fresh(fragment: &Path, file: &SourceFile) -> bool {
    let written = match std::fs::metadata(fragment).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(_) => return false,
    };
    let source: SystemTime = match file.modified {
        Some(t) => t,
        None => return false,
    };
    written >= source
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        bail!("invalid dataset name '{}'", name);
    }
    Ok(())
}

fn dir_name(path: &Path) -> Result<String> {
    let resolved = std::fs::canonicalize(path)
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("{} has no directory name", path.display()))
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("cannot remove {}", path.display())),
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("cannot remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::memory::MemoryDedupStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, content).unwrap();
    }

    fn aggregator(out: &Path) -> Aggregator {
        Aggregator::new(
            &Config::default(),
            out,
            Arc::new(MemoryDedupStore::new()),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dataset_goes_through_all_states() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ds001");
        write(&root, "README", "hello");
        write(&root, "sub-01/a.tsv", "x\n1\n");
        write(&root, "sub-01/anat/notes.txt", "n");
        let agg = aggregator(&tmp.path().join("out"));

        let report = agg.convert_dataset("db", "ds001", &root, false).await;
        assert_eq!(report.state, DatasetState::Done, "{:?}", report.error);
        assert!(report.full_reset);
        let doc = read_json(report.document.as_ref().unwrap()).unwrap();
        assert_eq!(
            doc,
            json!({"sub-01": {"a.tsv": {"x": [1]}, "anat": {"notes.txt": "n"}}, "README": "hello"})
        );
        let folder = read_json(&agg.layout().folder_doc_path("ds001", "sub-01")).unwrap();
        assert_eq!(folder, doc["sub-01"]);
    }

    #[tokio::test]
    async fn unchanged_dataset_is_skipped_and_force_reconverts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ds001");
        write(&root, "sub-01/a.tsv", "x\n1\n");
        let agg = aggregator(&tmp.path().join("out"));

        let first = agg.convert_dataset("db", "ds001", &root, false).await;
        assert!(!first.skipped);
        let second = agg.convert_dataset("db", "ds001", &root, false).await;
        assert!(second.skipped);
        assert_eq!(second.state, DatasetState::Done);
        let forced = agg.convert_dataset("db", "ds001", &root, true).await;
        assert!(!forced.skipped);
        assert!(forced.full_reset);
    }

    #[tokio::test]
    async fn incremental_run_reuses_unchanged_fragments() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ds001");
        write(&root, "sub-01/a.tsv", "x\n1\n");
        write(&root, "sub-02/b.txt", "b");
        let agg = aggregator(&tmp.path().join("out"));
        agg.convert_dataset("db", "ds001", &root, false).await;

        write(&root, "sub-03/c.txt", "c");
        let report = agg.convert_dataset("db", "ds001", &root, false).await;
        assert_eq!(report.state, DatasetState::Done);
        assert!(!report.full_reset);
        assert_eq!(report.count(Outcome::Reused), 2);
        let doc = read_json(report.document.as_ref().unwrap()).unwrap();
        assert_eq!(doc["sub-03"]["c.txt"], json!("c"));
        assert_eq!(doc["sub-01"]["a.tsv"], json!({"x": [1]}));
    }

    #[tokio::test]
    async fn canonical_copy_is_the_first_path_in_sort_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ds001");
        for sub in ["sub-03", "sub-01", "sub-02"] {
            write(&root, &format!("{}/a.tsv", sub), "x\n1\n");
        }
        let agg = aggregator(&tmp.path().join("out"));
        let report = agg.convert_dataset("db", "ds001", &root, false).await;
        let doc = read_json(report.document.as_ref().unwrap()).unwrap();
        assert_eq!(doc["sub-01"]["a.tsv"], json!({"x": [1]}));
        assert_eq!(doc["sub-02"]["a.tsv"], json!({"_DataLink_": "$.sub-01.a.tsv"}));
        assert_eq!(doc["sub-03"]["a.tsv"], json!({"_DataLink_": "$.sub-01.a.tsv"}));
    }

    #[tokio::test]
    async fn removing_a_canonical_file_forces_full_reset() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ds001");
        write(&root, "sub-01/a.tsv", "x\n1\n");
        write(&root, "sub-02/a.tsv", "x\n1\n");
        let agg = aggregator(&tmp.path().join("out"));
        agg.convert_dataset("db", "ds001", &root, false).await;

        std::fs::remove_file(root.join("sub-01/a.tsv")).unwrap();
        let report = agg.convert_dataset("db", "ds001", &root, false).await;
        assert!(report.full_reset);
        let doc = read_json(report.document.as_ref().unwrap()).unwrap();
        assert_eq!(doc["sub-02"]["a.tsv"], json!({"x": [1]}));
    }

    #[tokio::test]
    async fn merge_conflict_fails_the_dataset() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ds001");
        write(&root, "sub-01/a.tsv", "x\n1\n");
        write(&root, "sub-01/a.tsv.json", "{\"x\": [1]}");
        let agg = aggregator(&tmp.path().join("out"));

        let report = agg.convert_dataset("db", "ds001", &root, false).await;
        assert_eq!(report.state, DatasetState::Failed);
        let error = report.error.unwrap();
        assert!(error.contains("sub-01/a.tsv"), "{}", error);
        assert!(error.contains("sub-01/a.tsv.json"), "{}", error);
        assert!(!agg.layout().dataset_doc_path("ds001").exists());
    }

    #[tokio::test]
    async fn reset_clears_artifacts_and_cache() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("ds001");
        write(&root, "sub-01/a.tsv", "x\n1\n");
        let dedup = Arc::new(MemoryDedupStore::new());
        let agg = Aggregator::new(&Config::default(), tmp.path().join("out"), dedup.clone(), None)
            .unwrap();
        agg.convert_dataset("db", "ds001", &root, false).await;
        assert_eq!(dedup.records("ds001").await.unwrap().len(), 1);

        agg.reset_dataset("ds001").await.unwrap();
        assert!(dedup.records("ds001").await.unwrap().is_empty());
        assert!(!agg.layout().fragment_dir("ds001").exists());
        assert!(!agg.layout().dataset_doc_path("ds001").exists());
        assert!(!agg.layout().stamp_path("ds001").exists());
        assert!(root.join("sub-01/a.tsv").exists());
    }

    #[test]
    fn merges_a_fragment_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("ds001");
        write(&dir, "sub-01/a.tsv.json", "{\"x\": [1]}");
        write(&dir, "sub-01/anat/t1.nii.gz.jnii", "{\"NIFTIHeader\": {}}");
        write(&dir, "README.json", "\"hi\"");
        write(&dir, "ignored.bin", "zz");
        let doc = Value::Object(merge_directory(&dir).unwrap());
        assert_eq!(
            doc,
            json!({
                "README": "hi",
                "sub-01": {"a.tsv": {"x": [1]}, "anat": {"t1.nii.gz": {"NIFTIHeader": {}}}}
            })
        );
    }
}
