//! Format adapter gateway: turn one [`SourceFile`] into one [`Fragment`].
//!
//! ```text
//! SourceFile ──▶ classify ──▶ OffloadPolicy ──▶ handler ──▶ Fragment
//!                   │               │
//!                Category        Decision
//! ```
//!
//! One handler per [`Decision`]; inline conversion dispatches exhaustively
//! on [`Category`]. Every error a file raises is contained here: the file
//! becomes a failure marker (an opaque reference with a diagnostic) and a
//! single line is logged: `warn!` for file-level errors, `error!` when the
//! output side failed.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::adapter::{AdapterContext, AdapterOutput, FormatAdapter};
use crate::attach::AttachmentStore;
use crate::bjdata;
use crate::classify::{classify, media_type, BINARY_JSON};
use crate::config::{expand_template, Config};
use crate::dedup::{claim, Claim, DedupStore};
use crate::error::{FoldError, Result};
use crate::hash::{content_digest_blocking, path_hash};
use crate::layout::OutputLayout;
use crate::merge::document_key;
use crate::models::{Category, ContentDigest, DataLink, Fragment, Level, SourceFile, DATALINK_KEY};
use crate::policy::{Decision, OffloadPolicy};
use crate::tabular::{parse_numeric_matrix, parse_table, Delimiter};

/// JData keys for embedded binary payloads.
pub const BYTESTREAM_KEY: &str = "_ByteStream_";
pub const MEDIATYPE_KEY: &str = "_MediaType_";

/// Content-addressed annex key: `<BACKEND>-s<SIZE>--<HASH>[.ext]`.
static ANNEX_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9]+-s(\d+)--").expect("valid regex"));

/// Names the dataset (and database) a file belongs to.
#[derive(Debug, Clone)]
pub struct DatasetContext {
    pub dataset: String,
    pub database: String,
}

impl DatasetContext {
    pub fn new(dataset: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            database: database.into(),
        }
    }
}

/// How a file ended up in its fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Inline,
    Deduplicated,
    Attached,
    FallbackLinked,
    Empty,
    Linked,
    Opaque,
    Failed,
    /// Fragment from a previous run was kept.
    Reused,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Inline => "inline",
            Outcome::Deduplicated => "deduplicated",
            Outcome::Attached => "attached",
            Outcome::FallbackLinked => "fallback-linked",
            Outcome::Empty => "empty",
            Outcome::Linked => "linked",
            Outcome::Opaque => "opaque",
            Outcome::Failed => "failed",
            Outcome::Reused => "reused",
        }
    }
}

/// Per-file summary returned next to the fragment.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub relative_path: String,
    pub category: Category,
    pub decision: Option<Decision>,
    pub outcome: Outcome,
    /// `"<Kind>: <message>"` for failed files.
    pub error: Option<String>,
}

pub struct Gateway {
    policy: OffloadPolicy,
    layout: OutputLayout,
    attachments: bool,
    attach_url: Option<String>,
    fallback_url: Option<String>,
    numeric_external: bool,
    follow_symlinks: bool,
    adapter: Option<Arc<dyn FormatAdapter>>,
    dedup: Arc<dyn DedupStore>,
}

impl Gateway {
    pub fn new(
        config: &Config,
        layout: OutputLayout,
        dedup: Arc<dyn DedupStore>,
        adapter: Option<Arc<dyn FormatAdapter>>,
    ) -> Self {
        Self {
            policy: OffloadPolicy::new(config),
            layout,
            attachments: config.offload.attachments,
            attach_url: config.offload.attach_url.clone(),
            fallback_url: config.offload.fallback_url.clone(),
            numeric_external: config.numeric.external,
            follow_symlinks: config.pipeline.follow_symlinks,
            adapter,
            dedup,
        }
    }

    /// Content digest of `file` when its conversion goes through the dedup
    /// cache, `None` otherwise or when the file cannot be read.
    pub async fn dedup_digest(&self, file: &SourceFile) -> Option<ContentDigest> {
        if file.unreadable.is_some() {
            return None;
        }
        let file = self.resolve(file);
        let category = classify(&file);
        match self.policy.decide(&file, category) {
            Ok(Decision::DedupInline) => content_digest_blocking(file, self.follow_symlinks)
                .await
                .ok(),
            _ => None,
        }
    }

    /// Convert one file. Never fails: errors become failure markers.
    pub async fn convert(&self, ctx: &DatasetContext, file: &SourceFile) -> (Fragment, FileReport) {
        self.convert_with_digest(ctx, file, None).await
    }

    /// Like [`convert`](Self::convert), reusing a digest computed earlier by
    /// [`dedup_digest`](Self::dedup_digest).
    pub async fn convert_with_digest(
        &self,
        ctx: &DatasetContext,
        file: &SourceFile,
        digest: Option<ContentDigest>,
    ) -> (Fragment, FileReport) {
        let file = self.resolve(file);
        let category = classify(&file);
        let mut report = FileReport {
            relative_path: file.relative_path.clone(),
            category,
            decision: None,
            outcome: Outcome::Failed,
            error: None,
        };

        let result = match (&file.unreadable, self.policy.decide(&file, category)) {
            (Some(reason), _) => Err(FoldError::UnreadableFile {
                path: file.abs_path.clone(),
                source: std::io::Error::other(reason.clone()),
            }),
            (None, Ok(decision)) => {
                report.decision = Some(decision);
                self.apply(ctx, &file, category, decision, digest).await
            }
            (None, Err(e)) => Err(e),
        };

        match result {
            Ok((fragment, outcome)) => {
                debug!(
                    dataset = %ctx.dataset,
                    level = ?Level::File,
                    path = %file.relative_path,
                    category = %category,
                    outcome = outcome.as_str(),
                    "converted"
                );
                if outcome == Outcome::Opaque {
                    warn!(
                        dataset = %ctx.dataset,
                        path = %file.relative_path,
                        "unrecognized file kept as opaque reference"
                    );
                }
                report.outcome = outcome;
                (fragment, report)
            }
            Err(err) => {
                let diagnostic = format!("{}: {}", err.kind(), err);
                if err.is_file_level() {
                    warn!(
                        dataset = %ctx.dataset,
                        path = %file.relative_path,
                        error = %diagnostic,
                        "file failed, recorded as failure marker"
                    );
                } else {
                    // output side (attachment store, config), not the file itself
                    error!(
                        dataset = %ctx.dataset,
                        path = %file.relative_path,
                        error = %diagnostic,
                        "cannot write output for file, recorded as failure marker"
                    );
                }
                report.error = Some(diagnostic.clone());
                (failure_fragment(&file, diagnostic), report)
            }
        }
    }

    /// With `follow_symlinks`, an intact link is converted as its target.
    fn resolve(&self, file: &SourceFile) -> SourceFile {
        if !(file.is_symlink && self.follow_symlinks) {
            return file.clone();
        }
        match std::fs::metadata(&file.abs_path) {
            Ok(meta) if meta.is_file() => SourceFile {
                is_symlink: false,
                byte_size: meta.len(),
                ..file.clone()
            },
            _ => file.clone(),
        }
    }

    async fn apply(
        &self,
        ctx: &DatasetContext,
        file: &SourceFile,
        category: Category,
        decision: Decision,
        digest: Option<ContentDigest>,
    ) -> Result<(Fragment, Outcome)> {
        match decision {
            Decision::Inline => {
                let (value, outcome) = self.convert_inline(ctx, file, category).await?;
                Ok((Fragment::Inline(value), outcome))
            }
            Decision::DedupInline => self.dedup_inline(ctx, file, category, digest).await,
            Decision::OffloadAttachment => self.offload_attachment(ctx, file, category).await,
            Decision::OffloadFallbackUrl => {
                let link = self.fallback_link(ctx, file, file.byte_size)?;
                Ok((Fragment::Link(link), Outcome::FallbackLinked))
            }
            Decision::SkipEmpty => Ok((
                Fragment::Inline(empty_fragment(&file.extension_chain)),
                Outcome::Empty,
            )),
            Decision::LinkReference => Ok(self.link_reference(ctx, file)),
            Decision::OpaqueReference => Ok((opaque_reference(file), Outcome::Opaque)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Inline conversion
    // ═══════════════════════════════════════════════════════════════════

    async fn dedup_inline(
        &self,
        ctx: &DatasetContext,
        file: &SourceFile,
        category: Category,
        digest: Option<ContentDigest>,
    ) -> Result<(Fragment, Outcome)> {
        let digest = match digest {
            Some(d) => d,
            None => content_digest_blocking(file.clone(), self.follow_symlinks).await?,
        };
        match claim(self.dedup.as_ref(), &ctx.dataset, &digest, &file.relative_path).await? {
            Claim::Canonical => {
                let (value, outcome) = self.convert_inline(ctx, file, category).await?;
                Ok((Fragment::Inline(value), outcome))
            }
            Claim::Duplicate(canonical) => Ok((
                Fragment::BackReference(DataLink::back_reference(&document_key(&canonical))),
                Outcome::Deduplicated,
            )),
        }
    }

    async fn convert_inline(
        &self,
        ctx: &DatasetContext,
        file: &SourceFile,
        category: Category,
    ) -> Result<(Value, Outcome)> {
        let bytes = read_source(file).await?;
        let chain = file.extension_chain.as_str();
        let textual = matches!(
            category,
            Category::Tabular | Category::Text | Category::VectorNumeric
        ) || (category == Category::Structured && !BINARY_JSON.contains(&chain));
        if textual && bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok((empty_fragment(chain), Outcome::Empty));
        }

        let value = match category {
            Category::Tabular => {
                let text = String::from_utf8_lossy(&bytes);
                parse_table(&text, Delimiter::for_extension(chain), &file.relative_path)?
            }
            Category::Structured if BINARY_JSON.contains(&chain) => {
                bjdata::decode(&bytes, false).map_err(|e| FoldError::Malformed {
                    format: "bjdata",
                    path: file.relative_path.clone(),
                    reason: e.to_string(),
                })?
            }
            Category::Structured => {
                serde_json::from_slice(&bytes).map_err(|e| FoldError::Malformed {
                    format: "json",
                    path: file.relative_path.clone(),
                    reason: e.to_string(),
                })?
            }
            Category::VectorNumeric => {
                parse_numeric_matrix(&String::from_utf8_lossy(&bytes), &file.relative_path)?
            }
            Category::Text => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            Category::ScientificBinary => match self.adapter_for(category) {
                Some(adapter) => {
                    debug!(adapter = adapter.name(), path = %file.relative_path, "external conversion");
                    let output = adapter
                        .convert(file, category, &self.adapter_context(ctx, file, false))
                        .await?;
                    let fragment = self.adapter_fragment(ctx, file, output)?;
                    return Ok((fragment.to_value(), Outcome::Inline));
                }
                None => byte_stream(&bytes, chain),
            },
            Category::GenericBinary | Category::ImageDocument => byte_stream(&bytes, chain),
            Category::Symlink | Category::Empty | Category::Unrecognized => {
                return Err(FoldError::Malformed {
                    format: category.as_str(),
                    path: file.relative_path.clone(),
                    reason: "category has no inline conversion".to_string(),
                });
            }
        };
        Ok((value, Outcome::Inline))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Offloading
    // ═══════════════════════════════════════════════════════════════════

    fn attachment_store(&self, ctx: &DatasetContext) -> Option<AttachmentStore> {
        self.attachments.then(|| {
            AttachmentStore::new(self.layout.clone(), self.attach_url.clone(), &ctx.database)
        })
    }

    async fn offload_attachment(
        &self,
        ctx: &DatasetContext,
        file: &SourceFile,
        category: Category,
    ) -> Result<(Fragment, Outcome)> {
        if let Some(adapter) = self.adapter_for(category) {
            debug!(adapter = adapter.name(), path = %file.relative_path, "external conversion, offloading");
            let output = adapter
                .convert(file, category, &self.adapter_context(ctx, file, true))
                .await?;
            if output.attachment.is_some() || DataLink::from_value(&output.fragment).is_some() {
                return Ok((self.adapter_fragment(ctx, file, output)?, Outcome::Attached));
            }
            // header only: keep it inline and link the original bytes next to it
            let link = self.copy_to_store(ctx, file)?;
            return Ok((with_link(output.fragment, &link), Outcome::Attached));
        }
        let link = self.copy_to_store(ctx, file)?;
        Ok((Fragment::Link(link), Outcome::Attached))
    }

    fn copy_to_store(&self, ctx: &DatasetContext, file: &SourceFile) -> Result<DataLink> {
        let store = self.attachment_store(ctx).ok_or_else(|| {
            FoldError::Config("attachment store is disabled".to_string())
        })?;
        let stored = store.store_copy(
            &ctx.dataset,
            &file.relative_path,
            &file.extension_chain,
            &file.abs_path,
        )?;
        Ok(stored.link)
    }

    fn fallback_link(&self, ctx: &DatasetContext, file: &SourceFile, size: u64) -> Result<DataLink> {
        let template = self.fallback_url.as_deref().ok_or_else(|| {
            FoldError::OversizedWithoutFallback {
                path: file.relative_path.clone(),
                size,
                threshold: self.policy.threshold(classify(file)),
            }
        })?;
        Ok(DataLink::new(expand_template(template, &ctx.database, &ctx.dataset))
            .with_size(size)
            .with_file(file.relative_path.clone()))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Adapter output
    // ═══════════════════════════════════════════════════════════════════

    fn adapter_for(&self, category: Category) -> Option<&Arc<dyn FormatAdapter>> {
        let routed = match category {
            Category::ScientificBinary => true,
            Category::VectorNumeric => self.numeric_external,
            _ => false,
        };
        self.adapter
            .as_ref()
            .filter(|a| routed && a.supports(category))
    }

    fn adapter_context(&self, ctx: &DatasetContext, file: &SourceFile, offload: bool) -> AdapterContext {
        AdapterContext {
            dataset: ctx.dataset.clone(),
            database: ctx.database.clone(),
            path_hash: path_hash(&file.relative_path),
            attach_url_template: self.attach_url.clone(),
            offload,
        }
    }

    /// Normalize adapter output into a fragment, storing its attachment.
    fn adapter_fragment(
        &self,
        ctx: &DatasetContext,
        file: &SourceFile,
        output: AdapterOutput,
    ) -> Result<Fragment> {
        if let Some(link) = DataLink::from_value(&output.fragment) {
            return Ok(Fragment::Link(link));
        }
        let attachment = match output.attachment {
            Some(att) => att,
            None => return Ok(Fragment::Inline(output.fragment)),
        };
        match self.attachment_store(ctx) {
            Some(store) => {
                let stored = store.store_bytes(
                    &ctx.dataset,
                    &file.relative_path,
                    &attachment.extension,
                    &attachment.bytes,
                )?;
                let mut link = stored.link;
                if let Some(ptr) = output.byte_pointer {
                    link = link.with_pointer(ptr);
                }
                Ok(with_link(output.fragment, &link))
            }
            None => {
                // no store: embed the bulk next to the header
                let mut obj = match output.fragment {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("_Header_".to_string(), other);
                        map
                    }
                };
                obj.insert(BYTESTREAM_KEY.to_string(), Value::String(STANDARD.encode(&attachment.bytes)));
                Ok(Fragment::Inline(Value::Object(obj)))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Links
    // ═══════════════════════════════════════════════════════════════════

    fn link_reference(&self, ctx: &DatasetContext, file: &SourceFile) -> (Fragment, Outcome) {
        let target = file.link_target.clone().unwrap_or_default();
        let size = annex_size(&target);
        if let (Some(size), Some(_)) = (size, self.fallback_url.as_ref()) {
            if let Ok(link) = self.fallback_link(ctx, file, size) {
                return (Fragment::Link(link), Outcome::Linked);
            }
        }
        (Fragment::Symlink { target, size }, Outcome::Linked)
    }
}

/// Size encoded in an annex key in the last segment of a link target.
pub fn annex_size(target: &str) -> Option<u64> {
    let name = target.rsplit(['/', '\\']).next().unwrap_or(target);
    ANNEX_KEY_RE
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// `{}` for JSON files, `[]` for everything else.
pub fn empty_fragment(chain: &str) -> Value {
    if chain == "json" {
        Value::Object(Map::new())
    } else {
        Value::Array(Vec::new())
    }
}

fn byte_stream(bytes: &[u8], chain: &str) -> Value {
    let mut obj = Map::new();
    obj.insert(BYTESTREAM_KEY.to_string(), Value::String(STANDARD.encode(bytes)));
    if let Some(mt) = media_type(chain) {
        obj.insert(MEDIATYPE_KEY.to_string(), json!(mt));
    }
    Value::Object(obj)
}

/// Header object with the attachment link alongside, or a bare link.
fn with_link(fragment: Value, link: &DataLink) -> Fragment {
    match fragment {
        Value::Object(mut map) if !map.is_empty() => {
            map.insert(DATALINK_KEY.to_string(), Value::String(link.encode()));
            Fragment::Inline(Value::Object(map))
        }
        _ => Fragment::Link(link.clone()),
    }
}

fn file_link(file: &SourceFile) -> DataLink {
    DataLink::new(format!("file://{}", file.abs_path.display())).with_size(file.byte_size)
}

fn opaque_reference(file: &SourceFile) -> Fragment {
    let diagnostic = if file.extension_chain.is_empty() {
        "unrecognized file without extension".to_string()
    } else {
        format!("unrecognized extension '{}'", file.extension_chain)
    };
    Fragment::Opaque {
        link: file_link(file),
        diagnostic,
    }
}

/// Failure marker: link to the original file plus `"<Kind>: <message>"`.
pub fn failure_fragment(file: &SourceFile, diagnostic: String) -> Fragment {
    Fragment::Opaque {
        link: file_link(file),
        diagnostic,
    }
}

async fn read_source(file: &SourceFile) -> Result<Vec<u8>> {
    tokio::fs::read(&file.abs_path)
        .await
        .map_err(|source| FoldError::UnreadableFile {
            path: file.abs_path.clone(),
            source,
        })
}
