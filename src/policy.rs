//! Offload policy: decide how a classified file ends up in the document.
//!
//! Size rule: `size < threshold` converts inline, `size >= threshold`
//! offloads. Exempt file names (e.g. `participants.tsv`) always stay
//! inline.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::{Config, ThresholdConfig};
use crate::error::{FoldError, Result};
use crate::models::{Category, SourceFile};

/// What the gateway must do with one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Convert fully and embed.
    Inline,
    /// Embed, unless identical content was already claimed in the dataset.
    DedupInline,
    /// Store in the attachment store and link to it.
    OffloadAttachment,
    /// Link to the configured remote URL template.
    OffloadFallbackUrl,
    /// Zero-byte or whitespace-only: empty fragment.
    SkipEmpty,
    /// Symbolic link descriptor; never followed and re-converted.
    LinkReference,
    /// Unrecognized: link to the original file with a diagnostic.
    OpaqueReference,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Inline => "inline",
            Decision::DedupInline => "dedup-inline",
            Decision::OffloadAttachment => "offload-attachment",
            Decision::OffloadFallbackUrl => "offload-fallback-url",
            Decision::SkipEmpty => "skip-empty",
            Decision::LinkReference => "link-reference",
            Decision::OpaqueReference => "opaque-reference",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OffloadPolicy {
    thresholds: ThresholdConfig,
    exempt: HashSet<String>,
    attachments: bool,
    fallback: bool,
}

impl OffloadPolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            exempt: config.offload.exempt.iter().cloned().collect(),
            attachments: config.offload.attachments,
            fallback: config.offload.fallback_url.is_some(),
        }
    }

    pub fn threshold(&self, category: Category) -> u64 {
        self.thresholds.for_category(category)
    }

    /// Decide for `file` already classified as `category`.
    pub fn decide(&self, file: &SourceFile, category: Category) -> Result<Decision> {
        match category {
            Category::Symlink => return Ok(Decision::LinkReference),
            Category::Empty => return Ok(Decision::SkipEmpty),
            Category::Unrecognized => return Ok(Decision::OpaqueReference),
            _ => {}
        }

        let threshold = self.threshold(category);
        if file.byte_size < threshold || self.exempt.contains(file.file_name()) {
            return Ok(if category.deduplicates() {
                Decision::DedupInline
            } else {
                Decision::Inline
            });
        }

        if self.attachments {
            Ok(Decision::OffloadAttachment)
        } else if self.fallback {
            Ok(Decision::OffloadFallbackUrl)
        } else {
            Err(FoldError::OversizedWithoutFallback {
                path: file.relative_path.clone(),
                size: file.byte_size,
                threshold,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::extension_chain;

    fn file(name: &str, size: u64) -> SourceFile {
        SourceFile {
            relative_path: format!("sub-01/{}", name),
            abs_path: format!("/d/sub-01/{}", name).into(),
            byte_size: size,
            is_symlink: false,
            link_target: None,
            extension_chain: extension_chain(name),
            modified: None,
            unreadable: None,
        }
    }

    fn policy(attachments: bool, fallback: Option<&str>) -> OffloadPolicy {
        let mut cfg = Config::default();
        cfg.thresholds.tabular = Some(100);
        cfg.offload.attachments = attachments;
        cfg.offload.fallback_url = fallback.map(str::to_string);
        OffloadPolicy::new(&cfg)
    }

    #[test]
    fn threshold_boundary_offloads_at_threshold() {
        let p = policy(true, None);
        let below = file("a.tsv", 99);
        let at = file("a.tsv", 100);
        assert_eq!(p.decide(&below, Category::Tabular).unwrap(), Decision::DedupInline);
        assert_eq!(p.decide(&at, Category::Tabular).unwrap(), Decision::OffloadAttachment);
    }

    #[test]
    fn fallback_url_when_no_attachment_store() {
        let p = policy(false, Some("https://h/%DB%/%DS%"));
        assert_eq!(
            p.decide(&file("a.tsv", 1000), Category::Tabular).unwrap(),
            Decision::OffloadFallbackUrl
        );
    }

    #[test]
    fn oversized_without_targets_is_an_error() {
        let p = policy(false, None);
        let err = p.decide(&file("a.tsv", 10_000_000), Category::Tabular).unwrap_err();
        assert!(matches!(err, FoldError::OversizedWithoutFallback { size: 10_000_000, .. }));
    }

    #[test]
    fn exempt_names_stay_inline() {
        let p = policy(false, None);
        assert_eq!(
            p.decide(&file("participants.tsv", 10_000_000), Category::Tabular).unwrap(),
            Decision::DedupInline
        );
    }

    #[test]
    fn special_categories_ignore_size() {
        let p = policy(false, None);
        let f = file("x", 0);
        assert_eq!(p.decide(&f, Category::Symlink).unwrap(), Decision::LinkReference);
        assert_eq!(p.decide(&f, Category::Empty).unwrap(), Decision::SkipEmpty);
        assert_eq!(p.decide(&f, Category::Unrecognized).unwrap(), Decision::OpaqueReference);
        assert_eq!(
            p.decide(&file("t1.nii.gz", 10), Category::ScientificBinary).unwrap(),
            Decision::Inline
        );
    }
}
