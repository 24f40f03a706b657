//! Configuration: a TOML file with per-field defaults, then `DSFOLD_*`
//! environment overrides.
//!
//! ```toml
//! [thresholds]          # bytes; size < threshold is converted inline
//! tabular = 262144
//! scientific = 65536
//! default = 131072
//!
//! [offload]
//! attachments = true
//! attach_url = "https://example.org/att/%DB%/%DS%/"
//! fallback_url = "https://example.org/get?db=%DB%&ds=%DS%"
//! exempt = ["participants.tsv"]
//!
//! [adapter]
//! command = "jnifti-header"
//! args = ["%FILE%", "%ATT%"]
//!
//! [numeric]
//! external = false
//!
//! [pipeline]
//! workers = 8
//! follow_symlinks = false
//! exclude_globs = ["**/.git/**"]
//! database = "openneuro"
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::models::Category;

pub const DB_PLACEHOLDER: &str = "%DB%";
pub const DS_PLACEHOLDER: &str = "%DS%";

const KIB: u64 = 1024;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub offload: OffloadConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub numeric: NumericConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Size thresholds in bytes. Category thresholds take priority over `default`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ThresholdConfig {
    #[serde(default)]
    pub tabular: Option<u64>,
    #[serde(default)]
    pub structured: Option<u64>,
    #[serde(default)]
    pub scientific: Option<u64>,
    #[serde(default)]
    pub vector: Option<u64>,
    #[serde(default)]
    pub binary: Option<u64>,
    #[serde(default)]
    pub image: Option<u64>,
    #[serde(default)]
    pub text: Option<u64>,
    #[serde(default = "default_threshold")]
    pub default: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            tabular: Some(256 * KIB),
            structured: Some(256 * KIB),
            scientific: Some(64 * KIB),
            vector: Some(128 * KIB),
            binary: Some(64 * KIB),
            image: Some(64 * KIB),
            text: Some(128 * KIB),
            default: default_threshold(),
        }
    }
}

fn default_threshold() -> u64 {
    128 * KIB
}

impl ThresholdConfig {
    /// Threshold for `category`, falling back to the global default.
    pub fn for_category(&self, category: Category) -> u64 {
        let specific = match category {
            Category::Tabular => self.tabular,
            Category::Structured => self.structured,
            Category::ScientificBinary => self.scientific,
            Category::VectorNumeric => self.vector,
            Category::GenericBinary => self.binary,
            Category::ImageDocument => self.image,
            Category::Text => self.text,
            Category::Symlink | Category::Empty | Category::Unrecognized => None,
        };
        specific.unwrap_or(self.default)
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Option<u64>> {
        match name {
            "tabular" => Some(&mut self.tabular),
            "structured" => Some(&mut self.structured),
            "scientific" => Some(&mut self.scientific),
            "vector" => Some(&mut self.vector),
            "binary" => Some(&mut self.binary),
            "image" => Some(&mut self.image),
            "text" => Some(&mut self.text),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OffloadConfig {
    /// Write oversized content into `<output_root>/.att/<dataset>/`.
    #[serde(default = "default_true")]
    pub attachments: bool,
    /// URL prefix for attachments; `file://` paths are used when unset.
    #[serde(default)]
    pub attach_url: Option<String>,
    /// Remote URL template used when attachments are disabled.
    #[serde(default)]
    pub fallback_url: Option<String>,
    /// File names never offloaded because of size.
    #[serde(default = "default_exempt")]
    pub exempt: Vec<String>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            attachments: true,
            attach_url: None,
            fallback_url: None,
            exempt: default_exempt(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_exempt() -> Vec<String> {
    vec!["participants.tsv".to_string()]
}

/// External format adapter for scientific-binary files.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AdapterConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NumericConfig {
    /// Route oversized vector-numeric files through the external adapter.
    #[serde(default)]
    pub external: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Database (collection namespace) name substituted for `%DB%`.
    #[serde(default)]
    pub database: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            follow_symlinks: false,
            exclude_globs: Vec::new(),
            database: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 16)
}

impl Config {
    /// Apply `DSFOLD_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `get`, so callers can inject a source.
    pub fn apply_env_from<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in [
            "tabular",
            "structured",
            "scientific",
            "vector",
            "binary",
            "image",
            "text",
        ] {
            let key = format!("DSFOLD_THRESHOLD_{}", name.to_ascii_uppercase());
            if let Some(raw) = get(&key) {
                let bytes = parse_u64(&key, &raw)?;
                if let Some(slot) = self.thresholds.slot_mut(name) {
                    *slot = Some(bytes);
                }
            }
        }
        if let Some(raw) = get("DSFOLD_THRESHOLD_DEFAULT") {
            self.thresholds.default = parse_u64("DSFOLD_THRESHOLD_DEFAULT", &raw)?;
        }
        if let Some(url) = get("DSFOLD_FALLBACK_URL") {
            self.offload.fallback_url = non_empty(url);
        }
        if let Some(url) = get("DSFOLD_ATTACH_URL") {
            self.offload.attach_url = non_empty(url);
        }
        if let Some(raw) = get("DSFOLD_ATTACHMENTS") {
            self.offload.attachments = parse_bool("DSFOLD_ATTACHMENTS", &raw)?;
        }
        if let Some(raw) = get("DSFOLD_NUMERIC_EXTERNAL") {
            self.numeric.external = parse_bool("DSFOLD_NUMERIC_EXTERNAL", &raw)?;
        }
        if let Some(raw) = get("DSFOLD_WORKERS") {
            self.pipeline.workers = parse_u64("DSFOLD_WORKERS", &raw)? as usize;
        }
        if let Some(db) = get("DSFOLD_DB") {
            self.pipeline.database = non_empty(db);
        }
        self.validate()
    }

    /// Digest of every setting that shapes converted output. The worker
    /// count is left out: it never changes a document.
    pub fn output_digest(&self) -> String {
        let mut shaping = self.clone();
        shaping.pipeline.workers = 0;
        let encoded = serde_json::to_vec(&shaping).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be >= 1");
        }
        if self.thresholds.default == 0 {
            bail!("thresholds.default must be > 0");
        }
        for (name, value) in [
            ("tabular", self.thresholds.tabular),
            ("structured", self.thresholds.structured),
            ("scientific", self.thresholds.scientific),
            ("vector", self.thresholds.vector),
            ("binary", self.thresholds.binary),
            ("image", self.thresholds.image),
            ("text", self.thresholds.text),
        ] {
            if value == Some(0) {
                bail!("thresholds.{} must be > 0", name);
            }
        }
        if let Some(cmd) = &self.adapter.command {
            if cmd.trim().is_empty() {
                bail!("adapter.command must not be empty when set");
            }
        }
        Ok(())
    }
}

/// Expand `%DB%` and `%DS%` in a URL template.
pub fn expand_template(template: &str, database: &str, dataset: &str) -> String {
    template
        .replace(DB_PLACEHOLDER, database)
        .replace(DS_PLACEHOLDER, dataset)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("{} must be an unsigned integer, got '{}'", key, raw))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{} must be a boolean, got '{}'", key, other),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_prefer_category_threshold() {
        let cfg = Config::default();
        assert_eq!(cfg.thresholds.for_category(Category::Tabular), 256 * KIB);
        assert_eq!(cfg.thresholds.for_category(Category::ScientificBinary), 64 * KIB);
        assert_eq!(cfg.thresholds.for_category(Category::Unrecognized), 128 * KIB);
        assert!(cfg.offload.exempt.contains(&"participants.tsv".to_string()));
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
[thresholds]
tabular = 10
default = 99

[offload]
attachments = false
fallback_url = "https://h/%DB%/%DS%"

[pipeline]
workers = 2
"#,
        )
        .unwrap();
        assert_eq!(cfg.thresholds.for_category(Category::Tabular), 10);
        // unspecified category thresholds fall back to the global default
        assert_eq!(cfg.thresholds.for_category(Category::Text), 99);
        assert!(!cfg.offload.attachments);
        assert_eq!(cfg.pipeline.workers, 2);
        assert_eq!(cfg.offload.exempt, vec!["participants.tsv".to_string()]);
    }

    #[test]
    fn output_digest_tracks_shaping_settings_only() {
        let base = Config::default();
        let mut workers = base.clone();
        workers.pipeline.workers = base.pipeline.workers + 7;
        assert_eq!(base.output_digest(), workers.output_digest());

        let mut threshold = base.clone();
        threshold.thresholds.tabular = Some(10);
        assert_ne!(base.output_digest(), threshold.output_digest());

        let mut fallback = base.clone();
        fallback.offload.fallback_url = Some("https://h/%DS%".into());
        assert_ne!(base.output_digest(), fallback.output_digest());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("DSFOLD_THRESHOLD_TABULAR", "1024"),
            ("DSFOLD_FALLBACK_URL", "https://x/%DB%/%DS%"),
            ("DSFOLD_ATTACHMENTS", "off"),
            ("DSFOLD_NUMERIC_EXTERNAL", "1"),
            ("DSFOLD_WORKERS", "3"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.thresholds.for_category(Category::Tabular), 1024);
        assert_eq!(cfg.offload.fallback_url.as_deref(), Some("https://x/%DB%/%DS%"));
        assert!(!cfg.offload.attachments);
        assert!(cfg.numeric.external);
        assert_eq!(cfg.pipeline.workers, 3);
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut cfg = Config::default();
        assert!(cfg
            .apply_env_from(|k| (k == "DSFOLD_WORKERS").then(|| "0".to_string()))
            .is_err());
        let mut cfg = Config::default();
        assert!(cfg
            .apply_env_from(|k| (k == "DSFOLD_ATTACHMENTS").then(|| "maybe".to_string()))
            .is_err());
    }

    #[test]
    fn expands_placeholders() {
        assert_eq!(
            expand_template("https://h/%DB%/%DS%/x", "openneuro", "ds001"),
            "https://h/openneuro/ds001/x"
        );
    }
}
