//! External format adapter contract.
//!
//! Binary scientific formats (volumetric images, physiological-signal
//! containers) are converted by an external collaborator. The engine only
//! sees the [`FormatAdapter`] trait: a file goes in, a JSON fragment and
//! optional attachment bytes come out.
//!
//! [`CommandAdapter`] runs a configured program. Placeholders in its
//! arguments are expanded per file:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `%FILE%` | absolute path of the source file |
//! | `%ATT%` | scratch directory for attachment output |
//! | `%DS%` | dataset name |
//! | `%DB%` | database name |
//! | `%HASH%` | path hash of the file |
//! | `%URL%` | attachment URL prefix with `%DB%`/`%DS%` expanded, empty if unset |
//! | `%OFFLOAD%` | `1` when the file is being offloaded, `0` otherwise |
//!
//! The program must print one JSON value on stdout. A file it leaves in the
//! `%ATT%` directory becomes the attachment.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tracing::debug;

use crate::config::{expand_template, AdapterConfig};
use crate::error::{FoldError, Result};
use crate::models::{extension_chain, Category, SourceFile};

/// Per-file context handed to an adapter.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub dataset: String,
    pub database: String,
    pub path_hash: String,
    /// Attachment URL prefix, still holding `%DB%`/`%DS%`.
    pub attach_url_template: Option<String>,
    /// True when the policy decided to offload; adapters should then keep
    /// bulk data out of the fragment.
    pub offload: bool,
}

/// Attachment bytes produced by an adapter.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub extension: String,
}

#[derive(Debug, Clone)]
pub struct AdapterOutput {
    /// Converted header/metadata, or a bare `_DataLink_` object.
    pub fragment: Value,
    pub attachment: Option<Attachment>,
    /// Sub-structure address inside the attachment.
    pub byte_pointer: Option<String>,
}

#[async_trait]
pub trait FormatAdapter: Send + Sync {
    /// Adapter name used in logs.
    fn name(&self) -> &str;

    /// Whether this adapter handles files of `category`.
    fn supports(&self, category: Category) -> bool;

    async fn convert(
        &self,
        file: &SourceFile,
        category: Category,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput>;
}

/// Adapter backed by an external program.
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    command: String,
    args: Vec<String>,
    /// Also accept vector-numeric files.
    numeric: bool,
}

impl CommandAdapter {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            numeric: false,
        }
    }

    pub fn with_numeric(mut self, numeric: bool) -> Self {
        self.numeric = numeric;
        self
    }

    /// Build from configuration; `None` when no command is configured.
    pub fn from_config(config: &AdapterConfig, numeric: bool) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|cmd| Self::new(cmd.clone(), config.args.clone()).with_numeric(numeric))
    }

    fn expand(&self, arg: &str, file: &SourceFile, ctx: &AdapterContext, att_dir: &Path) -> String {
        let url = ctx
            .attach_url_template
            .as_deref()
            .map(|t| expand_template(t, &ctx.database, &ctx.dataset))
            .unwrap_or_default();
        arg.replace("%FILE%", &file.abs_path.to_string_lossy())
            .replace("%ATT%", &att_dir.to_string_lossy())
            .replace("%URL%", &url)
            .replace("%OFFLOAD%", if ctx.offload { "1" } else { "0" })
            .replace("%DS%", &ctx.dataset)
            .replace("%DB%", &ctx.database)
            .replace("%HASH%", &ctx.path_hash)
    }
}

#[async_trait]
impl FormatAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.command
    }

    fn supports(&self, category: Category) -> bool {
        category == Category::ScientificBinary
            || (self.numeric && category == Category::VectorNumeric)
    }

    async fn convert(
        &self,
        file: &SourceFile,
        _category: Category,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput> {
        let fail = |reason: String| FoldError::FormatAdapter {
            path: file.abs_path.clone(),
            reason,
        };

        let scratch = TempDir::new()?;
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| self.expand(a, file, ctx, scratch.path()))
            .collect();
        debug!(command = %self.command, file = %file.relative_path, "running format adapter");

        let output = tokio::process::Command::new(&self.command)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| fail(format!("failed to start '{}': {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("exited with {}: {}", output.status, stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let fragment: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| fail(format!("invalid JSON output: {}", e)))?;

        let attachment = match first_file(scratch.path())? {
            Some(path) => {
                let bytes = tokio::fs::read(&path).await?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Some(Attachment {
                    bytes,
                    extension: extension_chain(&name),
                })
            }
            None => None,
        };

        Ok(AdapterOutput {
            fragment,
            attachment,
            byte_pointer: None,
        })
    }
}

/// First regular file in `dir`, by name.
fn first_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    files.sort();
    Ok(files.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AdapterContext {
        AdapterContext {
            dataset: "ds001".into(),
            database: "openneuro".into(),
            path_hash: "abcd".into(),
            attach_url_template: None,
            offload: true,
        }
    }

    fn file(path: &Path) -> SourceFile {
        SourceFile {
            relative_path: "sub-01/anat/t1.nii".into(),
            abs_path: path.to_path_buf(),
            byte_size: 4,
            is_symlink: false,
            link_target: None,
            extension_chain: "nii".into(),
            modified: None,
            unreadable: None,
        }
    }

    #[test]
    fn supports_scientific_and_optionally_numeric() {
        let a = CommandAdapter::new("conv", vec![]);
        assert!(a.supports(Category::ScientificBinary));
        assert!(!a.supports(Category::VectorNumeric));
        assert!(a.with_numeric(true).supports(Category::VectorNumeric));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_and_collects_attachment() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("t1.nii");
        std::fs::write(&src, b"NIFT").unwrap();
        let adapter = CommandAdapter::new(
            "sh",
            vec![
                "-c".into(),
                "printf 'bulk' > \"$1/%HASH%.bnii\"; echo '{\"NIFTIHeader\":{\"Dim\":[2,2]},\"ds\":\"%DS%\"}'"
                    .into(),
                "sh".into(),
                "%ATT%".into(),
            ],
        );
        let out = adapter
            .convert(&file(&src), Category::ScientificBinary, &ctx())
            .await
            .unwrap();
        assert_eq!(out.fragment["NIFTIHeader"]["Dim"], serde_json::json!([2, 2]));
        assert_eq!(out.fragment["ds"], "ds001");
        let att = out.attachment.unwrap();
        assert_eq!(att.bytes, b"bulk");
        assert_eq!(att.extension, "bnii");
    }

    #[test]
    fn expands_url_and_offload_placeholders() {
        let adapter = CommandAdapter::new("conv", vec![]);
        let mut ctx = ctx();
        ctx.attach_url_template = Some("https://att.example/%DB%/%DS%/".into());
        ctx.offload = false;
        let f = file(Path::new("/data/t1.nii"));
        let att = Path::new("/tmp/att");
        assert_eq!(
            adapter.expand("--url=%URL%%HASH%.bnii", &f, &ctx, att),
            "--url=https://att.example/openneuro/ds001/abcd.bnii"
        );
        assert_eq!(adapter.expand("%OFFLOAD%", &f, &ctx, att), "0");

        ctx.attach_url_template = None;
        ctx.offload = true;
        assert_eq!(adapter.expand("[%URL%] %OFFLOAD%", &f, &ctx, att), "[] 1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_or_garbage_output_is_an_adapter_error() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("t1.nii");
        std::fs::write(&src, b"NIFT").unwrap();

        let crash = CommandAdapter::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()]);
        let err = crash
            .convert(&file(&src), Category::ScientificBinary, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, FoldError::FormatAdapter { .. }));

        let garbage = CommandAdapter::new("sh", vec!["-c".into(), "echo not-json".into()]);
        let err = garbage
            .convert(&file(&src), Category::ScientificBinary, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, FoldError::FormatAdapter { .. }));
        assert!(src.exists());
    }
}
