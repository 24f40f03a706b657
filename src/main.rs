//! # Dataset Fold CLI (`dsfold`)
//!
//! The `dsfold` binary converts collections of datasets into nested JSON
//! documents and offers a few tools around the results.
//!
//! ## Usage
//!
//! ```bash
//! dsfold --config ./dsfold.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dsfold convert <root>` | Convert every dataset under a collection root |
//! | `dsfold merge <dir>` | Merge a directory of fragments into one document |
//! | `dsfold classify <file>...` | Show category and offload decision per file |
//! | `dsfold view <file>` | Print a JSON or BJData document with truncation |
//! | `dsfold reset <output> <dataset>` | Clear the cache and artifacts of a dataset |
//!
//! ## Examples
//!
//! ```bash
//! # Convert a whole collection
//! dsfold convert ./openneuro --output ./out
//!
//! # Reconvert one dataset from scratch
//! dsfold convert ./openneuro --output ./out --dataset ds001 --force
//!
//! # Inspect a binary JData attachment
//! dsfold view ./out/.att/ds001/3f0c...bnii --max-data 20
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use dataset_fold::aggregate::{merge_directory, Aggregator, CollectionReport};
use dataset_fold::classify::classify;
use dataset_fold::config::{self, Config};
use dataset_fold::gateway::Outcome;
use dataset_fold::layout::write_json;
use dataset_fold::logging::{init_logging, LogLevel};
use dataset_fold::policy::OffloadPolicy;
use dataset_fold::view::{self, SourceFormat, ViewOptions};
use dataset_fold::walk;

/// Config file picked up from the working directory when `--config` is not
/// given.
const DEFAULT_CONFIG: &str = "dsfold.toml";
/// Output directory created under the collection root by default.
const DEFAULT_OUTPUT: &str = ".dsfold";

/// Dataset Fold: turn directory trees of scientific data files into
/// deduplicated, nested JSON documents.
#[derive(Parser)]
#[command(
    name = "dsfold",
    about = "Fold directory trees of scientific data files into deduplicated, nested JSON documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./dsfold.toml` when present, built-in defaults
    /// otherwise. `DSFOLD_*` environment variables override file values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (`-v` info, `-vv` debug, `-vvv` trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every dataset under a collection root.
    ///
    /// Each direct subdirectory of ROOT is a dataset. Unchanged datasets are
    /// skipped; changed ones reuse fragments whose source did not change.
    Convert {
        /// Collection root directory.
        root: PathBuf,

        /// Output root. Defaults to `<ROOT>/.dsfold`.
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Only convert the named dataset (repeatable).
        #[arg(long = "dataset")]
        datasets: Vec<String>,

        /// Reset the dedup cache and reconvert even unchanged datasets.
        #[arg(long)]
        force: bool,

        /// Print the full run report as JSON instead of the summary.
        #[arg(long)]
        json: bool,
    },

    /// Merge a directory of fragment files into one document.
    Merge {
        /// Directory holding `<name>.json`/`.jnii`/`.jsnirf` fragments.
        dir: PathBuf,

        /// Target file; printed to stdout when omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Show the category and offload decision for files.
    Classify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print a JSON or BJData document, truncating large values.
    View {
        file: PathBuf,

        /// Arrays and objects longer than this are collapsed.
        #[arg(long, default_value_t = 100)]
        max_data: usize,

        /// Strings longer than this keep only their head and tail.
        #[arg(long, default_value_t = 200)]
        max_str: usize,

        /// Decode BJData numbers as big-endian.
        #[arg(long)]
        big_endian: bool,
    },

    /// Clear the dedup cache and all artifacts of one dataset.
    Reset {
        /// Output root used by `convert`.
        output: PathBuf,

        dataset: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose, cli.quiet));

    // Commands that don't require config
    match &cli.command {
        Commands::View {
            file,
            max_data,
            max_str,
            big_endian,
        } => {
            let opts = ViewOptions {
                max_data: *max_data,
                max_str: *max_str,
            };
            return run_view(file, &opts, *big_endian);
        }
        Commands::Merge { dir, output } => {
            return run_merge(dir, output.as_deref());
        }
        _ => {}
    }

    let cfg = load(cli.config.as_deref())?;

    match cli.command {
        Commands::Convert {
            root,
            output,
            datasets,
            force,
            json,
        } => {
            let output = output.unwrap_or_else(|| root.join(DEFAULT_OUTPUT));
            let aggregator = Arc::new(Aggregator::from_config(&cfg, &output)?);
            let report = aggregator.convert_collection(&root, &datasets, force).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
            if !report.is_success() {
                bail!("{} of {} datasets failed", report.failed().count(), report.datasets.len());
            }
        }
        Commands::Classify { files } => {
            let policy = OffloadPolicy::new(&cfg);
            for path in files {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let file = walk::source_file(&path, name)
                    .with_context(|| format!("cannot stat {}", path.display()))?;
                let category = classify(&file);
                let decision = match policy.decide(&file, category) {
                    Ok(d) => d.as_str().to_string(),
                    Err(e) => format!("error ({}: {})", e.kind(), e),
                };
                println!(
                    "{}\t{}\t{} bytes\t{}",
                    path.display(),
                    category,
                    file.byte_size,
                    decision
                );
            }
        }
        Commands::Reset { output, dataset } => {
            let aggregator = Aggregator::from_config(&cfg, &output)?;
            aggregator.reset_dataset(&dataset).await?;
            println!("Dataset '{}' reset.", dataset);
        }
        Commands::View { .. } | Commands::Merge { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut cfg = match path {
        Some(p) => config::load_config(p)?,
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG))?,
        None => Config::default(),
    };
    cfg.apply_env()?;
    Ok(cfg)
}

fn print_summary(report: &CollectionReport) {
    let files: usize = report.datasets.iter().map(|d| d.files.len()).sum();
    let count = |outcome| -> usize { report.datasets.iter().map(|d| d.count(outcome)).sum() };

    println!("collection: {}", report.name);
    println!(
        "datasets: {} (converted {}, skipped {}, failed {})",
        report.datasets.len(),
        report.converted(),
        report.skipped(),
        report.failed().count()
    );
    println!(
        "files: {} (inline {}, deduplicated {}, attached {}, linked {}, reused {}, failed {})",
        files,
        count(Outcome::Inline),
        count(Outcome::Deduplicated),
        count(Outcome::Attached) + count(Outcome::FallbackLinked),
        count(Outcome::Linked),
        count(Outcome::Reused),
        count(Outcome::Failed)
    );
    for dataset in &report.datasets {
        if let Some(error) = &dataset.error {
            println!("FAILED {}: {}", dataset.name, error);
        }
        for file in dataset.failed_files() {
            println!(
                "  {}/{}: {}",
                dataset.name,
                file.relative_path,
                file.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    match (&report.document, &report.error) {
        (Some(path), _) => println!("document: {}", path.display()),
        (None, Some(error)) => println!("collection merge failed: {}", error),
        (None, None) => {}
    }
    if report.is_success() {
        println!("ok");
    }
}

fn run_merge(dir: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let doc = serde_json::Value::Object(merge_directory(dir)?);
    match output {
        Some(path) => {
            write_json(path, &doc, true)?;
            println!("Merged {} into {}", dir.display(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&doc)?),
    }
    Ok(())
}

fn run_view(path: &Path, opts: &ViewOptions, big_endian: bool) -> anyhow::Result<()> {
    let data = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let loaded = view::load_document(&data, big_endian)
        .with_context(|| format!("cannot decode {}", path.display()))?;
    let format = match loaded.format {
        SourceFormat::Json => "json",
        SourceFormat::Bjdata => "bjdata",
    };
    println!("# File: {} ({})", path.display(), format);
    println!("{}", view::render(&loaded.value, opts));
    if loaded.trailing > 0 {
        println!("# {} trailing bytes not shown", loaded.trailing);
    }
    Ok(())
}
