//! # Dataset Fold
//!
//! Converts a directory tree of scientific data files into deduplicated,
//! nested JSON documents whose keys mirror the directory hierarchy.
//!
//! Every file becomes a fragment: small structured content is embedded,
//! repeated content becomes a back-reference to its first occurrence, and
//! large or binary content is offloaded to an attachment store or a remote
//! URL and replaced by a link descriptor. Fragments are folded bottom-up:
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────────┐   ┌─────────┐   ┌────────────┐
//! │  files   │──▶│ gateway  │──▶│ leaf folder │──▶│ dataset │──▶│ collection │
//! │ (walk)   │   │ fragment │   │  document   │   │document │   │  document  │
//! └──────────┘   └────┬─────┘   └─────────────┘   └─────────┘   └────────────┘
//!                     │
//!        ┌────────────┼─────────────┐
//!        ▼            ▼             ▼
//!   dedup cache   attachments   format adapter
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dsfold convert ./openneuro --output ./openneuro/.out
//! dsfold convert ./openneuro --output ./openneuro/.out --dataset ds001 --force
//! dsfold view ./openneuro/.out/ds001.doc.json
//! dsfold reset ./openneuro/.out ds001
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Core data types |
//! | [`error`] | File- and merge-level error taxonomy |
//! | [`walk`] | Dataset enumeration and merge planning |
//! | [`hash`] | Content digests and path hashes |
//! | [`dedup`] | Per-dataset dedup cache (memory and on-disk) |
//! | [`classify`] | File categories from extension and content |
//! | [`policy`] | Offload decisions |
//! | [`tabular`] | TSV/CSV and numeric-matrix parsing |
//! | [`bjdata`] | Binary JData decoder |
//! | [`attach`] | Attachment store |
//! | [`adapter`] | External format adapter |
//! | [`gateway`] | One file → one fragment |
//! | [`merge`] | Path-to-tree merge engine |
//! | [`layout`] | Output-root layout and atomic writes |
//! | [`aggregate`] | Files → folders → datasets → collection |
//! | [`view`] | Truncated document rendering |
//! | [`logging`] | Subscriber setup |

pub mod adapter;
pub mod aggregate;
pub mod attach;
pub mod bjdata;
pub mod classify;
pub mod config;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod hash;
pub mod layout;
pub mod logging;
pub mod merge;
pub mod models;
pub mod policy;
pub mod tabular;
pub mod view;
pub mod walk;
