//! Content hashing and attachment-name hashing.
//!
//! Two distinct keys are derived here:
//!
//! | Function | Domain | Algorithm | Use |
//! |----------|--------|-----------|-----|
//! | [`content_digest`] | file bytes, or a symlink's target string | SHA-1, hex | dedup cache key |
//! | [`path_hash`] | dataset-relative path, `/`-separated, UTF-8 | SHA-256, first 32 hex | attachment file name |
//!
//! Both are scoped to a single dataset by their callers.

use std::fs::File;
use std::io::{BufReader, Read};

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{FoldError, Result};
use crate::models::{ContentDigest, SourceFile};

const READ_BUF: usize = 64 * 1024;
const PATH_HASH_LEN: usize = 32;

/// Digest of a file's logical content.
///
/// Symbolic links hash their target string unless `follow_symlinks` is set,
/// in which case the pointed-to bytes are hashed (a broken link then falls
/// back to its target string).
pub fn content_digest(file: &SourceFile, follow_symlinks: bool) -> Result<ContentDigest> {
    if file.is_symlink {
        let target = file.link_target.as_deref().unwrap_or_default();
        if !follow_symlinks || !file.abs_path.exists() {
            return Ok(digest_bytes(target.as_bytes()));
        }
    }

    let handle = File::open(&file.abs_path).map_err(|source| FoldError::UnreadableFile {
        path: file.abs_path.clone(),
        source,
    })?;
    let mut reader = BufReader::with_capacity(READ_BUF, handle);
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|source| FoldError::UnreadableFile {
                path: file.abs_path.clone(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentDigest(hex::encode(hasher.finalize())))
}

/// Digest of an in-memory buffer.
pub fn digest_bytes(bytes: &[u8]) -> ContentDigest {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    ContentDigest(hex::encode(hasher.finalize()))
}

/// Deterministic attachment name stem for a dataset-relative path.
pub fn path_hash(relative_path: &str) -> String {
    let normalized = relative_path.replace('\\', "/");
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(PATH_HASH_LEN);
    hex
}

/// Run [`content_digest`] off the async executor.
pub async fn content_digest_blocking(
    file: SourceFile,
    follow_symlinks: bool,
) -> Result<ContentDigest> {
    tokio::task::spawn_blocking(move || content_digest(&file, follow_symlinks))
        .await
        .map_err(|e| FoldError::Io(std::io::Error::other(e.to_string())))?
}
