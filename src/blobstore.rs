//! Content-addressed blob store: `<vault>/blobs/<aa>/<rest>`.
//!
//! Blob names are the 40-hex content hash of the blob bytes, so an existing
//! path is proof of identical content and writes are idempotent. Blobs are
//! never mutated; snapshots and units share them freely.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Result, VaultError};
use crate::fsutil::{self, Stat};
use crate::metrics;
use crate::vcs::HASH_HEX_LEN;

pub const BLOBS_DIR: &str = "blobs";

/// Fan-out directories and blobs are private to the vault owner.
const BLOB_DIR_MODE: u32 = 0o700;
const BLOB_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    fsync: bool,
}

impl BlobStore {
    /// A store rooted at `<vault_root>/blobs`. Nothing is created until the
    /// first write.
    pub fn new(vault_root: impl Into<PathBuf>) -> Self {
        Self {
            root: vault_root.into(),
            fsync: false,
        }
    }

    pub fn with_fsync(mut self, on: bool) -> Self {
        self.fsync = on;
        self
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }

    /// Pure mapping hash -> path: `blobs/<first-two>/<remaining-38>`.
    pub fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        check_hash(hash)?;
        Ok(self.dir().join(&hash[..2]).join(&hash[2..]))
    }

    pub fn has(&self, hash: &str) -> Result<bool> {
        Ok(self.blob_path(hash)?.exists())
    }

    /// Store `src`'s bytes under `hash`. If the blob already exists the
    /// write is skipped — the name guarantees content equality.
    pub fn write_blob(&self, hash: &str, src: &Stat) -> Result<PathBuf> {
        let path = self.blob_path(hash)?;
        if path.exists() {
            debug!("blobstore: hit {}", hash);
            metrics::record_blob_dedup_hit();
            return Ok(path);
        }

        fsutil::ensure_dir(&self.dir(), BLOB_DIR_MODE)?;
        let fan_out = path
            .parent()
            .ok_or_else(|| VaultError::logic(format!("blob path has no parent: {}", path.display())))?;
        fsutil::ensure_dir(fan_out, BLOB_DIR_MODE)?;

        fsutil::copy_data(&path, src, Some(BLOB_FILE_MODE))?;
        if self.fsync {
            // Durability is best-effort; the store heals on the next run.
            if let Ok(f) = OpenOptions::new().read(true).open(&path) {
                let _ = f.sync_all();
            }
        }
        debug!("blobstore: wrote {} ({} bytes)", hash, src.size()?);
        metrics::record_blob_written(src.size()?);
        Ok(path)
    }
}

/// A valid blob name: exactly 40 lowercase hex characters.
pub fn check_hash(hash: &str) -> Result<()> {
    let ok = hash.len() == HASH_HEX_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !ok {
        return Err(VaultError::config(format!("bad blob hash: {:?}", hash)));
    }
    Ok(())
}

/// Read a blob reference file: whitespace-trimmed content must be a valid
/// blob name.
pub fn read_reference(path: &Path) -> Result<String> {
    let hash = fsutil::read_trimmed(path)?;
    check_hash(&hash).map_err(|_| {
        VaultError::config(format!(
            "malformed blob reference {}: {:?}",
            path.display(),
            hash
        ))
    })?;
    Ok(hash)
}
