//! Lightweight global metrics for the vault engine.
//!
//! Thread-safe atomic counters for the subsystems:
//! - Copier (files, bytes, symlinks, skips)
//! - Blob store (writes, dedup hits, bytes)
//! - Unit handlers (runs, failures)
//! - Engine operations (backups, restores, removed snapshots)
//!
//! Counters are process-wide; a vault process normally hosts one engine,
//! and per-operation deltas can be computed from two snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Copier -----
static COPY_FILES: AtomicU64 = AtomicU64::new(0);
static COPY_BYTES: AtomicU64 = AtomicU64::new(0);
static COPY_SYMLINKS: AtomicU64 = AtomicU64::new(0);
static COPY_SKIPPED: AtomicU64 = AtomicU64::new(0);

// ----- Blob store -----
static BLOBS_WRITTEN: AtomicU64 = AtomicU64::new(0);
static BLOB_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static BLOB_DEDUP_HITS: AtomicU64 = AtomicU64::new(0);

// ----- Unit handlers -----
static HANDLER_RUNS: AtomicU64 = AtomicU64::new(0);
static HANDLER_FAILURES: AtomicU64 = AtomicU64::new(0);

// ----- Engine operations -----
static BACKUPS_DONE: AtomicU64 = AtomicU64::new(0);
static RESTORES_DONE: AtomicU64 = AtomicU64::new(0);
static SNAPSHOTS_REMOVED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub copy_files: u64,
    pub copy_bytes: u64,
    pub copy_symlinks: u64,
    pub copy_skipped: u64,

    pub blobs_written: u64,
    pub blob_bytes_written: u64,
    pub blob_dedup_hits: u64,

    pub handler_runs: u64,
    pub handler_failures: u64,

    pub backups_done: u64,
    pub restores_done: u64,
    pub snapshots_removed: u64,
}

/// Read all counters at once (relaxed; the numbers are advisory).
pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        copy_files: COPY_FILES.load(Ordering::Relaxed),
        copy_bytes: COPY_BYTES.load(Ordering::Relaxed),
        copy_symlinks: COPY_SYMLINKS.load(Ordering::Relaxed),
        copy_skipped: COPY_SKIPPED.load(Ordering::Relaxed),

        blobs_written: BLOBS_WRITTEN.load(Ordering::Relaxed),
        blob_bytes_written: BLOB_BYTES_WRITTEN.load(Ordering::Relaxed),
        blob_dedup_hits: BLOB_DEDUP_HITS.load(Ordering::Relaxed),

        handler_runs: HANDLER_RUNS.load(Ordering::Relaxed),
        handler_failures: HANDLER_FAILURES.load(Ordering::Relaxed),

        backups_done: BACKUPS_DONE.load(Ordering::Relaxed),
        restores_done: RESTORES_DONE.load(Ordering::Relaxed),
        snapshots_removed: SNAPSHOTS_REMOVED.load(Ordering::Relaxed),
    }
}

pub fn record_file_copied(bytes: u64) {
    COPY_FILES.fetch_add(1, Ordering::Relaxed);
    COPY_BYTES.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_symlink_copied() {
    COPY_SYMLINKS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_copy_skipped() {
    COPY_SKIPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_blob_written(bytes: u64) {
    BLOBS_WRITTEN.fetch_add(1, Ordering::Relaxed);
    BLOB_BYTES_WRITTEN.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_blob_dedup_hit() {
    BLOB_DEDUP_HITS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_handler_run() {
    HANDLER_RUNS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_handler_failure() {
    HANDLER_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_backup_done() {
    BACKUPS_DONE.fetch_add(1, Ordering::Relaxed);
}

pub fn record_restore_done() {
    RESTORES_DONE.fetch_add(1, Ordering::Relaxed);
}

pub fn record_snapshot_removed() {
    SNAPSHOTS_REMOVED.fetch_add(1, Ordering::Relaxed);
}
