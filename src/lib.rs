//! vault — incremental, content-addressed backup engine.
//!
//! Named units register a handler script that externalizes their state into
//! a staging directory inside the vault; the engine snapshots the staged
//! trees into a git-backed store (large payloads become hash-named blobs in
//! a sidecar store) and restores any named snapshot back into the live
//! system. One worker thread per vault owns all state; callers talk to it
//! through the `Vault` handle and an asynchronous event stream.

// Ambient modules
pub mod config;
pub mod error;
pub mod metrics;

// Filesystem layer and the content-addressed copier
pub mod blobstore;
pub mod copier;
pub mod fsutil;

// Versioned store adapter
pub mod vcs;

// Units, engine and worker dispatch
pub mod engine;
pub mod units;
pub mod worker;

// CLI front-end (used by the vault binary)
pub mod cli;

// Convenience re-exports
pub use blobstore::BlobStore;
pub use config::VaultConfig;
pub use engine::{Engine, MediaAction, MediaPlan};
pub use error::{Result, VaultError};
pub use units::{Registry, Unit};
pub use vcs::{AddMode, Git};
pub use worker::{EventKind, Operation, Vault, VaultEvent};
