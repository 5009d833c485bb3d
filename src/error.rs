//! Error types for the vault engine.
//!
//! Goals:
//! - One closed set of failure kinds. The engine dispatches rollback and
//!   event payloads on the kind, never on error text.
//! - Filesystem failures always carry the affected path and the OS error.
//! - `Logic` marks invariant violations (a bug, not an environment problem);
//!   it is still routed through the normal event path, never a panic.

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Missing or malformed configuration: unit JSON, unknown unit name,
    /// bad blob reference, unusable export/import target.
    #[error("config error: {0}")]
    Config(String),

    /// A filesystem operation failed.
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A unit handler exited non-zero (status is -1 when killed by signal).
    #[error("unit handler '{unit}' failed (status {status}): {stderr}")]
    Handler {
        unit: String,
        status: i32,
        stderr: String,
    },

    /// An underlying versioned-store operation failed.
    #[error("git {cmd} failed: {stderr}")]
    Vcs { cmd: String, stderr: String },

    /// Invariant violation; indicates a bug.
    #[error("logic error: {0}")]
    Logic(String),

    /// Operation invoked in the wrong state (e.g. vault not connected).
    #[error("invalid state: {0}")]
    State(String),
}

impl VaultError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VaultError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        VaultError::Config(msg.into())
    }

    pub fn logic<S: Into<String>>(msg: S) -> Self {
        VaultError::Logic(msg.into())
    }

    pub fn state<S: Into<String>>(msg: S) -> Self {
        VaultError::State(msg.into())
    }

    /// Short kind tag used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::Config(_) => "config",
            VaultError::Io { .. } => "io",
            VaultError::Handler { .. } => "handler",
            VaultError::Vcs { .. } => "vcs",
            VaultError::Logic(_) => "logic",
            VaultError::State(_) => "state",
        }
    }
}
