//! Centralized configuration for a vault instance.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - VaultConfig::from_env() reads the VAULT_* variables; builder-style
//!   with_* setters allow explicit overrides on top.

use std::fmt;
use std::path::PathBuf;

/// Top-level configuration consumed by the engine and the blob store.
#[derive(Clone, Debug)]
pub struct VaultConfig {
    /// Git binary driving the versioned store.
    /// Env: VAULT_GIT_BIN (default "git")
    pub git_bin: String,

    /// Committer identity configured on `init` (commits, tags and notes
    /// all need one).
    /// Env: VAULT_GIT_NAME / VAULT_GIT_EMAIL
    pub git_name: String,
    pub git_email: String,

    /// Whether to fsync blobs right after they are written to the store.
    /// The store is idempotent, so a torn blob only costs a rewrite on the
    /// next run; the default is off.
    /// Env: VAULT_BLOB_FSYNC = 0|1|true|false (default false)
    pub blob_fsync: bool,

    /// Default HOME override passed to unit handlers (per-unit `home`
    /// takes precedence).
    /// Env: VAULT_HOME
    pub home: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            git_bin: "git".to_string(),
            git_name: "Vault".to_string(),
            git_email: "vault@localhost".to_string(),
            blob_fsync: false,
            home: None,
        }
    }
}

impl VaultConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("VAULT_GIT_BIN") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.git_bin = s.to_string();
            }
        }

        if let Ok(v) = std::env::var("VAULT_GIT_NAME") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.git_name = s.to_string();
            }
        }

        if let Ok(v) = std::env::var("VAULT_GIT_EMAIL") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.git_email = s.to_string();
            }
        }

        if let Ok(v) = std::env::var("VAULT_BLOB_FSYNC") {
            let s = v.trim().to_ascii_lowercase();
            cfg.blob_fsync = s == "1" || s == "true" || s == "on" || s == "yes";
        }

        if let Ok(v) = std::env::var("VAULT_HOME") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.home = Some(PathBuf::from(s));
            }
        }

        cfg
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_git_bin<S: Into<String>>(mut self, bin: S) -> Self {
        self.git_bin = bin.into();
        self
    }

    pub fn with_git_identity<S: Into<String>>(mut self, name: S, email: S) -> Self {
        self.git_name = name.into();
        self.git_email = email.into();
        self
    }

    pub fn with_blob_fsync(mut self, on: bool) -> Self {
        self.blob_fsync = on;
        self
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }
}

impl fmt::Display for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VaultConfig {{ git_bin: {}, blob_fsync: {}, home: {} }}",
            self.git_bin,
            self.blob_fsync,
            self.home
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "default(inherit)".to_string()),
        )
    }
}
