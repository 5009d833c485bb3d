//! Git adapter: the versioned store behind a vault.
//!
//! Every operation shells out to the git binary with the vault root as the
//! working directory. The working tree doubles as the transactional staging
//! area: either all added paths land in the resulting commit or none do.
//!
//! Snapshot tags are created annotated so they carry a tagger date, which
//! is what `list_tags` sorts on.

use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::error::{Result, VaultError};

/// Length of a content hash in hex form (SHA-1, as computed by git).
pub const HASH_HEX_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Stage new, modified and deleted paths (`--all`).
    All,
    /// Stage only paths already known to the index (`--update`).
    Update,
}

#[derive(Debug, Clone)]
pub struct Git {
    root: PathBuf,
    bin: String,
}

impl Git {
    pub fn new(root: impl Into<PathBuf>, bin: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bin: bin.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Locate the top of the working tree containing `start`.
    pub fn find_root(start: &Path, bin: &str) -> Result<PathBuf> {
        let out = run_in(bin, start, &["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out))
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        run_in(&self.bin, &self.root, args)
    }

    /// Initialize the repository and set the given config pairs.
    pub fn init(&self, config: &[(&str, &str)]) -> Result<()> {
        self.run(&["init", "-q"])?;
        for (key, value) in config {
            self.run(&["config", key, value])?;
        }
        Ok(())
    }

    pub fn add(&self, path: &Path, mode: AddMode) -> Result<()> {
        let path = path.to_string_lossy();
        let flag = match mode {
            AddMode::All => "--all",
            AddMode::Update => "--update",
        };
        self.run(&["add", flag, "--", &path]).map(|_| ())
    }

    /// True when `git status` reports no pending changes under `path`.
    pub fn status_clean(&self, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy();
        let out = self.run(&["status", "--porcelain", "--", &path])?;
        Ok(out.is_empty())
    }

    pub fn commit(&self, message: &str, allow_empty: bool) -> Result<()> {
        let mut args = vec!["commit", "-q", "-m", message];
        if allow_empty {
            args.push("--allow-empty");
        }
        self.run(&args).map(|_| ())
    }

    /// Create an annotated tag at HEAD.
    pub fn tag(&self, name: &str, message: &str) -> Result<()> {
        self.run(&["tag", "-a", "-m", message, name]).map(|_| ())
    }

    pub fn tag_delete(&self, name: &str) -> Result<()> {
        self.run(&["tag", "-d", name]).map(|_| ())
    }

    /// All tags, newest tagger date first.
    pub fn list_tags(&self) -> Result<Vec<String>> {
        let out = self.run(&["tag", "--list", "--sort=-taggerdate"])?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    pub fn branch_create(&self, name: &str) -> Result<()> {
        self.run(&["branch", name]).map(|_| ())
    }

    pub fn branch_delete(&self, name: &str) -> Result<()> {
        self.run(&["branch", "-D", name]).map(|_| ())
    }

    pub fn checkout(&self, refname: &str) -> Result<()> {
        self.run(&["checkout", "-q", refname]).map(|_| ())
    }

    /// Detach HEAD at the current commit (so a branch pointing here can be
    /// deleted while the working tree stays put).
    pub fn checkout_detach(&self) -> Result<()> {
        self.run(&["checkout", "-q", "--detach"]).map(|_| ())
    }

    /// Current branch name, or "HEAD" when detached.
    pub fn current_branch(&self) -> Result<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        self.run(&["rev-parse", "--verify", refname])
    }

    pub fn reset_hard(&self, refname: &str) -> Result<()> {
        self.run(&["reset", "-q", "--hard", refname]).map(|_| ())
    }

    /// Remove untracked files under `path` (rollback of staged exports).
    pub fn clean_force(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run(&["clean", "-q", "-fd", "--", &path]).map(|_| ())
    }

    pub fn notes_set(&self, refname: &str, text: &str) -> Result<()> {
        self.run(&["notes", "add", "-f", "-m", text, refname])
            .map(|_| ())
    }

    pub fn notes_get(&self, refname: &str) -> Result<String> {
        self.run(&["notes", "show", refname])
    }

    /// Remove the note attached to `refname`; a missing note is fine.
    pub fn notes_remove(&self, refname: &str) -> Result<()> {
        match self.run(&["notes", "remove", refname]) {
            Ok(_) => Ok(()),
            Err(VaultError::Vcs { stderr, .. }) if stderr.contains("no note found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Content hash of a file, without storing it.
    pub fn hash_object(&self, path: &Path) -> Result<String> {
        let path = path.to_string_lossy();
        let hash = self.run(&["hash-object", "--", &path])?;
        check_hash(&hash)?;
        Ok(hash)
    }

    /// Content hash of a file, storing the blob into the object database.
    pub fn hash_object_write(&self, path: &Path) -> Result<String> {
        let path = path.to_string_lossy();
        let hash = self.run(&["hash-object", "-w", "-t", "blob", "--", &path])?;
        check_hash(&hash)?;
        Ok(hash)
    }

    /// Register a blob already in the object database under `name`.
    pub fn update_index_cacheinfo(&self, mode: u32, hash: &str, name: &str) -> Result<()> {
        let cacheinfo = format!("{:o},{},{}", mode, hash, name);
        self.run(&["update-index", "--add", "--cacheinfo", &cacheinfo])
            .map(|_| ())
    }
}

fn run_in(bin: &str, cwd: &Path, args: &[&str]) -> Result<String> {
    debug!("git: {:?} (cwd={})", args, cwd.display());
    let vcs_err = |stderr: String| VaultError::Vcs {
        cmd: args.join(" "),
        stderr,
    };
    let out = Command::new(bin)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| vcs_err(e.to_string()))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        return Err(vcs_err(stderr));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn check_hash(hash: &str) -> Result<()> {
    if hash.len() != HASH_HEX_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(VaultError::Vcs {
            cmd: "hash-object".to_string(),
            stderr: format!("unexpected hash output: {}", hash),
        });
    }
    Ok(())
}
