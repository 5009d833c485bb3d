//! Snapshot engine: orchestrates backup, restore, snapshot removal and
//! media export/import across units.
//!
//! Model:
//! - Backup stages every selected unit on a temporary branch, commits once
//!   (all units or nothing), tags the commit with a generated UTC name and
//!   stores the message in notes. On failure the working tree is reset to
//!   the pre-operation HEAD and the temporary branch is dropped.
//! - After a successful backup HEAD stays detached at the snapshot commit,
//!   so the next backup chains on top of it.
//! - Restore checks the tag out, materializes blob references back into
//!   payloads and lets each unit handler import its state. Unit failures
//!   are reported per unit; the restore moves on.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{Map, Value};

use crate::blobstore::BlobStore;
use crate::config::VaultConfig;
use crate::copier::{Action, CopyOptions, DataHint, Depth, Deref, Overwrite, Processor};
use crate::error::{Result, VaultError};
use crate::fsutil::{self, FileType, Stat};
use crate::metrics;
use crate::units::{Registry, Unit, MODULES_DIR};
use crate::vcs::{AddMode, Git};

/// Per-unit staging subdirectories inside the vault working tree.
pub const DATA_SUBDIR: &str = "data";
pub const BIN_SUBDIR: &str = "blobs";

/// Marker file committed on init so the repository always has a HEAD.
const ANCHOR_FILE: &str = ".vault";
const ANCHOR_CONTENT: &str = "1\n";

/// Progress sink for one running operation.
pub type Emit<'a> = &'a mut dyn FnMut(Map<String, Value>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
    Export,
    Import,
}

impl std::fmt::Display for MediaAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaAction::Export => write!(f, "export"),
            MediaAction::Import => write!(f, "import"),
        }
    }
}

/// Outcome of ExportImportPrepare, consumed by ExportImportExecute.
#[derive(Debug, Clone)]
pub struct MediaPlan {
    pub action: MediaAction,
    pub path: PathBuf,
    pub required_bytes: u64,
    pub available_bytes: u64,
}

pub struct Engine {
    cfg: VaultConfig,
    root: PathBuf,
    home: Option<PathBuf>,
    git: Git,
    store: BlobStore,
    registry: Option<Registry>,
    media: Option<MediaPlan>,
}

impl Engine {
    pub fn new(root: impl Into<PathBuf>, home: Option<PathBuf>, cfg: VaultConfig) -> Self {
        let root = root.into();
        let git = Git::new(&root, cfg.git_bin.clone());
        let store = BlobStore::new(&root).with_fsync(cfg.blob_fsync);
        Self {
            cfg,
            root,
            home,
            git,
            store,
            registry: None,
            media: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_connected(&self) -> bool {
        self.registry.is_some()
    }

    fn registry(&self) -> Result<&Registry> {
        self.registry
            .as_ref()
            .ok_or_else(|| VaultError::state("vault is not connected"))
    }

    fn modules_dir(&self) -> PathBuf {
        self.root.join(MODULES_DIR)
    }

    /// Branch name to come back to, or the commit id when HEAD is detached.
    fn head_ref(&self) -> Result<String> {
        let branch = self.git.current_branch()?;
        if branch == "HEAD" {
            self.git.rev_parse("HEAD")
        } else {
            Ok(branch)
        }
    }

    /// Ensure the vault root exists, initialize the store if absent and
    /// load the unit registry.
    pub fn connect(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| VaultError::io("mkdir", &self.root, e))?;
        if fsutil::file_type(&self.root.join(".git"))? == FileType::Absent {
            info!("vault: initializing storage, root={}", self.root.display());
            self.git.init(&[
                ("user.name", self.cfg.git_name.as_str()),
                ("user.email", self.cfg.git_email.as_str()),
            ])?;
            let anchor = self.root.join(ANCHOR_FILE);
            fsutil::rewrite(&anchor, ANCHOR_CONTENT, 0o644)?;
            self.git.add(&anchor, AddMode::All)?;
            self.git.commit("anchor", false)?;
        }
        self.registry = Some(Registry::load(self.modules_dir())?);
        info!("vault: connected, root={}", self.root.display());
        Ok(())
    }

    // ----- unit registry (vault level) -----

    pub fn units(&self) -> Result<BTreeMap<String, Unit>> {
        Ok(self.registry()?.units().clone())
    }

    /// Register or update a unit; commits `+name` when the tree changed.
    pub fn register_unit(&mut self, data: Map<String, Value>) -> Result<bool> {
        let registry = self
            .registry
            .as_mut()
            .ok_or_else(|| VaultError::state("vault is not connected"))?;
        if !registry.set(data.clone())? {
            return Ok(false);
        }
        let name = match data.get("name") {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        let modules = self.modules_dir();
        self.git.add(&modules, AddMode::All)?;
        if !self.git.status_clean(&modules)? {
            self.git.commit(&format!("+{}", name), false)?;
        }
        info!("units: registered {}", name);
        Ok(true)
    }

    /// Remove a unit; commits `-name`. A removal that leaves the tree clean
    /// is an invariant violation.
    pub fn remove_unit(&mut self, name: &str) -> Result<bool> {
        let registry = self
            .registry
            .as_mut()
            .ok_or_else(|| VaultError::state("vault is not connected"))?;
        let fname = match registry.remove(name)? {
            Some(f) => f,
            None => return Ok(false),
        };
        let path = registry.dir().join(fname);
        let modules = self.modules_dir();
        self.git.add(&path, AddMode::Update)?;
        if self.git.status_clean(&modules)? {
            return Err(VaultError::logic(format!(
                "removing unit '{}' left the tree clean",
                name
            )));
        }
        self.git.commit(&format!("-{}", name), false)?;
        info!("units: removed {}", name);
        Ok(true)
    }

    // ----- snapshots -----

    pub fn snapshots(&self) -> Result<Vec<String>> {
        self.registry()?;
        self.git.list_tags()
    }

    pub fn notes(&self, snapshot: &str) -> Result<String> {
        self.registry()?;
        self.git.notes_get(snapshot)
    }

    pub fn reset_head(&mut self) -> Result<()> {
        self.registry()?;
        self.git.reset_hard("HEAD")
    }

    /// Back up the selected units (all registered units when empty) as one
    /// atomic snapshot. Returns the generated snapshot name.
    pub fn backup(&mut self, message: &str, units: &[String], emit: Emit) -> Result<String> {
        // git rejects empty commit and note messages.
        let message = if message.is_empty() { "backup" } else { message };
        let selected = resolve_units(self.registry()?, units)?;
        info!(
            "backup: start, root={}, units={}",
            self.root.display(),
            selected.len()
        );

        let prior = self.head_ref()?;
        let tmp = format!(
            "backup-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            std::process::id()
        );
        self.git.branch_create(&tmp)?;
        self.git.checkout(&tmp)?;

        match self.backup_units(&selected, message, emit) {
            Ok(snapshot) => {
                // Stay on the snapshot commit (detached) so the branch can
                // go away and the next backup chains on top.
                self.git.checkout_detach()?;
                self.git.branch_delete(&tmp)?;
                metrics::record_backup_done();
                info!("backup: done, snapshot={}", snapshot);
                Ok(snapshot)
            }
            Err(e) => {
                warn!("backup: failed, rolling back: {}", e);
                let _ = self.git.reset_hard("HEAD");
                for unit in &selected {
                    let _ = self.git.clean_force(&self.root.join(unit.name()));
                }
                let _ = self.git.checkout(&prior);
                let _ = self.git.branch_delete(&tmp);
                Err(e)
            }
        }
    }

    fn backup_units(&self, units: &[Unit], message: &str, emit: Emit) -> Result<String> {
        for unit in units {
            emit(unit_stage(unit.name(), "start"));
            let unit_root = self.root.join(unit.name());
            // Stale staging from the previous snapshot must not leak into
            // this one (a leftover reference would be re-hashed as text).
            if unit_root.exists() {
                fs::remove_dir_all(&unit_root)
                    .map_err(|e| VaultError::io("rmdir", &unit_root, e))?;
            }
            let data_dir = unit_root.join(DATA_SUBDIR);
            let bin_dir = unit_root.join(BIN_SUBDIR);
            fs::create_dir_all(&data_dir).map_err(|e| VaultError::io("mkdir", &data_dir, e))?;
            fs::create_dir_all(&bin_dir).map_err(|e| VaultError::io("mkdir", &bin_dir, e))?;

            self.run_handler(unit, Action::Export, &data_dir, &bin_dir)?;
            // Large payloads staged under blobs/ become content-addressed
            // references before the tree is committed.
            self.convert_staging(&unit_root, &bin_dir, Action::Export)?;
            self.git.add(&unit_root, AddMode::All)?;
            emit(unit_stage(unit.name(), "done"));
        }

        self.git.commit(message, true)?;
        let snapshot = self.snapshot_name()?;
        self.git.tag(&snapshot, message)?;
        self.git.notes_set(&snapshot, message)?;
        Ok(snapshot)
    }

    /// Restore the named snapshot for the selected units (all units in the
    /// snapshot when empty). Per-unit failures are reported through `emit`
    /// and do not abort the remaining units.
    pub fn restore(&mut self, snapshot: &str, units: &[String], emit: Emit) -> Result<()> {
        self.registry()?;
        self.git.rev_parse(&format!("refs/tags/{}", snapshot))?;
        let prior = self.head_ref()?;
        info!("restore: start, snapshot={}", snapshot);

        self.git.checkout(snapshot)?;
        let outcome = self.restore_units(units, emit);

        // Return the tree to the prior state even when restore failed; the
        // materialized payloads are scratch data.
        let _ = self.git.reset_hard("HEAD");
        let back = self.git.checkout(&prior);
        self.registry = Some(Registry::load(self.modules_dir())?);

        outcome?;
        back?;
        metrics::record_restore_done();
        info!("restore: done, snapshot={}", snapshot);
        Ok(())
    }

    fn restore_units(&self, units: &[String], emit: Emit) -> Result<()> {
        // Unit descriptions come from the snapshot's own registry, not the
        // live one.
        let registry = Registry::load(self.modules_dir())?;
        let selected = resolve_units(&registry, units)?;
        for unit in &selected {
            emit(unit_stage(unit.name(), "start"));
            match self.restore_unit(unit) {
                Ok(()) => emit(unit_stage(unit.name(), "done")),
                Err(e) => {
                    warn!("restore: unit {} failed: {}", unit.name(), e);
                    emit(unit_error(unit.name(), &e));
                }
            }
        }
        Ok(())
    }

    fn restore_unit(&self, unit: &Unit) -> Result<()> {
        let unit_root = self.root.join(unit.name());
        let data_dir = unit_root.join(DATA_SUBDIR);
        let bin_dir = unit_root.join(BIN_SUBDIR);
        // Empty staging directories are not versioned; recreate them so
        // handlers always see both.
        fs::create_dir_all(&data_dir).map_err(|e| VaultError::io("mkdir", &data_dir, e))?;
        fs::create_dir_all(&bin_dir).map_err(|e| VaultError::io("mkdir", &bin_dir, e))?;

        self.convert_staging(&unit_root, &bin_dir, Action::Import)?;
        self.run_handler(unit, Action::Import, &data_dir, &bin_dir)
    }

    /// Remove a snapshot tag and its note. The commit stays around as
    /// garbage; blobs are shared and never eagerly removed.
    pub fn remove_snapshot(&mut self, name: &str) -> Result<()> {
        self.registry()?;
        let tag_object = self.git.rev_parse(&format!("refs/tags/{}", name))?;
        self.git.tag_delete(name)?;
        self.git.notes_remove(&tag_object)?;
        metrics::record_snapshot_removed();
        info!("remove-snapshot: {} removed", name);
        Ok(())
    }

    // ----- media export/import -----

    /// Validate a media transfer and remember the plan for execute.
    pub fn export_import_prepare(&mut self, action: MediaAction, path: &Path) -> Result<MediaPlan> {
        self.registry()?;
        let stat = Stat::of(path)?;
        if stat.file_type()? != FileType::Dir {
            return Err(VaultError::config(format!(
                "media target is not a directory: {}",
                path.display()
            )));
        }
        let (src_root, dst_root) = match action {
            MediaAction::Export => (self.root.clone(), path.to_path_buf()),
            MediaAction::Import => (path.to_path_buf(), self.root.clone()),
        };
        if action == MediaAction::Import
            && fsutil::file_type(&src_root.join(".git"))? != FileType::Dir
        {
            return Err(VaultError::config(format!(
                "{} does not look like an exported vault",
                src_root.display()
            )));
        }

        let required = fsutil::tree_size(&src_root);
        let available = match fs2::available_space(&dst_root) {
            Ok(v) => v,
            Err(e) => {
                // Best-effort: some filesystems cannot answer.
                warn!(
                    "media: free-space check failed for {}: {}",
                    dst_root.display(),
                    e
                );
                u64::MAX
            }
        };
        if available < required {
            return Err(VaultError::config(format!(
                "not enough free space on {}: need {} bytes, have {}",
                dst_root.display(),
                required,
                available
            )));
        }

        let plan = MediaPlan {
            action,
            path: path.to_path_buf(),
            required_bytes: required,
            available_bytes: available,
        };
        info!(
            "media: prepared {}, path={}, required={}, available={}",
            action,
            path.display(),
            required,
            available
        );
        self.media = Some(plan.clone());
        Ok(plan)
    }

    /// Execute the previously prepared transfer.
    ///
    /// The blob store travels verbatim (it is already content-addressed);
    /// every other top-level entry goes through the external side's store
    /// in Big mode, so re-exports deduplicate against media content and the
    /// media stays self-contained.
    pub fn export_import_execute(&mut self) -> Result<MediaPlan> {
        self.registry()?;
        let plan = self
            .media
            .take()
            .ok_or_else(|| VaultError::state("no prepared export/import"))?;
        let (src_root, dst_root, action) = match plan.action {
            MediaAction::Export => (self.root.clone(), plan.path.clone(), Action::Export),
            MediaAction::Import => (plan.path.clone(), self.root.clone(), Action::Import),
        };
        info!(
            "media: {} start, {} -> {}",
            plan.action,
            src_root.display(),
            dst_root.display()
        );

        let dst_stat = Stat::of(&dst_root)?;
        let blobs_src = src_root.join(crate::blobstore::BLOBS_DIR);
        if fsutil::file_type(&blobs_src)? == FileType::Dir {
            let opts = CopyOptions {
                store: &self.store,
                hasher: &self.git,
                data: DataHint::Compact,
                depth: Depth::Recursive,
                overwrite: Overwrite::Yes,
                deref: Deref::No,
            };
            let mut processor = Processor::new(opts, action);
            processor.add(Stat::of(&blobs_src)?, dst_stat.clone());
            processor.execute()?;
        }

        let store = BlobStore::new(&plan.path).with_fsync(self.cfg.blob_fsync);
        let opts = CopyOptions {
            store: &store,
            hasher: &self.git,
            data: DataHint::Big,
            depth: Depth::Recursive,
            overwrite: Overwrite::Yes,
            deref: Deref::No,
        };
        let mut processor = Processor::new(opts, action);
        let entries =
            fs::read_dir(&src_root).map_err(|e| VaultError::io("readdir", &src_root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| VaultError::io("readdir", &src_root, e))?;
            if entry.file_name() == crate::blobstore::BLOBS_DIR {
                continue;
            }
            processor.add(Stat::of(entry.path())?, dst_stat.clone());
        }
        processor.execute()?;

        if plan.action == MediaAction::Import {
            self.registry = Some(Registry::load(self.modules_dir())?);
        }
        info!("media: {} done, path={}", plan.action, plan.path.display());
        Ok(plan)
    }

    // ----- internals -----

    /// Convert a unit's `blobs/` staging subtree in place: export turns
    /// payloads into references, import turns references back into
    /// payloads. A missing subtree is fine (no big payloads).
    fn convert_staging(&self, unit_root: &Path, bin_dir: &Path, action: Action) -> Result<()> {
        let src = Stat::of(bin_dir)?;
        if !src.exists() {
            debug!("staging: nothing under {}", bin_dir.display());
            return Ok(());
        }
        let opts = CopyOptions {
            store: &self.store,
            hasher: &self.git,
            data: DataHint::Big,
            depth: Depth::Recursive,
            overwrite: Overwrite::Yes,
            deref: Deref::No,
        };
        let mut processor = Processor::new(opts, action);
        processor.add(src, Stat::of(unit_root)?);
        processor.execute()
    }

    fn run_handler(
        &self,
        unit: &Unit,
        action: Action,
        data_dir: &Path,
        bin_dir: &Path,
    ) -> Result<()> {
        let script = unit.script();
        let mut cmd = Command::new(script);
        cmd.arg(format!("--action={}", action))
            .arg(format!("--dir={}", data_dir.display()))
            .arg(format!("--bin-dir={}", bin_dir.display()));
        let home: Option<PathBuf> = unit
            .home()
            .map(PathBuf::from)
            .or_else(|| self.home.clone())
            .or_else(|| self.cfg.home.clone());
        if let Some(home) = home {
            cmd.arg(format!("--home-dir={}", home.display()));
            cmd.env("HOME", &home);
        }
        for (key, value) in unit.passthrough() {
            cmd.arg(format!("--{}={}", key, flag_value(value)));
        }

        info!("unit {}: running handler, action={}", unit.name(), action);
        metrics::record_handler_run();
        let out = cmd
            .output()
            .map_err(|e| VaultError::io("spawn handler", Path::new(script), e))?;
        if !out.status.success() {
            metrics::record_handler_failure();
            return Err(VaultError::Handler {
                unit: unit.name().to_string(),
                status: out.status.code().unwrap_or(-1),
                stderr: stderr_tail(&out.stderr),
            });
        }
        debug!("unit {}: handler ok", unit.name());
        Ok(())
    }

    /// Snapshot names are second-resolution UTC timestamps, uniquified with
    /// the smallest free -NN suffix.
    fn snapshot_name(&self) -> Result<String> {
        let base = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let taken: HashSet<String> = self.git.list_tags()?.into_iter().collect();
        if !taken.contains(&base) {
            return Ok(base);
        }
        for nn in 1u32..10_000 {
            let candidate = format!("{}-{:02}", base, nn);
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(VaultError::logic(format!(
            "snapshot name space exhausted for {}",
            base
        )))
    }
}

fn resolve_units(registry: &Registry, names: &[String]) -> Result<Vec<Unit>> {
    if names.is_empty() {
        return Ok(registry.units().values().cloned().collect());
    }
    names
        .iter()
        .map(|name| {
            registry
                .get(name)
                .cloned()
                .ok_or_else(|| VaultError::config(format!("unknown unit: {}", name)))
        })
        .collect()
}

fn unit_stage(unit: &str, stage: &str) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("unit".to_string(), Value::String(unit.to_string()));
    data.insert("stage".to_string(), Value::String(stage.to_string()));
    data
}

fn unit_error(unit: &str, err: &VaultError) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("unit".to_string(), Value::String(unit.to_string()));
    data.insert("error".to_string(), Value::String(err.kind().to_string()));
    data.insert("msg".to_string(), Value::String(err.to_string()));
    data
}

fn flag_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Last chunk of handler stderr, kept short for event payloads.
fn stderr_tail(bytes: &[u8]) -> String {
    const TAIL_BYTES: usize = 1024;
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
