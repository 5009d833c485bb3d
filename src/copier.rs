//! Content-addressed tree copier.
//!
//! A deque-driven walk over (src, dst) pairs. Children of a directory are
//! inserted at the front of the deque as a block, preserving enumeration
//! order, so a subtree finishes before its parent's later siblings
//! (depth-first). A visited set keyed by (src node, dst node) breaks cycles.
//!
//! Two data modes:
//! - Compact: bytes are copied inline, destination inherits the source's
//!   permissions and mtime.
//! - Big: on export the payload goes into the blob store and the
//!   destination becomes a small reference file holding the 40-hex hash;
//!   on import the reference is resolved back into full bytes.
//!
//! The walk may run "in place" (dst subtree == src subtree): export hashes
//! a file before rewriting it, so converting a staging directory into
//! references is a single traversal.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs;

use log::{debug, info, warn};

use crate::blobstore::{self, BlobStore};
use crate::error::{Result, VaultError};
use crate::fsutil::{self, FileId, FileType, Stat};
use crate::metrics;
use crate::vcs::Git;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Import,
    Export,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Import => write!(f, "import"),
            Action::Export => write!(f, "export"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataHint {
    Compact,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Shallow,
    Recursive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    No,
    Yes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deref {
    No,
    Yes,
}

/// Options for one copy operation. The vault side (blob store + hasher) is
/// borrowed for the duration of the operation.
#[derive(Clone, Copy)]
pub struct CopyOptions<'a> {
    pub store: &'a BlobStore,
    pub hasher: &'a Git,
    pub data: DataHint,
    pub depth: Depth,
    pub overwrite: Overwrite,
    pub deref: Deref,
}

/// One walked entry: where to read and the directory to place it in.
#[derive(Debug, Clone)]
struct Context {
    src: Stat,
    dst: Stat,
}

enum End {
    Front,
    Back,
}

pub struct Processor<'a> {
    opts: CopyOptions<'a>,
    action: Action,
    todo: VecDeque<Context>,
    visited: HashSet<(FileId, FileId)>,
}

impl<'a> Processor<'a> {
    pub fn new(opts: CopyOptions<'a>, action: Action) -> Self {
        Self {
            opts,
            action,
            todo: VecDeque::new(),
            visited: HashSet::new(),
        }
    }

    /// Seed the work list. `dst` must be an existing directory.
    pub fn add(&mut self, src: Stat, dst: Stat) {
        self.enqueue(Context { src, dst }, End::Back);
    }

    fn enqueue(&mut self, ctx: Context, end: End) {
        debug!(
            "copy: queueing {} -> {}",
            ctx.src.path().display(),
            ctx.dst.path().display()
        );
        let is_dir = matches!(ctx.src.file_type(), Ok(FileType::Dir));
        if is_dir && self.opts.depth == Depth::Shallow {
            info!("copy: omitting directory {}", ctx.src.path().display());
            return;
        }
        match end {
            End::Front => self.todo.push_front(ctx),
            End::Back => self.todo.push_back(ctx),
        }
    }

    pub fn execute(&mut self) -> Result<()> {
        while let Some(mut ctx) = self.todo.pop_front() {
            debug!("copy: processing {}", ctx.src.path().display());
            ctx.dst.refresh()?;

            let ty = ctx.src.file_type()?;
            if ty == FileType::Absent {
                warn!("copy: source vanished {}", ctx.src.path().display());
                continue;
            }
            let key = (ctx.src.id()?, ctx.dst.id()?);
            if self.visited.contains(&key) {
                info!(
                    "copy: skip duplicate {} -> {}",
                    ctx.src.path().display(),
                    ctx.dst.path().display()
                );
                continue;
            }

            match ty {
                FileType::Symlink => self.on_symlink(&ctx)?,
                FileType::Dir => self.on_dir(&ctx)?,
                FileType::File => self.on_file(&ctx)?,
                other => {
                    warn!(
                        "copy: no handler for {:?} {}",
                        other,
                        ctx.src.path().display()
                    );
                }
            }
            self.visited.insert(key);
        }
        Ok(())
    }

    fn on_symlink(&mut self, ctx: &Context) -> Result<()> {
        let target = fsutil::read_link(ctx.src.path())?;
        if self.opts.deref == Deref::Yes {
            // Replace the link with its resolved target and process that
            // before later siblings. The visited check then runs against
            // the resolved node.
            let resolved = if target.is_absolute() {
                target
            } else {
                match ctx.src.path().parent() {
                    Some(parent) => parent.join(target),
                    None => target,
                }
            };
            let next = Context {
                src: Stat::of(resolved)?,
                dst: ctx.dst.clone(),
            };
            self.enqueue(next, End::Front);
        } else {
            let link = ctx.dst.path().join(fsutil::basename(ctx.src.path())?);
            if Stat::of(&link)?.exists() {
                if self.opts.overwrite == Overwrite::No {
                    debug!("copy: keep existing {}", link.display());
                    metrics::record_copy_skipped();
                    return Ok(());
                }
                fsutil::unlink(&link)?;
            }
            fsutil::make_symlink(&target, &link)?;
            metrics::record_symlink_copied();
        }
        Ok(())
    }

    fn on_dir(&mut self, ctx: &Context) -> Result<()> {
        let dst = fsutil::mkdir_similar(&ctx.src, &ctx.dst)?;
        if self.opts.overwrite == Overwrite::Yes {
            fsutil::copy_utime(dst.path(), &ctx.src)?;
        }

        let entries = fs::read_dir(ctx.src.path())
            .map_err(|e| VaultError::io("readdir", ctx.src.path(), e))?;
        let mut batch = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| VaultError::io("readdir", ctx.src.path(), e))?;
            debug!("copy: entry {}", entry.file_name().to_string_lossy());
            batch.push(Context {
                src: Stat::of(entry.path())?,
                dst: dst.clone(),
            });
        }
        // Front-insert the whole batch, preserving enumeration order.
        for item in batch.into_iter().rev() {
            self.enqueue(item, End::Front);
        }
        Ok(())
    }

    fn on_file(&mut self, ctx: &Context) -> Result<()> {
        debug!(
            "copy: file {} -> {}",
            ctx.src.path().display(),
            ctx.dst.path().display()
        );
        let dst_path = ctx.dst.path().join(fsutil::basename(ctx.src.path())?);
        let dst_stat = Stat::of(&dst_path)?;
        if dst_stat.exists() {
            if self.opts.overwrite == Overwrite::No {
                debug!("copy: keep existing {}", dst_path.display());
                metrics::record_copy_skipped();
                return Ok(());
            }
            match dst_stat.file_type()? {
                FileType::File => {}
                FileType::Symlink => fsutil::unlink(&dst_path)?,
                other => {
                    warn!(
                        "copy: destination is {:?}, leaving {}",
                        other,
                        dst_path.display()
                    );
                    return Ok(());
                }
            }
        }

        match self.opts.data {
            DataHint::Compact => fsutil::copy_data(&dst_path, &ctx.src, Some(ctx.src.mode()?))?,
            DataHint::Big => self.copy_blob(&dst_path, &ctx.src)?,
        }
        fsutil::copy_utime(&dst_path, &ctx.src)?;
        metrics::record_file_copied(ctx.src.size()?);
        Ok(())
    }

    fn copy_blob(&self, dst_path: &std::path::Path, from: &Stat) -> Result<()> {
        match self.action {
            Action::Export => {
                let hash = self.opts.hasher.hash_object(from.path())?;
                self.opts.store.write_blob(&hash, from)?;
                fsutil::rewrite(dst_path, &hash, from.mode()?)?;
            }
            Action::Import => {
                let hash = blobstore::read_reference(from.path())?;
                let blob = Stat::of(self.opts.store.blob_path(&hash)?)?;
                fsutil::copy_data(dst_path, &blob, Some(from.mode()?))?;
            }
        }
        Ok(())
    }
}

pub fn action_from_name(name: &str) -> Result<Action> {
    match name {
        "import" => Ok(Action::Import),
        "export" => Ok(Action::Export),
        _ => Err(VaultError::config(format!("unknown action: {}", name))),
    }
}
