//! Standalone content-addressed copy tool.
//!
//! Mirrors the copier the engine uses: `vault-copy --action=export -r -b
//! <src>... <dst>` copies trees into a vault (big payloads become blob
//! references), `--action=import` resolves references back into payloads.
//! The vault side of the transfer is `dst` for export and the first `src`
//! for import.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

use vault::blobstore::BlobStore;
use vault::config::VaultConfig;
use vault::copier::{self, Action, CopyOptions, DataHint, Depth, Deref, Overwrite, Processor};
use vault::fsutil::Stat;
use vault::vcs::Git;

#[derive(Parser, Debug)]
#[command(
    name = "vault-copy",
    version,
    about = "Copy trees into and out of a vault",
    arg_required_else_help = true
)]
struct Cli {
    /// The action passed by vault (export or import).
    #[arg(short, long)]
    action: String,

    /// Follow symlinks in src.
    #[arg(short = 'L', long)]
    dereference: bool,

    /// Do not overwrite an existing file.
    #[arg(short, long)]
    no_clobber: bool,

    /// Use blob mode.
    #[arg(short, long)]
    blobs: bool,

    /// Copy directories recursively.
    #[arg(short, long)]
    recursive: bool,

    /// Source paths followed by the destination directory.
    #[arg(required = true, num_args = 2..)]
    paths: Vec<PathBuf>,
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = VaultConfig::from_env();

    let (srcs, dst) = match cli.paths.split_last() {
        Some((dst, srcs)) if !srcs.is_empty() => (srcs, dst.clone()),
        _ => return Err(anyhow!("there is no src or dst")),
    };
    let action = copier::action_from_name(&cli.action)?;

    // The vault is the destination when exporting into it, the source when
    // importing out of it.
    let vault_hint = match action {
        Action::Import => srcs[0].clone(),
        Action::Export => dst.clone(),
    };
    let vault_root = Git::find_root(&vault_hint, &cfg.git_bin)
        .with_context(|| format!("no vault found around {}", vault_hint.display()))?;
    let git = Git::new(&vault_root, cfg.git_bin.clone());
    let store = BlobStore::new(&vault_root).with_fsync(cfg.blob_fsync);

    let opts = CopyOptions {
        store: &store,
        hasher: &git,
        data: if cli.blobs {
            DataHint::Big
        } else {
            DataHint::Compact
        },
        depth: if cli.recursive {
            Depth::Recursive
        } else {
            Depth::Shallow
        },
        overwrite: if cli.no_clobber {
            Overwrite::No
        } else {
            Overwrite::Yes
        },
        deref: if cli.dereference {
            Deref::Yes
        } else {
            Deref::No
        },
    };

    let mut processor = Processor::new(opts, action);
    let dst_stat = Stat::of(&dst)?;
    for src in srcs {
        processor.add(Stat::of(src)?, dst_stat.clone());
    }
    processor.execute()?;
    Ok(())
}

fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run() {
        error!("{:?}", e);
        std::process::exit(1);
    }
}
