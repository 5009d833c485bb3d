//! Command-line front-end: a thin wrapper over the worker handle.
//!
//! The CLI submits one operation, then drains the event stream until the
//! operation's done/error report arrives. Exit code 0 on success; a failed
//! operation surfaces as a single-line diagnostic and exit code 1.

use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use log::info;
use serde_json::{Map, Value};

use crate::config::VaultConfig;
use crate::engine::MediaAction;
use crate::worker::{EventKind, Operation, Vault, VaultEvent};

#[derive(Parser, Debug)]
#[command(
    name = "vault",
    version,
    about = "Incremental content-addressed backup engine",
    arg_required_else_help = true
)]
pub struct Cli {
    /// What to do with the vault.
    #[arg(short, long, value_enum)]
    action: CliAction,

    /// Vault root directory.
    #[arg(short, long)]
    vault: PathBuf,

    /// HOME override passed to unit handlers.
    #[arg(short = 'H', long)]
    home: Option<PathBuf>,

    /// Backup message.
    #[arg(short, long)]
    message: Option<String>,

    /// Snapshot tag (restore, remove-snapshot).
    #[arg(short, long)]
    snapshot: Option<String>,

    /// Units to operate on (default: all registered).
    #[arg(short, long, value_delimiter = ',')]
    units: Vec<String>,

    /// External directory for export/import.
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Unit name for register-unit.
    #[arg(long)]
    unit_name: Option<String>,

    /// Unit handler script for register-unit.
    #[arg(long)]
    unit_script: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliAction {
    Init,
    Backup,
    Restore,
    ListSnapshots,
    RemoveSnapshot,
    RegisterUnit,
    Units,
    Export,
    Import,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let (event_tx, event_rx) = mpsc::channel();
    let vault = Vault::open(
        &cli.vault,
        cli.home.clone(),
        VaultConfig::from_env(),
        move |event| {
            let _ = event_tx.send(event);
        },
    )?;

    vault.connect()?;
    wait_done(&event_rx, Operation::Connect)?;

    match cli.action {
        CliAction::Init => {
            println!("Initialized vault at {}", cli.vault.display());
        }
        CliAction::Backup => {
            let message = cli.message.clone().unwrap_or_default();
            vault.start_backup(&message, &cli.units)?;
            let data = wait_done(&event_rx, Operation::Backup)?;
            println!("{}", text_field(&data, "snapshot"));
        }
        CliAction::Restore => {
            let snapshot = require(&cli.snapshot, "--snapshot")?;
            vault.start_restore(snapshot, &cli.units)?;
            wait_done(&event_rx, Operation::Restore)?;
            println!("Restored {}", snapshot);
        }
        CliAction::ListSnapshots => {
            for snapshot in vault.snapshots()? {
                println!("{}", snapshot);
            }
        }
        CliAction::RemoveSnapshot => {
            let snapshot = require(&cli.snapshot, "--snapshot")?;
            vault.remove_snapshot(snapshot)?;
            wait_done(&event_rx, Operation::RemoveSnapshot)?;
            println!("Removed {}", snapshot);
        }
        CliAction::RegisterUnit => {
            let name = require(&cli.unit_name, "--unit-name")?;
            let script = require(&cli.unit_script, "--unit-script")?;
            let mut data = Map::new();
            data.insert("name".to_string(), Value::String(name.clone()));
            data.insert(
                "script".to_string(),
                Value::String(script.display().to_string()),
            );
            let updated = vault.register_unit(data)?;
            println!(
                "{} {}",
                if updated { "Registered" } else { "Unchanged" },
                name
            );
        }
        CliAction::Units => {
            for (name, unit) in vault.units()? {
                println!("{}\t{}", name, unit.script());
            }
        }
        CliAction::Export | CliAction::Import => {
            let dir = require(&cli.dir, "--dir")?;
            let media_action = if cli.action == CliAction::Export {
                MediaAction::Export
            } else {
                MediaAction::Import
            };
            vault.export_import_prepare(media_action, dir)?;
            let plan = wait_done(&event_rx, Operation::ExportImportPrepare)?;
            info!(
                "media: {} bytes required, {} available",
                text_or_number(&plan, "required_bytes"),
                text_or_number(&plan, "available_bytes")
            );
            vault.export_import_execute()?;
            wait_done(&event_rx, Operation::ExportImportExecute)?;
            println!("{:?} finished: {}", media_action, dir.display());
        }
    }
    Ok(())
}

/// Drain events until `operation` reports done or error.
fn wait_done(rx: &mpsc::Receiver<VaultEvent>, operation: Operation) -> Result<Map<String, Value>> {
    loop {
        let event = rx
            .recv()
            .map_err(|_| anyhow!("vault worker stopped unexpectedly"))?;
        if event.operation != operation {
            continue;
        }
        match event.kind {
            EventKind::Progress => {
                info!("{}: {}", operation, compact(&event.data));
            }
            EventKind::Done => return Ok(event.data),
            EventKind::Error => {
                return Err(anyhow!("{} failed: {}", operation, text_field(&event.data, "msg")))
            }
        }
    }
}

fn require<'a, T>(value: &'a Option<T>, flag: &str) -> Result<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| anyhow!("{} is required for this action", flag))
}

fn text_field<'a>(data: &'a Map<String, Value>, key: &str) -> &'a str {
    match data.get(key) {
        Some(Value::String(s)) => s,
        _ => "?",
    }
}

fn text_or_number(data: &Map<String, Value>, key: &str) -> String {
    data.get(key).map(|v| v.to_string()).unwrap_or_default()
}

fn compact(data: &Map<String, Value>) -> String {
    data.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}
