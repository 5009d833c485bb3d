// tests/export_import.rs
//
// Media roundtrip: export a vault to an external directory, import it into
// a fresh vault, and check that snapshots, notes and restored content all
// survive the trip.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value};

use vault::config::VaultConfig;
use vault::engine::MediaAction;
use vault::worker::{EventKind, Operation, Vault, VaultEvent};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("vault-media-{}-{}-{}", prefix, pid, t))
}

fn write_handler(path: &Path, live: &Path) {
    let body = format!(
        r#"#!/bin/sh
set -e
action=""; dir=""; bindir=""
for arg in "$@"; do
  case "$arg" in
    --action=*) action="${{arg#--action=}}" ;;
    --dir=*) dir="${{arg#--dir=}}" ;;
    --bin-dir=*) bindir="${{arg#--bin-dir=}}" ;;
  esac
done
live="{live}"
case "$action" in
  export)
    if [ -d "$live/data" ]; then cp -pR "$live/data/." "$dir/"; fi
    if [ -d "$live/big" ]; then cp -pR "$live/big/." "$bindir/"; fi
    ;;
  import)
    mkdir -p "$live/data" "$live/big"
    cp -pR "$dir/." "$live/data/"
    cp -pR "$bindir/." "$live/big/"
    ;;
  *) exit 2 ;;
esac
"#,
        live = live.display()
    );
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn open_vault(root: &Path) -> Result<(Vault, mpsc::Receiver<VaultEvent>)> {
    let (tx, rx) = mpsc::channel();
    let vault = Vault::open(root, None, VaultConfig::default(), move |event| {
        let _ = tx.send(event);
    })?;
    vault.connect()?;
    wait_done(&rx, Operation::Connect)?;
    Ok((vault, rx))
}

fn wait_done(rx: &mpsc::Receiver<VaultEvent>, op: Operation) -> Result<Map<String, Value>> {
    loop {
        let event = rx.recv_timeout(Duration::from_secs(300))?;
        if event.operation != op {
            continue;
        }
        match event.kind {
            EventKind::Progress => continue,
            EventKind::Done => return Ok(event.data),
            EventKind::Error => anyhow::bail!("{} failed: {:?}", op.name(), event.data),
        }
    }
}

fn transfer(
    vault: &Vault,
    rx: &mpsc::Receiver<VaultEvent>,
    action: MediaAction,
    dir: &Path,
) -> Result<()> {
    vault.export_import_prepare(action, dir)?;
    wait_done(rx, Operation::ExportImportPrepare)?;
    vault.export_import_execute()?;
    wait_done(rx, Operation::ExportImportExecute)?;
    Ok(())
}

#[test]
fn media_roundtrip_preserves_snapshots() -> Result<()> {
    let root = unique_root("roundtrip");
    let live = root.join("live");
    fs::create_dir_all(live.join("data")).unwrap();
    fs::create_dir_all(live.join("big")).unwrap();
    fs::write(live.join("data/note.txt"), b"small payload\n").unwrap();
    let payload: Vec<u8> = (0..1_300_000).map(|i| (i % 241) as u8).collect();
    fs::write(live.join("big/blob.bin"), &payload).unwrap();
    let script = root.join("handler.sh");
    write_handler(&script, &live);

    // Source vault with one snapshot.
    let vault1_root = root.join("vault1");
    let (vault1, rx1) = open_vault(&vault1_root)?;
    let mut data = Map::new();
    data.insert("name".to_string(), Value::String("u1".to_string()));
    data.insert(
        "script".to_string(),
        Value::String(script.display().to_string()),
    );
    vault1.register_unit(data)?;
    vault1.start_backup("media test", &[])?;
    let done = wait_done(&rx1, Operation::Backup)?;
    let snapshot = match done.get("snapshot") {
        Some(Value::String(s)) => s.clone(),
        other => anyhow::bail!("no snapshot in done event: {:?}", other),
    };

    // Export to "removable media".
    let media = root.join("media");
    fs::create_dir_all(&media).unwrap();
    transfer(&vault1, &rx1, MediaAction::Export, &media)?;

    assert!(media.join(".git").is_dir(), "media carries the store");
    assert!(media.join("blobs").is_dir(), "media carries the blob store");
    // Every tree file on the media is a reference, the anchor included.
    let anchor = fs::read_to_string(media.join(".vault"))?;
    assert_eq!(anchor.trim().len(), 40, "exported files become references");

    // Import into a fresh vault.
    let vault2_root = root.join("vault2");
    let (vault2, rx2) = open_vault(&vault2_root)?;
    transfer(&vault2, &rx2, MediaAction::Import, &media)?;

    assert_eq!(
        vault2.snapshots()?,
        vec![snapshot.clone()],
        "snapshots must survive the media trip"
    );
    assert_eq!(vault2.notes(&snapshot)?, "media test");

    // The imported vault restores the original live state.
    fs::remove_dir_all(&live).unwrap();
    fs::create_dir_all(&live).unwrap();
    vault2.start_restore(&snapshot, &[])?;
    wait_done(&rx2, Operation::Restore)?;
    assert_eq!(fs::read(live.join("data/note.txt"))?, b"small payload\n");
    assert_eq!(fs::read(live.join("big/blob.bin"))?, payload);
    Ok(())
}

#[test]
fn prepare_rejects_bad_targets() -> Result<()> {
    let root = unique_root("prepare");
    let (vault, rx) = open_vault(&root.join("vault"))?;

    // Import from a directory that is not an exported vault.
    let junk = root.join("junk");
    fs::create_dir_all(&junk).unwrap();
    vault.export_import_prepare(MediaAction::Import, &junk)?;
    let error = loop {
        let event = rx.recv_timeout(Duration::from_secs(60))?;
        if event.operation == Operation::ExportImportPrepare {
            match event.kind {
                EventKind::Progress => continue,
                EventKind::Done => anyhow::bail!("prepare must reject {}", junk.display()),
                EventKind::Error => break event.data,
            }
        }
    };
    assert_eq!(error.get("error"), Some(&Value::String("config".into())));

    // Execute without a prepared plan is a state error.
    vault.export_import_execute()?;
    let error = loop {
        let event = rx.recv_timeout(Duration::from_secs(60))?;
        if event.operation == Operation::ExportImportExecute {
            match event.kind {
                EventKind::Progress => continue,
                EventKind::Done => anyhow::bail!("execute without prepare must fail"),
                EventKind::Error => break event.data,
            }
        }
    };
    assert_eq!(error.get("error"), Some(&Value::String("state".into())));
    Ok(())
}
