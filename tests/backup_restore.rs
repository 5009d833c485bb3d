// tests/backup_restore.rs
//
// End-to-end engine scenarios through the worker handle, with real git and
// generated /bin/sh unit handlers:
// 1) empty backup gets a timestamp tag and keeps the message in notes
// 2) small-file roundtrip through backup + wipe + restore
// 3) big-file dedup across repeated backups
// 4) symlink preservation
// 5) failing handler rolls the backup back
// 6) snapshot removal keeps blobs and other snapshots intact

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value};

use vault::config::VaultConfig;
use vault::worker::{EventKind, Operation, Vault, VaultEvent};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("vault-e2e-{}-{}-{}", prefix, pid, t))
}

/// Handler that mirrors `live/data` through --dir and `live/big` through
/// --bin-dir in both directions.
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
  *)
    echo "unknown action: $action" >&2
    exit 2
    ;;
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
        let event = rx.recv_timeout(Duration::from_secs(120))?;
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

fn wait_error(rx: &mpsc::Receiver<VaultEvent>, op: Operation) -> Result<Map<String, Value>> {
    loop {
        let event = rx.recv_timeout(Duration::from_secs(120))?;
        if event.operation != op {
            continue;
        }
        match event.kind {
            EventKind::Progress => continue,
            EventKind::Done => anyhow::bail!("{} unexpectedly succeeded", op.name()),
            EventKind::Error => return Ok(event.data),
        }
    }
}

fn register(vault: &Vault, name: &str, script: &Path) -> Result<()> {
    let mut data = Map::new();
    data.insert("name".to_string(), Value::String(name.to_string()));
    data.insert(
        "script".to_string(),
        Value::String(script.display().to_string()),
    );
    assert!(vault.register_unit(data)?, "fresh unit must register");
    Ok(())
}

fn backup(vault: &Vault, rx: &mpsc::Receiver<VaultEvent>, message: &str) -> Result<String> {
    vault.start_backup(message, &[])?;
    let done = wait_done(rx, Operation::Backup)?;
    match done.get("snapshot") {
        Some(Value::String(s)) => Ok(s.clone()),
        other => anyhow::bail!("done event without snapshot name: {:?}", other),
    }
}

fn count_blobs(vault_root: &Path) -> usize {
    let blobs = vault_root.join("blobs");
    if !blobs.exists() {
        return 0;
    }
    let mut count = 0;
    for fan in fs::read_dir(&blobs).unwrap().flatten() {
        count += fs::read_dir(fan.path()).unwrap().count();
    }
    count
}

fn setup(prefix: &str) -> Result<(PathBuf, PathBuf, Vault, mpsc::Receiver<VaultEvent>)> {
    let root = unique_root(prefix);
    let vault_root = root.join("vault");
    let live = root.join("live");
    fs::create_dir_all(&live).unwrap();
    let script = root.join("handler.sh");
    write_handler(&script, &live);

    let (vault, rx) = open_vault(&vault_root)?;
    register(&vault, "u1", &script)?;
    Ok((vault_root, live, vault, rx))
}

#[test]
fn empty_backup_creates_timestamp_tag() -> Result<()> {
    let (vault_root, _live, vault, rx) = setup("empty")?;

    let snapshot = backup(&vault, &rx, "init")?;
    assert!(
        chrono::NaiveDateTime::parse_from_str(&snapshot[..19], "%Y-%m-%dT%H:%M:%S").is_ok(),
        "tag must be a UTC timestamp, got {}",
        snapshot
    );

    assert_eq!(vault.snapshots()?, vec![snapshot.clone()]);
    assert_eq!(vault.notes(&snapshot)?, "init");
    assert_eq!(count_blobs(&vault_root), 0, "nothing exported, no blobs");
    Ok(())
}

#[test]
fn small_file_roundtrip() -> Result<()> {
    let (_vault_root, live, vault, rx) = setup("small")?;
    fs::create_dir_all(live.join("data")).unwrap();
    fs::write(live.join("data/hello.txt"), b"hi\n").unwrap();

    let snapshot = backup(&vault, &rx, "s1")?;

    // Wipe the live state, then restore.
    fs::remove_dir_all(&live).unwrap();
    fs::create_dir_all(&live).unwrap();

    vault.start_restore(&snapshot, &[])?;
    wait_done(&rx, Operation::Restore)?;

    assert_eq!(fs::read(live.join("data/hello.txt"))?, b"hi\n");
    Ok(())
}

#[test]
fn big_file_dedup_across_backups() -> Result<()> {
    let (vault_root, live, vault, rx) = setup("dedup")?;
    let payload: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 239) as u8).collect();
    fs::create_dir_all(live.join("big")).unwrap();
    fs::write(live.join("big/payload.bin"), &payload).unwrap();

    let first = backup(&vault, &rx, "s1")?;
    assert_eq!(count_blobs(&vault_root), 1);

    // Identical content: a new tag, zero new blobs.
    let second = backup(&vault, &rx, "s2")?;
    assert_ne!(first, second);
    assert_eq!(count_blobs(&vault_root), 1, "same bytes must not add blobs");

    fs::remove_dir_all(&live).unwrap();
    fs::create_dir_all(&live).unwrap();
    vault.start_restore(&first, &[])?;
    wait_done(&rx, Operation::Restore)?;
    assert_eq!(fs::read(live.join("big/payload.bin"))?, payload);
    Ok(())
}

#[test]
fn symlink_preserved_through_backup_restore() -> Result<()> {
    let (_vault_root, live, vault, rx) = setup("symlink")?;
    fs::create_dir_all(live.join("data")).unwrap();
    std::os::unix::fs::symlink("../target", live.join("data/link")).unwrap();

    let snapshot = backup(&vault, &rx, "links")?;

    fs::remove_dir_all(&live).unwrap();
    fs::create_dir_all(&live).unwrap();
    vault.start_restore(&snapshot, &[])?;
    wait_done(&rx, Operation::Restore)?;

    let link = live.join("data/link");
    assert!(fs::symlink_metadata(&link)?.file_type().is_symlink());
    assert_eq!(fs::read_link(&link)?, PathBuf::from("../target"));
    Ok(())
}

#[test]
fn failing_handler_rolls_back() -> Result<()> {
    let (vault_root, live, vault, rx) = setup("rollback")?;
    fs::create_dir_all(live.join("data")).unwrap();
    fs::write(live.join("data/keep.txt"), b"keep\n").unwrap();
    let good = backup(&vault, &rx, "good")?;

    // A unit whose handler always fails poisons the whole backup.
    let bad_script = vault_root.parent().unwrap().join("bad.sh");
    fs::write(&bad_script, "#!/bin/sh\necho \"handler exploded\" >&2\nexit 3\n").unwrap();
    fs::set_permissions(&bad_script, fs::Permissions::from_mode(0o755)).unwrap();
    register(&vault, "u2", &bad_script)?;

    vault.start_backup("broken", &[])?;
    let error = wait_error(&rx, Operation::Backup)?;
    assert_eq!(error.get("error"), Some(&Value::String("handler".into())));
    let msg = error.get("msg").and_then(Value::as_str).unwrap_or("");
    assert!(msg.contains("handler exploded"), "stderr tail in payload: {}", msg);

    // The vault is still consistent: the good snapshot restores.
    assert_eq!(vault.snapshots()?, vec![good.clone()]);
    fs::remove_dir_all(&live).unwrap();
    fs::create_dir_all(&live).unwrap();
    vault.start_restore(&good, &["u1".to_string()])?;
    wait_done(&rx, Operation::Restore)?;
    assert_eq!(fs::read(live.join("data/keep.txt"))?, b"keep\n");
    Ok(())
}

#[test]
fn unknown_unit_is_a_config_error() -> Result<()> {
    let (_vault_root, _live, vault, rx) = setup("unknown")?;
    vault.start_backup("nope", &["missing".to_string()])?;
    let error = wait_error(&rx, Operation::Backup)?;
    assert_eq!(error.get("error"), Some(&Value::String("config".into())));
    Ok(())
}

#[test]
fn remove_snapshot_keeps_blobs_and_other_snapshots() -> Result<()> {
    let (vault_root, live, vault, rx) = setup("remove")?;
    let payload: Vec<u8> = (0..1_500_000).map(|i| (i % 233) as u8).collect();
    fs::create_dir_all(live.join("big")).unwrap();
    fs::write(live.join("big/shared.bin"), &payload).unwrap();

    let first = backup(&vault, &rx, "s1")?;
    // Distinct second-resolution tag names and tagger dates.
    std::thread::sleep(Duration::from_millis(1200));
    let second = backup(&vault, &rx, "s2")?;
    assert_eq!(vault.snapshots()?, vec![second.clone(), first.clone()]);

    vault.remove_snapshot(&first)?;
    wait_done(&rx, Operation::RemoveSnapshot)?;

    assert_eq!(vault.snapshots()?, vec![second.clone()]);
    assert!(vault.notes(&first).is_err(), "notes die with the tag");
    assert_eq!(count_blobs(&vault_root), 1, "blobs may be shared, never reaped");

    // The surviving snapshot still restores.
    fs::remove_dir_all(&live).unwrap();
    fs::create_dir_all(&live).unwrap();
    vault.start_restore(&second, &[])?;
    wait_done(&rx, Operation::Restore)?;
    assert_eq!(fs::read(live.join("big/shared.bin"))?, payload);
    Ok(())
}
