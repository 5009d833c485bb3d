//! File and stat helpers for the copier and the engine.
//!
//! Goals:
//! - Stat wraps lstat (symlink_metadata): symlinks are classified as
//!   symlinks, absent paths as Absent, with an explicit refresh().
//! - FileId (st_dev, st_ino) identifies a node for cycle detection.
//! - copy_file_bytes: chunked mmap copy in <= 1 MiB windows with the
//!   destination pre-sized, so a file at the chunk boundary needs exactly
//!   one window.
//! - copy_utime: nanosecond atime/mtime copy that never follows symlinks.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::MmapOptions;
use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;

use crate::error::{Result, VaultError};

/// Upper bound for one mmap copy window.
pub const MAX_CHUNK_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
    Symlink,
    Socket,
    Char,
    Block,
    Fifo,
    Absent,
}

/// Identity of a filesystem node on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

/// Cached lstat result for a path.
#[derive(Debug, Clone)]
pub struct Stat {
    path: PathBuf,
    meta: Option<Metadata>,
}

impl Stat {
    pub fn of(path: impl Into<PathBuf>) -> Result<Self> {
        let mut stat = Stat {
            path: path.into(),
            meta: None,
        };
        stat.refresh()?;
        Ok(stat)
    }

    /// Re-run lstat. A vanished path becomes Absent, not an error.
    pub fn refresh(&mut self) -> Result<()> {
        match fs::symlink_metadata(&self.path) {
            Ok(meta) => {
                self.meta = Some(meta);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.meta = None;
                Ok(())
            }
            Err(e) => Err(VaultError::io("stat", &self.path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.meta.is_some()
    }

    fn meta(&self) -> Result<&Metadata> {
        self.meta.as_ref().ok_or_else(|| {
            VaultError::io(
                "stat",
                &self.path,
                io::Error::new(io::ErrorKind::NotFound, "file does not exist"),
            )
        })
    }

    pub fn file_type(&self) -> Result<FileType> {
        let meta = match &self.meta {
            None => return Ok(FileType::Absent),
            Some(m) => m,
        };
        let ft = meta.file_type();
        if ft.is_file() {
            Ok(FileType::File)
        } else if ft.is_dir() {
            Ok(FileType::Dir)
        } else if ft.is_symlink() {
            Ok(FileType::Symlink)
        } else if ft.is_socket() {
            Ok(FileType::Socket)
        } else if ft.is_char_device() {
            Ok(FileType::Char)
        } else if ft.is_block_device() {
            Ok(FileType::Block)
        } else if ft.is_fifo() {
            Ok(FileType::Fifo)
        } else {
            Err(VaultError::io(
                "classify",
                &self.path,
                io::Error::new(io::ErrorKind::InvalidData, "unknown file type"),
            ))
        }
    }

    pub fn id(&self) -> Result<FileId> {
        let meta = self.meta()?;
        Ok(FileId {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.meta()?.len())
    }

    /// Permission bits (mode & 0o7777).
    pub fn mode(&self) -> Result<u32> {
        Ok(self.meta()?.mode() & 0o7777)
    }
}

/// Classify a path directly (lstat).
pub fn file_type(path: &Path) -> Result<FileType> {
    Stat::of(path)?.file_type()
}

/// Last path component; fails for paths like "/" or "..".
pub fn basename(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| VaultError::logic(format!("path has no basename: {}", path.display())))
}

/// Copy atime/mtime (nanosecond precision) from `src` onto `target`
/// without following a symlink target.
pub fn copy_utime(target: &Path, src: &Stat) -> Result<()> {
    let meta = src.meta()?;
    let atime = TimeSpec::new(meta.atime(), meta.atime_nsec());
    let mtime = TimeSpec::new(meta.mtime(), meta.mtime_nsec());
    utimensat(
        None,
        target,
        &atime,
        &mtime,
        UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|e| VaultError::io("utimensat", target, io::Error::from(e)))
}

pub fn read_link(path: &Path) -> Result<PathBuf> {
    fs::read_link(path).map_err(|e| VaultError::io("readlink", path, e))
}

pub fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| VaultError::io("symlink", link, e))
}

pub fn unlink(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|e| VaultError::io("unlink", path, e))
}

/// Create a directory with an explicit mode (single level).
pub fn mkdir(path: &Path, mode: u32) -> Result<()> {
    fs::DirBuilder::new()
        .mode(mode)
        .create(path)
        .map_err(|e| VaultError::io("mkdir", path, e))
}

/// Create the directory if absent (with the given mode); reuse it otherwise.
pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    match file_type(path)? {
        FileType::Absent => mkdir(path, mode),
        FileType::Dir => Ok(()),
        _ => Err(VaultError::io(
            "mkdir",
            path,
            io::Error::new(io::ErrorKind::AlreadyExists, "exists as a non-directory"),
        )),
    }
}

/// Create `parent/basename(from)` as a directory with `from`'s permission
/// bits. An existing directory is reused; an existing non-directory fails.
pub fn mkdir_similar(from: &Stat, parent: &Stat) -> Result<Stat> {
    if !parent.exists() {
        return Err(VaultError::io(
            "mkdir",
            parent.path(),
            io::Error::new(io::ErrorKind::NotFound, "no parent dir"),
        ));
    }
    let dst_path = parent.path().join(basename(from.path())?);
    debug!("mkdir {}", dst_path.display());
    let mut dst = Stat::of(&dst_path)?;
    if !dst.exists() {
        mkdir(&dst_path, from.mode()?)?;
        dst.refresh()?;
    } else if dst.file_type()? == FileType::Dir {
        debug!("already exists {}", dst_path.display());
    } else {
        return Err(VaultError::io(
            "mkdir",
            &dst_path,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                "destination type is different",
            ),
        ));
    }
    Ok(dst)
}

/// Chunked byte copy: pre-size the destination, then mirror `len` bytes in
/// <= MAX_CHUNK_BYTES mmap windows. Window offsets stay chunk-aligned.
pub fn copy_file_bytes(dst: &File, src: &File, len: u64) -> io::Result<()> {
    dst.set_len(len)?;
    let mut off: u64 = 0;
    let mut left = len;
    while left > 0 {
        let size = left.min(MAX_CHUNK_BYTES) as usize;
        let src_map = unsafe { MmapOptions::new().offset(off).len(size).map(src)? };
        let mut dst_map = unsafe { MmapOptions::new().offset(off).len(size).map_mut(dst)? };
        dst_map.copy_from_slice(&src_map);
        left -= size as u64;
        off += size as u64;
    }
    Ok(())
}

/// Copy `src`'s bytes to `dst_path`. When `mode` is given the destination
/// ends up with exactly those permission bits.
pub fn copy_data(dst_path: &Path, src: &Stat, mode: Option<u32>) -> Result<()> {
    let src_file =
        File::open(src.path()).map_err(|e| VaultError::io("open", src.path(), e))?;
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    if let Some(mode) = mode {
        options.mode(mode);
    }
    let dst_file = match options.open(dst_path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied && dst_path.exists() => {
            // A read-only destination (e.g. a mirrored object file) cannot
            // be opened for writing; replace it.
            fs::remove_file(dst_path).map_err(|e| VaultError::io("unlink", dst_path, e))?;
            options
                .open(dst_path)
                .map_err(|e| VaultError::io("open", dst_path, e))?
        }
        Err(e) => return Err(VaultError::io("open", dst_path, e)),
    };
    if let Some(mode) = mode {
        // The create mode is masked by the umask; the copier promises the
        // exact source bits.
        fs::set_permissions(dst_path, fs::Permissions::from_mode(mode))
            .map_err(|e| VaultError::io("chmod", dst_path, e))?;
    }
    copy_file_bytes(&dst_file, &src_file, src.size()?)
        .map_err(|e| VaultError::io("copy", dst_path, e))
}

/// Truncate `dst_path` and write `text`, creating the file with `mode`.
pub fn rewrite(dst_path: &Path, text: &str, mode: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(mode);
    let mut file = match options.open(dst_path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied && dst_path.exists() => {
            // Same as copy_data: replace a read-only destination.
            fs::remove_file(dst_path).map_err(|e| VaultError::io("unlink", dst_path, e))?;
            options
                .open(dst_path)
                .map_err(|e| VaultError::io("open", dst_path, e))?
        }
        Err(e) => return Err(VaultError::io("open", dst_path, e)),
    };
    fs::set_permissions(dst_path, fs::Permissions::from_mode(mode))
        .map_err(|e| VaultError::io("chmod", dst_path, e))?;
    io::Write::write_all(&mut file, text.as_bytes())
        .map_err(|e| VaultError::io("write", dst_path, e))
}

/// Read a small text file and trim surrounding whitespace.
pub fn read_trimmed(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path).map_err(|e| VaultError::io("read", path, e))?;
    Ok(text.trim().to_string())
}

/// Best-effort recursive size of a tree (lstat sizes; errors are skipped).
pub fn tree_size(path: &Path) -> u64 {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return 0,
    };
    if meta.file_type().is_dir() {
        let entries = match fs::read_dir(path) {
            Ok(it) => it,
            Err(_) => return 0,
        };
        entries
            .flatten()
            .map(|entry| tree_size(&entry.path()))
            .sum()
    } else {
        meta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn unique_root(prefix: &str) -> PathBuf {
        let pid = std::process::id();
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("vault-fsutil-{}-{}-{}", prefix, pid, t))
    }

    #[test]
    fn classify_and_id() -> Result<()> {
        let root = unique_root("classify");
        fs::create_dir_all(&root).unwrap();
        let file = root.join("f");
        fs::write(&file, b"x").unwrap();
        let link = root.join("l");
        make_symlink(Path::new("f"), &link)?;

        assert_eq!(file_type(&root)?, FileType::Dir);
        assert_eq!(file_type(&file)?, FileType::File);
        assert_eq!(file_type(&link)?, FileType::Symlink);
        assert_eq!(file_type(&root.join("absent"))?, FileType::Absent);

        let a = Stat::of(&file)?.id()?;
        let b = Stat::of(&file)?.id()?;
        assert_eq!(a, b, "FileId must be stable");
        assert_ne!(a, Stat::of(&root)?.id()?);
        Ok(())
    }

    #[test]
    fn copy_bytes_chunk_boundaries() -> Result<()> {
        let root = unique_root("chunks");
        fs::create_dir_all(&root).unwrap();

        for (name, len) in [
            ("exact", MAX_CHUNK_BYTES as usize),
            ("over", MAX_CHUNK_BYTES as usize + 1),
            ("small", 3),
            ("empty", 0),
        ] {
            let src_path = root.join(format!("{name}.src"));
            let dst_path = root.join(format!("{name}.dst"));
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            fs::write(&src_path, &payload).unwrap();

            let src = Stat::of(&src_path)?;
            copy_data(&dst_path, &src, Some(0o644))?;
            assert_eq!(fs::read(&dst_path).unwrap(), payload, "payload {name}");
        }
        Ok(())
    }

    #[test]
    fn copy_data_shrinks_existing_destination() -> Result<()> {
        let root = unique_root("shrink");
        fs::create_dir_all(&root).unwrap();
        let src_path = root.join("src");
        let dst_path = root.join("dst");
        fs::write(&src_path, b"abc").unwrap();
        fs::write(&dst_path, b"longer than source").unwrap();

        copy_data(&dst_path, &Stat::of(&src_path)?, None)?;
        assert_eq!(fs::read(&dst_path).unwrap(), b"abc");
        Ok(())
    }

    #[test]
    fn utime_roundtrip() -> Result<()> {
        let root = unique_root("utime");
        fs::create_dir_all(&root).unwrap();
        let src_path = root.join("src");
        let dst_path = root.join("dst");
        fs::write(&src_path, b"a").unwrap();
        fs::write(&dst_path, b"b").unwrap();

        let old = TimeSpec::new(1_000_000, 123_456_789);
        utimensat(None, &src_path, &old, &old, UtimensatFlags::NoFollowSymlink).unwrap();

        let src = Stat::of(&src_path)?;
        copy_utime(&dst_path, &src)?;
        let got = fs::symlink_metadata(&dst_path).unwrap();
        assert_eq!(got.mtime(), 1_000_000);
        assert_eq!(got.mtime_nsec(), 123_456_789);
        Ok(())
    }

    #[test]
    fn rewrite_and_read_trimmed() -> Result<()> {
        let root = unique_root("rewrite");
        fs::create_dir_all(&root).unwrap();
        let path = root.join("ref");

        rewrite(&path, "abc123\n", 0o640)?;
        assert_eq!(read_trimmed(&path)?, "abc123");
        let mode = fs::symlink_metadata(&path).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o640);

        // Truncation on rewrite
        rewrite(&path, "x", 0o640)?;
        assert_eq!(read_trimmed(&path)?, "x");
        Ok(())
    }

    #[test]
    fn mkdir_similar_reuses_and_rejects() -> Result<()> {
        let root = unique_root("mkdirsim");
        fs::create_dir_all(&root).unwrap();
        let src_dir = root.join("src");
        fs::create_dir(&src_dir).unwrap();
        let parent = root.join("dst");
        fs::create_dir(&parent).unwrap();

        let from = Stat::of(&src_dir)?;
        let parent_stat = Stat::of(&parent)?;
        let created = mkdir_similar(&from, &parent_stat)?;
        assert_eq!(created.file_type()?, FileType::Dir);

        // Second call reuses the directory.
        let reused = mkdir_similar(&from, &parent_stat)?;
        assert_eq!(reused.path(), created.path());

        // A file in the way is an error.
        let mut f = File::create(parent.join("clash")).unwrap();
        f.write_all(b"no").unwrap();
        let clash_src = root.join("clash");
        fs::create_dir(&clash_src).unwrap();
        let err = mkdir_similar(&Stat::of(&clash_src)?, &parent_stat);
        assert!(err.is_err(), "file in the way must be rejected");
        Ok(())
    }

    #[test]
    fn tree_size_counts_files() {
        let root = unique_root("treesize");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a"), vec![0u8; 10]).unwrap();
        fs::write(root.join("sub/b"), vec![0u8; 32]).unwrap();
        assert_eq!(tree_size(&root), 42);
    }
}
