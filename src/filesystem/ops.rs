// src/filesystem/ops.rs

//! Filesystem mutation primitives and whole-set merge/unmerge
//!
//! The primitives (`ensure_perms`, `mkdir`, `copyfile`) act on a single entry
//! at its own location. `merge_contents` and `unmerge_contents` apply or
//! remove an entire content set, optionally projected under an offset.
//! [`FsOps`] is the seam the merge engine calls through; [`LiveFsOps`] is the
//! implementation that touches the real disk.

use crate::error::{Error, Result};
use crate::filesystem::contents::ContentSet;
use crate::filesystem::entry::{DeviceKind, EntryKind, FsEntry};
use crate::filesystem::livefs;
use crate::filesystem::path;
use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag, UtimensatFlags, makedev, mknod, utimensat};
use nix::sys::time::TimeSpec;
use std::fs::{self, DirBuilder, File, Permissions};
use std::io;
use std::os::unix::fs::{PermissionsExt, lchown, symlink};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Errno values that leave a directory in place during unmerge
const RMDIR_TOLERATED: [Errno; 5] = [
    Errno::ENOTEMPTY,
    Errno::ENOENT,
    Errno::ENOTDIR,
    Errno::EBUSY,
    Errno::EEXIST,
];

/// Applies content sets to a filesystem
pub trait FsOps: Send + Sync {
    /// Create every entry of `cset`, directories first
    fn merge_contents(
        &self,
        cset: &ContentSet,
        offset: Option<&Path>,
        on_entry: &mut dyn FnMut(&FsEntry),
    ) -> Result<()>;

    /// Remove every entry of `cset`, leaving directories that are still in use
    fn unmerge_contents(
        &self,
        cset: &ContentSet,
        offset: Option<&Path>,
        on_entry: &mut dyn FnMut(&FsEntry),
    ) -> Result<()>;
}

/// [`FsOps`] backed by the real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveFsOps;

impl FsOps for LiveFsOps {
    fn merge_contents(
        &self,
        cset: &ContentSet,
        offset: Option<&Path>,
        on_entry: &mut dyn FnMut(&FsEntry),
    ) -> Result<()> {
        merge_contents(cset, offset, on_entry)
    }

    fn unmerge_contents(
        &self,
        cset: &ContentSet,
        offset: Option<&Path>,
        on_entry: &mut dyn FnMut(&FsEntry),
    ) -> Result<()> {
        unmerge_contents(cset, offset, on_entry)
    }
}

/// Set both access and modification time of `path` without following symlinks
pub fn set_mtime(path: &Path, mtime: i64) -> Result<()> {
    let ts = TimeSpec::new(mtime, 0);
    utimensat(None, path, &ts, &ts, UtimensatFlags::NoFollowSymlink)?;
    Ok(())
}

/// Bring ownership, mode and mtime of the node at `planned`'s location in
/// line with `planned`
///
/// With `existing`, only the attributes that differ are touched, and a
/// directory replacing a directory keeps its current mode. Symlinks only get
/// their ownership changed.
pub fn ensure_perms(planned: &FsEntry, existing: Option<&FsEntry>) -> Result<()> {
    apply_perms(planned.path(), planned, existing)
}

fn apply_perms(target: &Path, planned: &FsEntry, existing: Option<&FsEntry>) -> Result<()> {
    let (do_mode, do_chown, do_mtime) = match existing {
        None => (true, true, true),
        Some(live) => {
            let do_mode = if planned.is_dir() && live.is_dir() {
                false
            } else {
                planned.mode().is_some() && planned.mode() != live.mode()
            };
            let do_chown = (planned.uid().is_some() && planned.uid() != live.uid())
                || (planned.gid().is_some() && planned.gid() != live.gid());
            (do_mode, do_chown, planned.mtime() != live.mtime())
        }
    };

    if do_chown && (planned.uid().is_some() || planned.gid().is_some()) {
        lchown(target, planned.uid(), planned.gid())?;
    }

    if planned.is_symlink() {
        return Ok(());
    }

    if do_mode {
        if let Some(mode) = planned.mode() {
            fs::set_permissions(target, Permissions::from_mode(mode))?;
        }
    }
    if do_mtime {
        if let Some(mtime) = planned.mtime() {
            set_mtime(target, mtime)?;
        }
    }
    Ok(())
}

/// Create a directory (and any missing parents), then apply its attributes
pub fn mkdir(entry: &FsEntry) -> Result<()> {
    DirBuilder::new().recursive(true).create(entry.path())?;
    ensure_perms(entry, None)
}

fn node_description(metadata: &fs::Metadata) -> &'static str {
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        "directory"
    } else if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_file() {
        "file"
    } else {
        "special file"
    }
}

fn failed_copy(entry: &FsEntry, reason: impl Into<String>) -> Error {
    Error::FailedCopy {
        path: entry.location().to_string(),
        reason: reason.into(),
    }
}

/// Create `entry` at its location
///
/// An existing non-directory is replaced atomically: the new node is written
/// next to it with a `#new` suffix and renamed over it. A missing parent is
/// created when `mkdirs` is set and is an error otherwise.
pub fn copyfile(entry: &FsEntry, mkdirs: bool) -> Result<()> {
    let target = entry.path();

    let existing = match fs::symlink_metadata(target) {
        Ok(metadata) => Some(metadata),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    if let Some(metadata) = &existing {
        if metadata.is_dir() {
            if entry.is_dir() {
                return ensure_perms(entry, None);
            }
            return Err(Error::CannotOverwrite {
                path: entry.location().to_string(),
                existing: node_description(metadata).to_string(),
            });
        }
    }

    if entry.is_dir() {
        return mkdir(entry);
    }

    let parent = Path::new(entry.dirname());
    if !parent.is_dir() {
        if mkdirs {
            DirBuilder::new().recursive(true).create(parent)?;
        } else {
            return Err(failed_copy(
                entry,
                format!("parent directory {} does not exist", parent.display()),
            ));
        }
    }

    let dest = if existing.is_some() {
        PathBuf::from(format!("{}#new", entry.location()))
    } else {
        target.to_path_buf()
    };
    if existing.is_some() {
        match fs::remove_file(&dest) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    create_node(entry, &dest)?;
    apply_perms(&dest, entry, None)?;

    if dest != target {
        fs::rename(&dest, target)?;
    }
    Ok(())
}

fn create_node(entry: &FsEntry, dest: &Path) -> Result<()> {
    let mode = Mode::from_bits_truncate(entry.mode().unwrap_or(0o644) & 0o7777);

    match entry.kind() {
        EntryKind::File(data) => {
            let source = data
                .source()
                .ok_or_else(|| failed_copy(entry, "no data source"))?;
            let mut reader = source
                .open()
                .map_err(|e| failed_copy(entry, e.to_string()))?;
            let mut out = File::create(dest)?;
            io::copy(&mut reader, &mut out)?;
        }
        EntryKind::Symlink { target } => symlink(target, dest)?,
        EntryKind::Fifo => nix::unistd::mkfifo(dest, mode)?,
        EntryKind::Device { kind, major, minor } => {
            let (Some(major), Some(minor)) = (major, minor) else {
                return Err(failed_copy(entry, "device numbers are unknown"));
            };
            let flag = match kind {
                DeviceKind::Char => SFlag::S_IFCHR,
                DeviceKind::Block => SFlag::S_IFBLK,
            };
            mknod(dest, flag, mode, makedev(u64::from(*major), u64::from(*minor)))?;
        }
        EntryKind::Dir => DirBuilder::new().create(dest)?,
    }
    Ok(())
}

fn project(cset: &ContentSet, offset: Option<&Path>) -> Result<ContentSet> {
    match offset {
        Some(offset) => {
            let offset = path::from_path(offset)?;
            if offset == "/" {
                Ok(cset.clone())
            } else {
                cset.insert_offset(&offset)
            }
        }
        None => Ok(cset.clone()),
    }
}

fn merge_dir(entry: &FsEntry) -> Result<()> {
    let target = entry.path();
    match fs::metadata(target) {
        Ok(metadata) if metadata.is_dir() => {
            match livefs::gen_entry_at(entry.location(), target)? {
                Some(live) if live.is_symlink() => {
                    debug!("{} is a symlink to a directory, leaving it alone", entry.location());
                    Ok(())
                }
                live => ensure_perms(entry, live.as_ref()),
            }
        }
        Ok(metadata) => Err(Error::CannotOverwrite {
            path: entry.location().to_string(),
            existing: node_description(&metadata).to_string(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if fs::symlink_metadata(target).is_ok() {
                // dangling symlink in the way
                fs::remove_file(target).map_err(|_| Error::CannotOverwrite {
                    path: entry.location().to_string(),
                    existing: "dangling symlink".to_string(),
                })?;
            }
            mkdir(entry)
        }
        Err(e) => Err(e.into()),
    }
}

/// Create every entry of `cset` on disk
///
/// With `offset`, the set is projected under that directory first, and the
/// offset is created if missing. Directories are processed first in sorted
/// order so parents precede children; everything else follows.
pub fn merge_contents(
    cset: &ContentSet,
    offset: Option<&Path>,
    on_entry: &mut dyn FnMut(&FsEntry),
) -> Result<()> {
    if let Some(offset) = offset {
        match fs::metadata(offset) {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(Error::InvalidOffset(offset.display().to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new().recursive(true).create(offset)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    let cset = project(cset, offset)?;

    for dir in cset.iter_dirs(false) {
        merge_dir(dir)?;
        on_entry(dir);
    }

    for entry in cset.iter_dirs(true) {
        copyfile(entry, true)?;
        on_entry(entry);
    }

    info!("Merged {} entries", cset.len());
    Ok(())
}

/// Remove every entry of `cset` from disk
///
/// Non-directories go first. Directories are then removed deepest first;
/// ones that are not empty (or already gone) stay without failing the
/// operation. A planned non-directory that is a real directory on disk is
/// left alone.
pub fn unmerge_contents(
    cset: &ContentSet,
    offset: Option<&Path>,
    on_entry: &mut dyn FnMut(&FsEntry),
) -> Result<()> {
    let cset = project(cset, offset)?;

    for entry in cset.iter_dirs(true) {
        match fs::symlink_metadata(entry.path()) {
            Ok(metadata) if metadata.is_dir() => {
                debug!("Not removing directory {} listed as {}", entry.location(), entry.entry_type());
                continue;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => on_entry(entry),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let dirs: Vec<&FsEntry> = cset.iter_dirs(false).collect();
    for dir in dirs.into_iter().rev() {
        match fs::remove_dir(dir.path()) {
            Ok(()) => on_entry(dir),
            Err(e) => {
                let tolerated = e
                    .raw_os_error()
                    .is_some_and(|code| RMDIR_TOLERATED.iter().any(|errno| *errno as i32 == code));
                if !tolerated {
                    return Err(e.into());
                }
                debug!("Leaving directory {}: {}", dir.location(), e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::entry::DataSource;
    use crate::filesystem::livefs::scan;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn planned() -> ContentSet {
        vec![
            FsEntry::file("/file1")
                .mode(0o644)
                .data(DataSource::bytes(b"one".to_vec()))
                .build_partial()
                .unwrap(),
            FsEntry::dir("/dir").mode(0o755).build_partial().unwrap(),
            FsEntry::file("/dir/file2")
                .mode(0o600)
                .data(DataSource::bytes(b"two".to_vec()))
                .build_partial()
                .unwrap(),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_merge_then_scan_reproduces_set() {
        let tmp = TempDir::new().unwrap();
        let mut seen = Vec::new();
        merge_contents(&planned(), Some(tmp.path()), &mut |e| {
            seen.push(e.location().to_string())
        })
        .unwrap();
        assert_eq!(seen.len(), 3);

        let live = scan(tmp.path(), Some(tmp.path().to_str().unwrap())).unwrap();
        assert_eq!(live, planned());
        assert_eq!(live.get("/dir/file2").unwrap().mode(), Some(0o600));
        assert_eq!(fs::read(tmp.path().join("dir/file2")).unwrap(), b"two");
    }

    #[test]
    fn test_unmerge_leaves_dir_with_lingering_file() {
        let tmp = TempDir::new().unwrap();
        let cset: ContentSet = planned()
            .iter()
            .filter(|e| e.location().starts_with("/dir"))
            .cloned()
            .collect();
        merge_contents(&cset, Some(tmp.path()), &mut |_| {}).unwrap();
        fs::write(tmp.path().join("dir/linger"), b"x").unwrap();

        let mut removed = Vec::new();
        unmerge_contents(&cset, Some(tmp.path()), &mut |e| {
            removed.push(e.location().to_string())
        })
        .unwrap();

        assert!(tmp.path().join("dir").is_dir());
        assert!(!tmp.path().join("dir/file2").exists());
        assert!(tmp.path().join("dir/linger").exists());
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn test_unmerge_removes_empty_dirs() {
        let tmp = TempDir::new().unwrap();
        merge_contents(&planned(), Some(tmp.path()), &mut |_| {}).unwrap();
        unmerge_contents(&planned(), Some(tmp.path()), &mut |_| {}).unwrap();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_copyfile_replaces_existing_file() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("f");
        fs::write(&target, b"old").unwrap();

        let entry = FsEntry::file(target.to_str().unwrap())
            .mode(0o640)
            .data(DataSource::bytes(b"new".to_vec()))
            .build_partial()
            .unwrap();
        copyfile(&entry, false).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert_eq!(fs::metadata(&target).unwrap().mode() & 0o7777, 0o640);
        assert!(!tmp.path().join("f#new").exists());
    }

    #[test]
    fn test_copyfile_refuses_directory_target() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        let entry = FsEntry::file(tmp.path().join("d").to_str().unwrap())
            .data(DataSource::bytes(Vec::new()))
            .build_partial()
            .unwrap();
        assert!(matches!(
            copyfile(&entry, false),
            Err(Error::CannotOverwrite { .. })
        ));
    }

    #[test]
    fn test_copyfile_missing_parent() {
        let tmp = TempDir::new().unwrap();
        let location = tmp.path().join("a/b/c");
        let entry = FsEntry::symlink(location.to_str().unwrap(), "target")
            .build_partial()
            .unwrap();
        assert!(matches!(
            copyfile(&entry, false),
            Err(Error::FailedCopy { .. })
        ));
        copyfile(&entry, true).unwrap();
        assert_eq!(fs::read_link(&location).unwrap(), Path::new("target"));
    }

    #[test]
    fn test_copyfile_without_data_fails() {
        let tmp = TempDir::new().unwrap();
        let entry = FsEntry::file(tmp.path().join("f").to_str().unwrap())
            .build_partial()
            .unwrap();
        assert!(matches!(
            copyfile(&entry, false),
            Err(Error::FailedCopy { .. })
        ));
    }

    #[test]
    fn test_merge_dir_over_file_fails() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("dir"), b"").unwrap();
        let result = merge_contents(&planned(), Some(tmp.path()), &mut |_| {});
        assert!(matches!(result, Err(Error::CannotOverwrite { .. })));
    }

    #[test]
    fn test_merge_through_symlinked_dir() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("real")).unwrap();
        symlink("real", tmp.path().join("dir")).unwrap();

        merge_contents(&planned(), Some(tmp.path()), &mut |_| {}).unwrap();
        assert!(tmp.path().join("real/file2").is_file());
        assert!(fs::symlink_metadata(tmp.path().join("dir")).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_merge_replaces_dangling_symlink() {
        let tmp = TempDir::new().unwrap();
        symlink("nowhere", tmp.path().join("dir")).unwrap();
        merge_contents(&planned(), Some(tmp.path()), &mut |_| {}).unwrap();
        assert!(fs::symlink_metadata(tmp.path().join("dir")).unwrap().is_dir());
    }

    #[test]
    fn test_merge_offset_must_be_directory() {
        let tmp = TempDir::new().unwrap();
        let offset = tmp.path().join("file");
        fs::write(&offset, b"").unwrap();
        let result = merge_contents(&planned(), Some(&offset), &mut |_| {});
        assert!(matches!(result, Err(Error::InvalidOffset(_))));
    }

    #[test]
    fn test_merge_creates_fifo() {
        let tmp = TempDir::new().unwrap();
        let cset: ContentSet = vec![FsEntry::fifo("/pipe").mode(0o600).build_partial().unwrap()]
            .into_iter()
            .collect();
        merge_contents(&cset, Some(tmp.path()), &mut |_| {}).unwrap();

        let live = scan(tmp.path(), Some(tmp.path().to_str().unwrap())).unwrap();
        assert!(live.get("/pipe").unwrap().is_fifo());
    }

    #[test]
    fn test_ensure_perms_sets_mtime() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("f");
        fs::write(&target, b"").unwrap();
        let entry = FsEntry::file(target.to_str().unwrap())
            .mode(0o600)
            .mtime(1_000_000)
            .build_partial()
            .unwrap();
        ensure_perms(&entry, None).unwrap();

        let metadata = fs::metadata(&target).unwrap();
        assert_eq!(metadata.mtime(), 1_000_000);
        assert_eq!(metadata.mode() & 0o7777, 0o600);
    }
}
