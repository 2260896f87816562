// src/filesystem/livefs.rs

//! Reading filesystem entries from the live filesystem
//!
//! The scanner walks a real directory tree and turns every node into an
//! [`FsEntry`]. Symlinks are recorded, never followed. With an offset, the
//! produced locations are relative to that offset, so a staging tree can be
//! described as if it were mounted at `/`.

use crate::error::{Error, Result};
use crate::filesystem::contents::ContentSet;
use crate::filesystem::entry::{DataSource, DeviceKind, FileData, FsEntry};
use crate::filesystem::path;
use std::collections::HashSet;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Build an entry at `location` from stat data of `real`
///
/// Returns `Ok(None)` for node types that cannot be represented (sockets).
pub fn gen_entry(location: &str, real: &Path, metadata: &Metadata) -> Result<Option<FsEntry>> {
    let file_type = metadata.file_type();
    let builder = if file_type.is_dir() {
        FsEntry::dir(location)
    } else if file_type.is_file() {
        let data = FileData::new(Some(DataSource::path(real)))
            .with_inode(metadata.dev(), metadata.ino());
        FsEntry::file(location).file_data(data)
    } else if file_type.is_symlink() {
        let target = fs::read_link(real)?;
        let target = target.to_str().ok_or_else(|| Error::non_utf8(&target))?;
        FsEntry::symlink(location, target)
    } else if file_type.is_char_device() || file_type.is_block_device() {
        let kind = if file_type.is_char_device() {
            DeviceKind::Char
        } else {
            DeviceKind::Block
        };
        let rdev = metadata.rdev();
        FsEntry::device(location, kind).rdev(
            nix::sys::stat::major(rdev) as u32,
            nix::sys::stat::minor(rdev) as u32,
        )
    } else if file_type.is_fifo() {
        FsEntry::fifo(location)
    } else {
        debug!("Skipping unsupported node type at {}", real.display());
        return Ok(None);
    };

    let entry = builder
        .mode(metadata.mode() & 0o7777)
        .owner(metadata.uid(), metadata.gid())
        .mtime(metadata.mtime())
        .build()?;
    Ok(Some(entry))
}

/// Stat a single location, returning `None` if nothing is there
pub fn gen_entry_at(location: &str, real: &Path) -> Result<Option<FsEntry>> {
    match fs::symlink_metadata(real) {
        Ok(metadata) => gen_entry(location, real, &metadata),
        Err(e) if is_missing(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

/// Recursive scanner over a real directory tree
#[derive(Debug, Clone)]
pub struct LivefsScanner {
    offset: Option<String>,
    include_root: bool,
}

impl Default for LivefsScanner {
    fn default() -> Self {
        Self {
            offset: None,
            include_root: true,
        }
    }
}

impl LivefsScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip `offset` from every produced location
    pub fn offset(mut self, offset: impl Into<String>) -> Self {
        let offset = path::normalize(&offset.into());
        self.offset = if offset == "/" { None } else { Some(offset) };
        self
    }

    /// Whether the starting path itself is part of the result
    ///
    /// The starting path is never yielded when it is the offset, since it
    /// would map to the root.
    pub fn include_root(mut self, include: bool) -> Self {
        self.include_root = include;
        self
    }

    fn location_for(&self, real: &Path) -> Result<Option<String>> {
        let real = path::from_path(real)?;
        match &self.offset {
            None => Ok(Some(real)),
            Some(offset) if real == *offset => Ok(None),
            Some(offset) => path::rebase(&real, offset, "/")
                .map(Some)
                .ok_or_else(|| Error::OffsetMismatch {
                    path: real.clone(),
                    offset: offset.clone(),
                }),
        }
    }

    /// Lazily walk `start`, yielding entries in sorted depth-first order
    pub fn iter_scan<'a>(&'a self, start: &Path) -> impl Iterator<Item = Result<FsEntry>> + 'a {
        let root = start.to_path_buf();
        WalkDir::new(start)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |item| {
                let item = match item {
                    Ok(item) => item,
                    Err(e) => {
                        let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                        let err = e.into_io_error().unwrap_or_else(|| {
                            io::Error::other(format!("filesystem loop at {}", path.display()))
                        });
                        return Some(Err(Error::Io(err)));
                    }
                };

                if item.depth() == 0 && !self.include_root {
                    return None;
                }

                let location = match self.location_for(item.path()) {
                    Ok(Some(location)) => location,
                    Ok(None) => return None,
                    Err(e) => return Some(Err(e)),
                };

                let metadata = match item.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        let err = e.into_io_error().unwrap_or_else(|| {
                            io::Error::other(format!("cannot stat {}", root.display()))
                        });
                        return Some(Err(Error::Io(err)));
                    }
                };

                gen_entry(&location, item.path(), &metadata).transpose()
            })
    }

    /// Walk `start` and collect every node into a content set
    pub fn scan(&self, start: &Path) -> Result<ContentSet> {
        let mut cset = ContentSet::new();
        for entry in self.iter_scan(start) {
            cset.add(entry?)?;
        }
        debug!("Scanned {} entries under {}", cset.len(), start.display());
        Ok(cset)
    }
}

/// Scan `start`, optionally relative to `offset`
pub fn scan(start: &Path, offset: Option<&str>) -> Result<ContentSet> {
    let scanner = match offset {
        Some(offset) => LivefsScanner::new().offset(offset),
        None => LivefsScanner::new(),
    };
    scanner.scan(start)
}

/// On-disk entries for every location of `cset` that exists
///
/// With `realpath`, symlinks in the parent directories are resolved and the
/// produced entries carry the resolved locations; the final component itself
/// is never followed.
pub fn intersect(cset: &ContentSet, realpath: bool) -> Result<ContentSet> {
    let mut found = ContentSet::new();

    for entry in cset.iter() {
        let real: PathBuf = if realpath {
            match fs::canonicalize(entry.dirname()) {
                Ok(parent) => parent.join(entry.basename()),
                Err(e) if is_missing(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        } else {
            entry.path().to_path_buf()
        };
        let location = path::from_path(&real)?;

        if let Some(live) = gen_entry_at(&location, &real)? {
            found.add(live)?;
        }
    }

    Ok(found)
}

/// Add on-disk entries for the resolved targets of every symlink in `cset`
///
/// Chains are followed: if a target is itself a symlink, its target is
/// looked up too. Targets that do not exist are ignored.
pub fn fill_symlink_targets(cset: &mut ContentSet) -> Result<()> {
    fill_symlink_targets_under(cset, "/")
}

/// [`fill_symlink_targets`] for a tree rooted at `root`
///
/// Absolute targets of links under `root` are looked up under `root`, never
/// on the host.
pub fn fill_symlink_targets_under(cset: &mut ContentSet, root: &str) -> Result<()> {
    let mut pending: Vec<String> = cset
        .iter_links(false)
        .filter_map(|link| link.resolved_target_under(root))
        .collect();
    let mut seen: HashSet<String> = HashSet::new();

    while let Some(target) = pending.pop() {
        if !seen.insert(target.clone()) || cset.contains(target.as_str()) {
            continue;
        }
        if let Some(live) = gen_entry_at(&target, Path::new(&target))? {
            if let Some(next) = live.resolved_target_under(root) {
                pending.push(next);
            }
            cset.add(live)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("dir")).unwrap();
        fs::write(tmp.path().join("file1"), b"one").unwrap();
        fs::write(tmp.path().join("dir/file2"), b"two").unwrap();
        symlink("dir", tmp.path().join("link")).unwrap();
        tmp
    }

    #[test]
    fn test_scan_with_offset() {
        let tmp = tree();
        let offset = tmp.path().to_str().unwrap();
        let cset = scan(tmp.path(), Some(offset)).unwrap();

        let locations: Vec<&str> = cset.locations().collect();
        assert_eq!(locations, vec!["/dir", "/dir/file2", "/file1", "/link"]);

        let link = cset.get("/link").unwrap();
        assert_eq!(link.target(), Some("dir"));
        assert_eq!(link.resolved_target().as_deref(), Some("/dir"));

        let file = cset.get("/file1").unwrap();
        assert!(file.is_strict());
        assert!(file.file_data().unwrap().inode().is_some());
    }

    #[test]
    fn test_scan_without_offset_includes_root() {
        let tmp = tree();
        let root = path::from_path(tmp.path()).unwrap();
        let cset = scan(tmp.path(), None).unwrap();
        assert!(cset.get(root.as_str()).unwrap().is_dir());

        let without_root = LivefsScanner::new()
            .include_root(false)
            .scan(tmp.path())
            .unwrap();
        assert!(!without_root.contains(root.as_str()));
        assert_eq!(without_root.len(), 4);
    }

    #[test]
    fn test_scan_of_single_file() {
        let tmp = tree();
        let cset = scan(&tmp.path().join("file1"), None).unwrap();
        assert_eq!(cset.len(), 1);
        assert!(cset.iter().next().unwrap().is_file());
    }

    #[test]
    fn test_intersect_skips_missing() {
        let tmp = tree();
        let base = path::from_path(tmp.path()).unwrap();
        let planned: ContentSet = vec![
            FsEntry::file(format!("{}/file1", base)).build_partial().unwrap(),
            FsEntry::file(format!("{}/absent", base)).build_partial().unwrap(),
            FsEntry::file(format!("{}/file1/below", base)).build_partial().unwrap(),
        ]
        .into_iter()
        .collect();

        let found = intersect(&planned, false).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains(format!("{}/file1", base).as_str()));
    }

    #[test]
    fn test_intersect_realpath_resolves_parents() {
        let tmp = tree();
        let base = path::from_path(&fs::canonicalize(tmp.path()).unwrap()).unwrap();
        let planned: ContentSet = vec![
            FsEntry::file(format!("{}/link/file2", base)).build_partial().unwrap(),
        ]
        .into_iter()
        .collect();

        let found = intersect(&planned, true).unwrap();
        assert!(found.contains(format!("{}/dir/file2", base).as_str()));
    }

    #[test]
    fn test_fill_symlink_targets_follows_chains() {
        let tmp = tree();
        symlink("link", tmp.path().join("link2")).unwrap();
        let base = path::from_path(tmp.path()).unwrap();

        let mut cset: ContentSet = vec![
            FsEntry::symlink(format!("{}/link2", base), "link").build_partial().unwrap(),
        ]
        .into_iter()
        .collect();
        fill_symlink_targets(&mut cset).unwrap();

        assert!(cset.get(format!("{}/link", base).as_str()).unwrap().is_symlink());
        assert!(cset.get(format!("{}/dir", base).as_str()).unwrap().is_dir());
    }

    #[test]
    fn test_fill_symlink_targets_stays_under_root() {
        let tmp = tree();
        symlink("/dir", tmp.path().join("abs")).unwrap();
        let base = path::from_path(tmp.path()).unwrap();

        let mut cset: ContentSet = vec![
            FsEntry::symlink(format!("{}/abs", base), "/dir").build_partial().unwrap(),
        ]
        .into_iter()
        .collect();
        fill_symlink_targets_under(&mut cset, &base).unwrap();

        let locations: Vec<&str> = cset.locations().collect();
        assert_eq!(locations.len(), 2);
        assert!(locations.iter().all(|location| path::is_under(location, &base)));
        assert!(cset.get(format!("{}/dir", base).as_str()).unwrap().is_dir());
    }
}
