// src/trigger/mtime.rs

//! Directory mtime snapshots for regeneration triggers
//!
//! A snapshot records the mtime of every watched directory. Directories
//! modified within the last `forced_past` seconds are pushed back in time
//! first: a change landing in the same second as the snapshot would
//! otherwise be invisible at filesystems with one-second resolution.

use crate::error::Result;
use crate::filesystem::{ContentSet, FsEntry, gen_entry, path};
use nix::sys::stat::{UtimensatFlags, utimensat};
use nix::sys::time::TimeSpec;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Seconds a fresh mtime is pushed into the past
pub const FORCED_PAST: i64 = 2;

#[derive(Debug, Default)]
pub struct MtimeWatcher {
    saved: ContentSet,
    locations: Vec<PathBuf>,
}

impl MtimeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locations of the last snapshot
    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    pub fn set_state(&mut self, locations: &[PathBuf]) -> Result<()> {
        self.set_state_with(locations, FORCED_PAST)
    }

    pub fn set_state_with(&mut self, locations: &[PathBuf], forced_past: i64) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let past = (now - forced_past).max(0);

        let mut saved = ContentSet::new();
        for dir in scan_mtimes(locations)? {
            let dir = match dir.mtime() {
                Some(mtime) if mtime > past => {
                    let ts = TimeSpec::new(past, 0);
                    utimensat(None, dir.path(), &ts, &ts, UtimensatFlags::FollowSymlink)?;
                    debug!("Pushed mtime of {} back to {}", dir.location(), past);
                    dir.with_mtime(past)
                }
                _ => dir,
            };
            saved.add(dir)?;
        }

        self.saved = saved;
        self.locations = locations.to_vec();
        Ok(())
    }

    /// Watched directories that are new or whose mtime moved since the snapshot
    pub fn get_changes(&self) -> Result<Vec<FsEntry>> {
        self.get_changes_at(&self.locations)
    }

    pub fn get_changes_at(&self, locations: &[PathBuf]) -> Result<Vec<FsEntry>> {
        Ok(scan_mtimes(locations)?
            .into_iter()
            .filter(|dir| match self.saved.get(dir) {
                Some(saved) => saved.mtime() != dir.mtime(),
                None => true,
            })
            .collect())
    }

    pub fn check_state(&self) -> Result<bool> {
        Ok(!self.get_changes()?.is_empty())
    }

    pub fn check_state_at(&self, locations: &[PathBuf]) -> Result<bool> {
        Ok(!self.get_changes_at(locations)?.is_empty())
    }
}

/// Directory entries for each existing location, following symlinks
fn scan_mtimes(locations: &[PathBuf]) -> Result<Vec<FsEntry>> {
    let mut dirs = Vec::new();
    for location in locations {
        let metadata = match fs::metadata(location) {
            Ok(metadata) => metadata,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_dir() {
            continue;
        }
        let name = path::from_path(location)?;
        if let Some(entry) = gen_entry(&name, Path::new(location), &metadata)? {
            dirs.push(entry);
        }
    }
    Ok(dirs)
}
