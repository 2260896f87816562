// src/trigger/mod.rs

//! Trigger framework
//!
//! A trigger is extension logic attached to one or more hook points of a
//! merge transaction. The engine runs the triggers of a hook in ascending
//! priority order, handing each a [`TriggerContext`] and a view of the
//! content sets it declared as required.

pub mod builtin;
pub mod mtime;
pub mod regen;
pub mod threaded;

use crate::config::{StripMode, TriggerConfig, WorldWritable};
use crate::error::{Error, Result};
use crate::filesystem::{DataSource, EntryChanges, FsEntry, FsOps};
use crate::merge::csets::CsetView;
use crate::merge::engine::MergeMode;
use crate::merge::observer::Observer;
use std::io;
use std::path::Path;
use tracing::debug;

pub use builtin::{
    BaseSystemUnmergeProtection, CommonDirectoryModes, DetectWorldWritable, FixGidPerms,
    FixSetBits, FixUidPerms, MergeTrigger, PruneFiles, UnmergeTrigger,
};
pub use mtime::MtimeWatcher;
pub use regen::{InfoRegen, LdConfig};
pub use threaded::{BinaryDebug, Threaded, ThreadedTrigger};

/// Default priority of a trigger
pub const DEFAULT_PRIORITY: u8 = 50;

/// Highest accepted priority; larger values are clamped
pub const MAX_PRIORITY: u8 = 100;

/// Content sets a trigger wants access to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequiredCsets {
    /// Every registered set
    All,
    /// Only these names
    Named(Vec<&'static str>),
}

impl RequiredCsets {
    pub fn named(names: &[&'static str]) -> Self {
        RequiredCsets::Named(names.to_vec())
    }
}

/// Everything a trigger may look at while it runs
pub struct TriggerContext<'a> {
    pub mode: MergeMode,
    pub phase: &'a str,
    pub offset: &'a str,
    pub tempdir: &'a Path,
    pub observer: &'a dyn Observer,
    pub fs_ops: &'a dyn FsOps,
    pub parallelism: usize,
}

impl TriggerContext<'_> {
    /// Scratch copy of a file's data that may be rewritten in place
    pub fn get_writable_fsobj(&self, entry: &FsEntry, prefer_reuse: bool) -> Result<FsEntry> {
        get_writable_fsobj(self.tempdir, entry, prefer_reuse)
    }

    /// Join an absolute location onto the transaction offset
    pub fn offset_path(&self, location: &str) -> String {
        crate::filesystem::path::join(self.offset, location)
    }
}

/// Extension logic bound to hook points
pub trait Trigger: Send {
    fn label(&self) -> &str;

    /// Hook points to attach to in `mode`
    fn hooks(&self, mode: MergeMode) -> Vec<&'static str>;

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::ALL
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::All
    }

    /// Ascending execution order within a hook, `0..=100`
    fn priority(&self) -> u8 {
        DEFAULT_PRIORITY
    }

    /// Whether unclassified errors are logged instead of aborting
    fn suppress_exceptions(&self) -> bool {
        true
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()>;
}

/// Return a copy of `entry` whose data is a private, writable file
///
/// Data that is already writable is returned as is. With `prefer_reuse`, data
/// already living inside `tempdir` is adopted in place instead of copied.
pub fn get_writable_fsobj(tempdir: &Path, entry: &FsEntry, prefer_reuse: bool) -> Result<FsEntry> {
    let data = entry
        .data()
        .ok_or_else(|| Error::InvalidEntry(format!("{} has no file data", entry.location())))?;

    if data.is_mutable() {
        return Ok(entry.clone());
    }

    if prefer_reuse {
        if let Some(path) = data.local_path().filter(|p| p.starts_with(tempdir)) {
            return entry.with_attributes(&EntryChanges::new().data(DataSource::mutable_path(path)));
        }
    }

    let mut scratch = tempfile::Builder::new()
        .prefix("writable-")
        .tempfile_in(tempdir)?;
    let mut reader = data.open()?;
    io::copy(&mut reader, scratch.as_file_mut())?;
    let (_, path) = scratch.keep().map_err(|e| Error::Io(e.error))?;
    debug!("Writable copy of {} at {}", entry.location(), path.display());

    entry.with_attributes(&EntryChanges::new().data(DataSource::mutable_path(path)))
}

/// Triggers enabled by `config`, in registration order
pub fn default_triggers(config: &TriggerConfig) -> Vec<Box<dyn Trigger>> {
    let mut triggers: Vec<Box<dyn Trigger>> = Vec::new();

    if let Some(build_uid) = config.build_uid {
        triggers.push(Box::new(FixUidPerms::new(build_uid, config.owner_uid)));
    }
    if let Some(build_gid) = config.build_gid {
        triggers.push(Box::new(FixGidPerms::new(build_gid, config.owner_gid)));
    }
    if config.fix_set_bits {
        triggers.push(Box::new(FixSetBits));
    }
    match config.world_writable {
        WorldWritable::Ignore => {}
        WorldWritable::Warn => triggers.push(Box::new(DetectWorldWritable::new(false))),
        WorldWritable::Fix => triggers.push(Box::new(DetectWorldWritable::new(true))),
    }
    if !config.install_mask.is_empty() {
        triggers.push(Box::new(PruneFiles::install_mask(config.install_mask.clone())));
    }
    if config.common_directory_modes {
        triggers.push(Box::new(CommonDirectoryModes::new()));
    }
    if !config.protected_paths.is_empty() {
        triggers.push(Box::new(BaseSystemUnmergeProtection::new(
            config.protected_paths.clone(),
        )));
    }
    if config.ldconfig.enabled {
        triggers.push(Box::new(LdConfig::new(
            config.ldconfig.binary.clone(),
            &config.ldconfig.ld_so_conf,
        )));
    }
    if config.info_regen.enabled {
        triggers.push(Box::new(InfoRegen::new(config.info_regen.dirs.clone())));
    }
    if config.strip.mode != StripMode::None {
        triggers.push(Box::new(Threaded::new(BinaryDebug::from_settings(&config.strip))));
    }

    triggers
}
