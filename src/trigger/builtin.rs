// src/trigger/builtin.rs

//! Built-in triggers: the merge/unmerge steps themselves, ownership and
//! permission fixups, pruning, and base-system protection

use crate::error::Result;
use crate::filesystem::{FsEntry, path};
use crate::merge::csets::{self, CsetView};
use crate::merge::engine::{MERGE, MergeMode, PRE_MERGE, UNMERGE};
use crate::trigger::{RequiredCsets, Trigger, TriggerContext};
use std::borrow::Cow;
use std::collections::HashSet;
use tracing::debug;

/// Location of `entry` as seen from inside the offset
fn root_location<'a>(ctx: &TriggerContext<'_>, entry: &'a FsEntry) -> Option<Cow<'a, str>> {
    if ctx.offset == "/" {
        return Some(Cow::Borrowed(entry.location()));
    }
    path::rebase(entry.location(), ctx.offset, "/").map(Cow::Owned)
}

/// Writes `resolved_install` to disk
#[derive(Debug, Default)]
pub struct MergeTrigger;

impl Trigger for MergeTrigger {
    fn label(&self) -> &str {
        "merge"
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![MERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::INSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::RESOLVED_INSTALL])
    }

    fn suppress_exceptions(&self) -> bool {
        false
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let cset = csets.get(csets::RESOLVED_INSTALL)?;
        ctx.fs_ops
            .merge_contents(cset, None, &mut |entry| ctx.observer.installing_fs_obj(entry))
    }
}

/// Removes `uninstall` from disk
#[derive(Debug, Default)]
pub struct UnmergeTrigger;

impl Trigger for UnmergeTrigger {
    fn label(&self) -> &str {
        "unmerge"
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![UNMERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::UNINSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::UNINSTALL])
    }

    fn suppress_exceptions(&self) -> bool {
        false
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let cset = csets.get(csets::UNINSTALL)?;
        ctx.fs_ops
            .unmerge_contents(cset, None, &mut |entry| ctx.observer.removing_fs_obj(entry))
    }
}

/// Owner field rewritten by the uid/gid fixups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerField {
    Uid,
    Gid,
}

/// Remaps entries owned by the build user or group to the real owner
#[derive(Debug)]
struct FixOwnership {
    field: OwnerField,
    from: u32,
    to: u32,
}

impl FixOwnership {
    fn apply(&self, csets: &mut CsetView<'_>) -> Result<usize> {
        let cset = csets.get_mut(csets::NEW_CSET)?;
        let changed: Vec<FsEntry> = cset
            .iter()
            .filter_map(|entry| match self.field {
                OwnerField::Uid if entry.uid() == Some(self.from) => Some(entry.with_uid(self.to)),
                OwnerField::Gid if entry.gid() == Some(self.from) => Some(entry.with_gid(self.to)),
                _ => None,
            })
            .collect();
        let count = changed.len();
        cset.update(changed)?;
        Ok(count)
    }
}

/// Rewrites uid `from` to `to` in the new contents
#[derive(Debug)]
pub struct FixUidPerms(FixOwnership);

impl FixUidPerms {
    pub fn new(from: u32, to: u32) -> Self {
        Self(FixOwnership {
            field: OwnerField::Uid,
            from,
            to,
        })
    }
}

impl Trigger for FixUidPerms {
    fn label(&self) -> &str {
        "fix_uid_perms"
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![PRE_MERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::INSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::NEW_CSET])
    }

    fn trigger(&mut self, _ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let count = self.0.apply(csets)?;
        debug!("Remapped uid {} -> {} on {} entries", self.0.from, self.0.to, count);
        Ok(())
    }
}

/// Rewrites gid `from` to `to` in the new contents
#[derive(Debug)]
pub struct FixGidPerms(FixOwnership);

impl FixGidPerms {
    pub fn new(from: u32, to: u32) -> Self {
        Self(FixOwnership {
            field: OwnerField::Gid,
            from,
            to,
        })
    }
}

impl Trigger for FixGidPerms {
    fn label(&self) -> &str {
        "fix_gid_perms"
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![PRE_MERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::INSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::NEW_CSET])
    }

    fn trigger(&mut self, _ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let count = self.0.apply(csets)?;
        debug!("Remapped gid {} -> {} on {} entries", self.0.from, self.0.to, count);
        Ok(())
    }
}

/// Strips set-uid/set-gid (and world write) from world-writable files
#[derive(Debug, Default)]
pub struct FixSetBits;

impl Trigger for FixSetBits {
    fn label(&self) -> &str {
        "fix_set_bits"
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![PRE_MERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::INSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::NEW_CSET])
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let cset = csets.get_mut(csets::NEW_CSET)?;
        let mut fixed = Vec::new();

        for entry in cset.iter_files(false) {
            let Some(mode) = entry.mode() else { continue };
            if mode & 0o6000 == 0 || mode & 0o002 == 0 {
                continue;
            }
            let kind = if mode & 0o4000 != 0 { "SetUID" } else { "SetGID" };
            ctx.observer.warn(&format!(
                "correcting unsafe world writable {}: {}",
                kind,
                entry.location()
            ));
            fixed.push(entry.with_mode(mode & !0o6002));
        }

        cset.update(fixed)
    }
}

/// Reports (and optionally fixes) world-writable entries
#[derive(Debug)]
pub struct DetectWorldWritable {
    fix: bool,
}

impl DetectWorldWritable {
    pub fn new(fix: bool) -> Self {
        Self { fix }
    }
}

impl Trigger for DetectWorldWritable {
    fn label(&self) -> &str {
        "detect_world_writable"
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![PRE_MERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::INSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::NEW_CSET])
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let cset = csets.get_mut(csets::NEW_CSET)?;
        let writable: Vec<FsEntry> = cset
            .iter_links(true)
            .filter(|entry| entry.mode().is_some_and(|mode| mode & 0o002 != 0))
            .cloned()
            .collect();

        for entry in &writable {
            ctx.observer
                .warn(&format!("world writable file: {}", entry.location()));
        }

        if self.fix {
            let fixed: Vec<FsEntry> = writable
                .iter()
                .filter_map(|entry| entry.mode().map(|mode| entry.with_mode(mode & !0o002)))
                .collect();
            cset.update(fixed)?;
        }
        Ok(())
    }
}

type PrunePredicate = dyn Fn(&str, &FsEntry) -> bool + Send;

/// Drops entries matching a predicate before merge
///
/// The predicate sees each entry's location relative to the offset.
pub struct PruneFiles {
    label: String,
    predicate: Box<PrunePredicate>,
}

impl PruneFiles {
    pub fn new<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&str, &FsEntry) -> bool + Send + 'static,
    {
        Self {
            label: label.into(),
            predicate: Box::new(predicate),
        }
    }

    /// Prune the given paths and everything below them
    pub fn install_mask(masks: Vec<String>) -> Self {
        let masks: Vec<String> = masks.iter().map(|m| path::normalize(m)).collect();
        Self::new("install_mask", move |location, _| {
            masks
                .iter()
                .any(|mask| location == mask || path::is_under(location, mask))
        })
    }
}

impl Trigger for PruneFiles {
    fn label(&self) -> &str {
        &self.label
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![PRE_MERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::INSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::NEW_CSET])
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let cset = csets.get_mut(csets::NEW_CSET)?;
        let pruned: Vec<String> = cset
            .iter()
            .filter(|entry| {
                root_location(ctx, entry).is_some_and(|location| (self.predicate)(&location, entry))
            })
            .map(|entry| entry.location().to_string())
            .collect();

        for location in &pruned {
            ctx.observer.info(&format!("pruning: {}", location));
            cset.discard(location)?;
        }
        Ok(())
    }
}

/// Warns about common system directories not installed at 0755
#[derive(Debug)]
pub struct CommonDirectoryModes {
    directories: HashSet<String>,
}

impl CommonDirectoryModes {
    pub fn new() -> Self {
        let mut directories: Vec<String> = [
            "/usr",
            "/usr/lib",
            "/usr/lib64",
            "/usr/lib32",
            "/usr/bin",
            "/usr/sbin",
            "/usr/local",
            "/usr/share",
            "/usr/share/man",
            "/usr/share/info",
            "/lib",
            "/lib32",
            "/lib64",
            "/etc",
            "/bin",
            "/sbin",
            "/var",
        ]
        .iter()
        .map(|d| d.to_string())
        .collect();
        directories.extend((1..=9).map(|n| format!("/usr/share/man/man{}", n)));

        Self {
            directories: directories.into_iter().collect(),
        }
    }
}

impl Default for CommonDirectoryModes {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for CommonDirectoryModes {
    fn label(&self) -> &str {
        "common_directory_modes"
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![PRE_MERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::INSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::NEW_CSET])
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let cset = csets.get(csets::NEW_CSET)?;
        for dir in cset.iter_dirs(false) {
            let Some(location) = root_location(ctx, dir) else { continue };
            if !self.directories.contains(&*location) {
                continue;
            }
            if let Some(mode) = dir.mode().filter(|mode| *mode != 0o755) {
                ctx.observer.warn(&format!(
                    "{} path has mode {:o}, should be 0755",
                    location, mode
                ));
            }
        }
        Ok(())
    }
}

/// Keeps critical system paths out of every unmerge
#[derive(Debug)]
pub struct BaseSystemUnmergeProtection {
    paths: Vec<String>,
}

impl BaseSystemUnmergeProtection {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }
}

impl Trigger for BaseSystemUnmergeProtection {
    fn label(&self) -> &str {
        "base_system_unmerge_protection"
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![UNMERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::UNINSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::UNINSTALL])
    }

    fn priority(&self) -> u8 {
        0
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let cset = csets.get_mut(csets::UNINSTALL)?;
        for protected in &self.paths {
            let location = ctx.offset_path(protected);
            if cset.discard(location.as_str())?.is_some() {
                debug!("Protected {} from unmerge", location);
            }
        }
        Ok(())
    }
}
