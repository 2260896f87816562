// src/merge/engine.rs

//! The merge engine: one install, uninstall or replace transaction
//!
//! An engine owns the named content sets of the transaction, a table of hook
//! points for its mode, the triggers attached to them, and a private scratch
//! directory. [`MergeEngine::run`] walks the hook points in order; each
//! phase regenerates the non-preserved content sets and runs its triggers by
//! ascending priority.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::filesystem::{self, ContentSet, FsEntry, FsOps, LiveFsOps, path};
use crate::merge::csets::{self, CsetRegistry, CsetSource, CsetView};
use crate::merge::observer::{Observer, TracingObserver};
use crate::packages::Package;
use crate::trigger::{
    self, MAX_PRIORITY, MergeTrigger, RequiredCsets, Trigger, TriggerContext, UnmergeTrigger,
};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

pub const SANITY_CHECK: &str = "sanity_check";
pub const PRE_MERGE: &str = "pre_merge";
pub const MERGE: &str = "merge";
pub const POST_MERGE: &str = "post_merge";
pub const PRE_UNMERGE: &str = "pre_unmerge";
pub const UNMERGE: &str = "unmerge";
pub const POST_UNMERGE: &str = "post_unmerge";
pub const FINAL: &str = "final";

const INSTALL_HOOKS: [&str; 5] = [SANITY_CHECK, PRE_MERGE, MERGE, POST_MERGE, FINAL];
const UNINSTALL_HOOKS: [&str; 5] = [SANITY_CHECK, PRE_UNMERGE, UNMERGE, POST_UNMERGE, FINAL];
const REPLACE_HOOKS: [&str; 8] = [
    SANITY_CHECK,
    PRE_MERGE,
    MERGE,
    POST_MERGE,
    PRE_UNMERGE,
    UNMERGE,
    POST_UNMERGE,
    FINAL,
];

/// Kind of transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeMode {
    Install,
    Uninstall,
    Replace,
}

impl MergeMode {
    pub const ALL: [MergeMode; 3] = [MergeMode::Install, MergeMode::Uninstall, MergeMode::Replace];
    pub const INSTALLING: [MergeMode; 2] = [MergeMode::Install, MergeMode::Replace];
    pub const UNINSTALLING: [MergeMode; 2] = [MergeMode::Uninstall, MergeMode::Replace];

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMode::Install => "install",
            MergeMode::Uninstall => "uninstall",
            MergeMode::Replace => "replace",
        }
    }

    /// Hook points of this mode, in execution order
    pub fn hooks(&self) -> &'static [&'static str] {
        match self {
            MergeMode::Install => &INSTALL_HOOKS,
            MergeMode::Uninstall => &UNINSTALL_HOOKS,
            MergeMode::Replace => &REPLACE_HOOKS,
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(MergeMode::Install),
            "uninstall" => Ok(MergeMode::Uninstall),
            "replace" => Ok(MergeMode::Replace),
            _ => Err(format!("Invalid merge mode: {}", s)),
        }
    }
}

/// One install/uninstall/replace transaction
pub struct MergeEngine {
    mode: MergeMode,
    offset: String,
    tempdir: TempDir,
    observer: Arc<dyn Observer>,
    fs_ops: Arc<dyn FsOps>,
    csets: CsetRegistry,
    hooks: Vec<(&'static str, Vec<usize>)>,
    triggers: Vec<Box<dyn Trigger>>,
    phase: Option<&'static str>,
    parallelism: usize,
}

impl MergeEngine {
    fn new(mode: MergeMode, config: &EngineConfig) -> Result<Self> {
        if !config.offset.starts_with('/') {
            return Err(Error::InvalidOffset(config.offset.clone()));
        }
        let offset = path::normalize(&config.offset);

        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("fsmerge-");
            builder
        };
        let tempdir = match &config.tempdir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };

        debug!(
            "Created {} engine at offset {} (scratch {})",
            mode,
            offset,
            tempdir.path().display()
        );

        Ok(Self {
            mode,
            offset,
            tempdir,
            observer: Arc::new(TracingObserver),
            fs_ops: Arc::new(LiveFsOps),
            csets: CsetRegistry::new(),
            hooks: mode.hooks().iter().map(|hook| (*hook, Vec::new())).collect(),
            triggers: Vec::new(),
            phase: None,
            parallelism: config.worker_count(),
        })
    }

    /// Engine that merges `pkg` onto the offset
    pub fn install(pkg: Arc<dyn Package>, config: &EngineConfig) -> Result<Self> {
        info!("Preparing install of {}", pkg.identity());
        let mut engine = Self::new(MergeMode::Install, config)?;
        engine.register_install_csets(pkg);
        engine.register_triggers(config)?;
        Ok(engine)
    }

    /// Engine that removes `pkg` from the offset
    pub fn uninstall(pkg: Arc<dyn Package>, config: &EngineConfig) -> Result<Self> {
        info!("Preparing uninstall of {}", pkg.identity());
        let mut engine = Self::new(MergeMode::Uninstall, config)?;
        engine.register_uninstall_csets(pkg);
        engine
            .csets
            .add_source(csets::UNINSTALL, CsetSource::alias(csets::OLD_CSET));
        engine.register_triggers(config)?;
        Ok(engine)
    }

    /// Engine that merges `new` over an installed `old`
    ///
    /// Paths owned by both packages are rewritten in place and never
    /// removed; only paths exclusive to `old` are unmerged.
    pub fn replace(
        old: Arc<dyn Package>,
        new: Arc<dyn Package>,
        config: &EngineConfig,
    ) -> Result<Self> {
        info!("Preparing replace of {} with {}", old.identity(), new.identity());
        let mut engine = Self::new(MergeMode::Replace, config)?;
        engine.register_install_csets(new);
        engine.register_uninstall_csets(old);

        engine.csets.add_source(
            csets::UNINSTALL,
            CsetSource::computed(|registry| {
                let old = registry.resolve(csets::OLD_CSET)?.clone();
                Ok(old.difference(registry.resolve(csets::RESOLVED_INSTALL)?))
            }),
        );
        engine.csets.add_source(
            csets::MODIFYING,
            CsetSource::computed(|registry| {
                let resolved = registry.resolve(csets::RESOLVED_INSTALL)?.clone();
                Ok(resolved.intersection(registry.resolve(csets::OLD_CSET)?))
            }),
        );
        engine.csets.add_source(
            csets::REPLACE,
            CsetSource::computed(|registry| {
                let old = registry.resolve(csets::OLD_CSET)?.clone();
                Ok(old.intersection(registry.resolve(csets::RESOLVED_INSTALL)?))
            }),
        );

        engine.register_triggers(config)?;
        Ok(engine)
    }

    fn register_install_csets(&mut self, pkg: Arc<dyn Package>) {
        let offset = self.offset.clone();
        self.csets.add_source(
            csets::RAW_NEW_CSET,
            CsetSource::computed(move |_| project_contents(pkg.as_ref(), &offset)),
        );
        self.csets
            .add_preserved_source(csets::NEW_CSET, CsetSource::alias(csets::RAW_NEW_CSET));
        self.csets
            .add_source(csets::INSTALL, CsetSource::alias(csets::NEW_CSET));

        let offset = self.offset.clone();
        self.csets.add_source(
            csets::RESOLVED_INSTALL,
            CsetSource::computed(move |registry| {
                let new = registry.resolve(csets::NEW_CSET)?.clone();
                resolve_install(&new, &offset)
            }),
        );
        self.csets.add_source(
            csets::INSTALL_EXISTING,
            CsetSource::computed(|registry| {
                filesystem::intersect(registry.resolve(csets::INSTALL)?, false)
            }),
        );
    }

    fn register_uninstall_csets(&mut self, pkg: Arc<dyn Package>) {
        let offset = self.offset.clone();
        self.csets.add_source(
            csets::RAW_OLD_CSET,
            CsetSource::computed(move |_| project_contents(pkg.as_ref(), &offset)),
        );
        self.csets
            .add_preserved_source(csets::OLD_CSET, CsetSource::alias(csets::RAW_OLD_CSET));
        self.csets.add_source(
            csets::UNINSTALL_EXISTING,
            CsetSource::computed(|registry| {
                filesystem::intersect(registry.resolve(csets::UNINSTALL)?, false)
            }),
        );
    }

    fn register_triggers(&mut self, config: &EngineConfig) -> Result<()> {
        self.add_trigger(Box::new(MergeTrigger))?;
        self.add_trigger(Box::new(UnmergeTrigger))?;

        if config.disable_plugins {
            debug!("Plugins disabled, only merge/unmerge triggers registered");
            return Ok(());
        }
        for trigger in trigger::default_triggers(&config.triggers) {
            self.add_trigger(trigger)?;
        }
        Ok(())
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_fs_ops(mut self, fs_ops: Arc<dyn FsOps>) -> Self {
        self.fs_ops = fs_ops;
        self
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    pub fn offset(&self) -> &str {
        &self.offset
    }

    pub fn tempdir(&self) -> &Path {
        self.tempdir.path()
    }

    /// Hook currently (or last) running
    pub fn phase(&self) -> Option<&'static str> {
        self.phase
    }

    /// Hook points of this transaction, in execution order
    pub fn hooks(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|(hook, _)| *hook).collect()
    }

    /// Labels of the triggers attached to `hook`, in execution order
    pub fn triggers_for(&self, hook: &str) -> Result<Vec<String>> {
        let indices = self.hook_indices(hook)?;
        Ok(self
            .ordered(indices)
            .into_iter()
            .map(|idx| self.triggers[idx].label().to_string())
            .collect())
    }

    /// Attach a trigger to every hook it names that this mode knows
    ///
    /// Returns `false` without error when the trigger does not apply to this
    /// mode or names no known hook. Required content sets must be registered.
    pub fn add_trigger(&mut self, trigger: Box<dyn Trigger>) -> Result<bool> {
        if !trigger.applicable_modes().contains(&self.mode) {
            debug!("Trigger {} does not apply to {}", trigger.label(), self.mode);
            return Ok(false);
        }

        let known: Vec<&'static str> = trigger
            .hooks(self.mode)
            .into_iter()
            .filter(|hook| {
                let found = self.hooks.iter().any(|(name, _)| name == hook);
                if !found {
                    debug!("Trigger {} skipped unknown hook {}", trigger.label(), hook);
                }
                found
            })
            .collect();
        if known.is_empty() {
            return Ok(false);
        }

        if let RequiredCsets::Named(names) = trigger.required_csets(self.mode) {
            if let Some(missing) = names.iter().find(|name| !self.csets.contains(name)) {
                return Err(Error::UnknownCset(missing.to_string()));
            }
        }

        let idx = self.triggers.len();
        debug!("Registered trigger {} on {:?}", trigger.label(), known);
        self.triggers.push(trigger);
        for (name, indices) in self.hooks.iter_mut() {
            if known.contains(name) {
                indices.push(idx);
            }
        }
        Ok(true)
    }

    /// Register a regenerated content set
    pub fn add_cset(&mut self, name: impl Into<String>, source: CsetSource) {
        self.csets.add_source(name, source);
    }

    /// Register a content set computed once for the whole transaction
    pub fn add_preserved_cset(&mut self, name: impl Into<String>, source: CsetSource) {
        self.csets.add_preserved_source(name, source);
    }

    /// Overwrite the current value of a registered content set
    pub fn replace_cset(&mut self, name: &str, cset: ContentSet) -> Result<()> {
        self.csets.set(name, cset)
    }

    pub fn get_cset(&mut self, name: &str) -> Result<&ContentSet> {
        self.csets.resolve(name).map(|cset| &*cset)
    }

    pub fn get_writable_fsobj(&self, entry: &FsEntry, prefer_reuse: bool) -> Result<FsEntry> {
        trigger::get_writable_fsobj(self.tempdir.path(), entry, prefer_reuse)
    }

    fn hook_indices(&self, hook: &str) -> Result<&[usize]> {
        self.hooks
            .iter()
            .find(|(name, _)| *name == hook)
            .map(|(_, indices)| indices.as_slice())
            .ok_or_else(|| Error::UnknownHook(hook.to_string()))
    }

    fn ordered(&self, indices: &[usize]) -> Vec<usize> {
        let mut order = indices.to_vec();
        order.sort_by_key(|idx| self.triggers[*idx].priority().min(MAX_PRIORITY));
        order
    }

    /// Run every trigger attached to `hook`
    pub fn run_hook(&mut self, hook: &str) -> Result<()> {
        let Some(hook) = self
            .hooks
            .iter()
            .map(|(name, _)| *name)
            .find(|name| *name == hook)
        else {
            return Err(Error::UnknownHook(hook.to_string()));
        };
        let order = self.ordered(self.hook_indices(hook)?);

        self.phase = Some(hook);
        self.observer.phase_start(hook);
        self.csets.regenerate();

        for idx in order {
            let trigger = &mut self.triggers[idx];
            let label = trigger.label().to_string();

            let allowed = match trigger.required_csets(self.mode) {
                RequiredCsets::All => None,
                RequiredCsets::Named(names) => {
                    for name in &names {
                        self.csets.resolve(name)?;
                    }
                    Some(names.iter().map(|n| n.to_string()).collect::<HashSet<_>>())
                }
            };

            self.observer.trigger_start(hook, &label);
            let ctx = TriggerContext {
                mode: self.mode,
                phase: hook,
                offset: &self.offset,
                tempdir: self.tempdir.path(),
                observer: self.observer.as_ref(),
                fs_ops: self.fs_ops.as_ref(),
                parallelism: self.parallelism,
            };
            let mut view = CsetView::new(&mut self.csets, allowed);

            match trigger.trigger(&ctx, &mut view) {
                Ok(()) => {}
                Err(e) if e.is_trigger_fatal() => {
                    self.observer
                        .error(&format!("trigger {} aborted {}: {}", label, hook, e));
                    return Err(e);
                }
                Err(e) if trigger.suppress_exceptions() => {
                    self.observer
                        .warn(&format!("trigger {} failed in {}: {}", label, hook, e));
                }
                Err(e) => {
                    self.observer
                        .error(&format!("trigger {} failed in {}: {}", label, hook, e));
                    return Err(e);
                }
            }
            self.observer.trigger_end(hook, &label);
        }

        self.observer.phase_end(hook);
        Ok(())
    }

    /// Run every hook point of the transaction in order
    pub fn run(&mut self) -> Result<()> {
        info!("Running {} transaction at {}", self.mode, self.offset);
        for hook in self.mode.hooks() {
            self.run_hook(hook)?;
        }
        info!("{} transaction complete", self.mode);
        Ok(())
    }
}

/// Package contents projected under `offset`
fn project_contents(pkg: &dyn Package, offset: &str) -> Result<ContentSet> {
    let contents = pkg.contents()?;
    if offset == "/" {
        Ok(contents.thaw())
    } else {
        contents.insert_offset(offset)
    }
}

/// Map a planned install onto the live filesystem
///
/// Directories the plan needs (including implied parents) that exist on disk
/// as symlinks get their children rewritten to the symlink targets, resolved
/// inside the offset.
fn resolve_install(new: &ContentSet, offset: &str) -> Result<ContentSet> {
    let mut lookup = new.thaw();
    lookup.add_missing_directories()?;
    let lookup: ContentSet = lookup
        .iter_dirs(false)
        .filter(|dir| offset == "/" || dir.location() == offset || path::is_under(dir.location(), offset))
        .cloned()
        .collect();

    let mut live = filesystem::intersect(&lookup, false)?;
    if live.iter_links(false).next().is_none() {
        return Ok(new.thaw());
    }
    filesystem::fill_symlink_targets_under(&mut live, offset)?;
    new.map_directory_structure_under(&live, true, offset)
}
