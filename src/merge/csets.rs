// src/merge/csets.rs

//! Named, lazily computed content sets of a merge transaction
//!
//! Each name maps to a [`CsetSource`]: either an alias of another name or a
//! function computing the set. Values are cached on first use. Regular names
//! are dropped from the cache at every phase boundary, so each phase sees a
//! freshly derived view; preserved names are computed once and kept for the
//! whole transaction.

use crate::error::{Error, Result};
use crate::filesystem::ContentSet;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub const RAW_NEW_CSET: &str = "raw_new_cset";
pub const NEW_CSET: &str = "new_cset";
pub const INSTALL: &str = "install";
pub const RESOLVED_INSTALL: &str = "resolved_install";
pub const INSTALL_EXISTING: &str = "install_existing";
pub const REPLACE: &str = "replace";
pub const MODIFYING: &str = "modifying";
pub const RAW_OLD_CSET: &str = "raw_old_cset";
pub const OLD_CSET: &str = "old_cset";
pub const UNINSTALL: &str = "uninstall";
pub const UNINSTALL_EXISTING: &str = "uninstall_existing";

/// Function computing a content set from other registered sets
pub type CsetFn = dyn Fn(&mut CsetRegistry) -> Result<ContentSet> + Send + Sync;

/// Where a named content set comes from
#[derive(Clone)]
pub enum CsetSource {
    /// Copy of another named set
    Alias(String),
    /// Computed on demand
    Computed(Arc<CsetFn>),
}

impl CsetSource {
    pub fn alias(name: impl Into<String>) -> Self {
        CsetSource::Alias(name.into())
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&mut CsetRegistry) -> Result<ContentSet> + Send + Sync + 'static,
    {
        CsetSource::Computed(Arc::new(f))
    }

    /// A source that always yields a copy of `cset`
    pub fn constant(cset: ContentSet) -> Self {
        CsetSource::computed(move |_| Ok(cset.thaw()))
    }
}

impl fmt::Debug for CsetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsetSource::Alias(name) => write!(f, "Alias({})", name),
            CsetSource::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

#[derive(Debug, Default)]
pub struct CsetRegistry {
    sources: HashMap<String, CsetSource>,
    preserve: HashSet<String>,
    preserved: HashMap<String, ContentSet>,
    cache: HashMap<String, ContentSet>,
    resolving: Vec<String>,
}

impl CsetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a regenerated set
    pub fn add_source(&mut self, name: impl Into<String>, source: CsetSource) {
        let name = name.into();
        self.preserve.remove(&name);
        self.preserved.remove(&name);
        self.cache.remove(&name);
        self.sources.insert(name, source);
    }

    /// Register a set that is computed once per transaction
    pub fn add_preserved_source(&mut self, name: impl Into<String>, source: CsetSource) {
        let name = name.into();
        self.cache.remove(&name);
        self.preserved.remove(&name);
        self.sources.insert(name.clone(), source);
        self.preserve.insert(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn is_preserved(&self, name: &str) -> bool {
        self.preserve.contains(name)
    }

    /// Forget cached values of every non-preserved set
    pub fn regenerate(&mut self) {
        self.cache.clear();
    }

    /// Value of `name`, computing it if needed
    pub fn resolve(&mut self, name: &str) -> Result<&mut ContentSet> {
        if self.preserve.contains(name) {
            if !self.preserved.contains_key(name) {
                let cset = self.compute(name)?;
                self.preserved.insert(name.to_string(), cset);
            }
            return self
                .preserved
                .get_mut(name)
                .ok_or_else(|| Error::UnknownCset(name.to_string()));
        }

        if !self.cache.contains_key(name) {
            let cset = self.compute(name)?;
            self.cache.insert(name.to_string(), cset);
        }
        self.cache
            .get_mut(name)
            .ok_or_else(|| Error::UnknownCset(name.to_string()))
    }

    /// Overwrite the current value of `name`
    ///
    /// For regenerated sets the value lasts until the next phase boundary.
    pub fn set(&mut self, name: &str, cset: ContentSet) -> Result<()> {
        if !self.contains(name) {
            return Err(Error::UnknownCset(name.to_string()));
        }
        if self.preserve.contains(name) {
            self.preserved.insert(name.to_string(), cset);
        } else {
            self.cache.insert(name.to_string(), cset);
        }
        Ok(())
    }

    fn compute(&mut self, name: &str) -> Result<ContentSet> {
        let source = self
            .sources
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCset(name.to_string()))?;

        if self.resolving.iter().any(|n| n == name) {
            return Err(Error::CsetCycle(name.to_string()));
        }

        self.resolving.push(name.to_string());
        let result = match source {
            CsetSource::Alias(target) => self.resolve(&target).map(|cset| cset.thaw()),
            CsetSource::Computed(f) => f(self),
        };
        self.resolving.pop();
        result
    }
}

/// A trigger's window onto the registry
///
/// Only the names the trigger declared are reachable; `None` allows all.
pub struct CsetView<'a> {
    registry: &'a mut CsetRegistry,
    allowed: Option<HashSet<String>>,
}

impl<'a> CsetView<'a> {
    pub fn new(registry: &'a mut CsetRegistry, allowed: Option<HashSet<String>>) -> Self {
        Self { registry, allowed }
    }

    fn check(&self, name: &str) -> Result<()> {
        match &self.allowed {
            Some(allowed) if !allowed.contains(name) => {
                Err(Error::CsetNotRequired(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn get(&mut self, name: &str) -> Result<&ContentSet> {
        self.check(name)?;
        self.registry.resolve(name).map(|cset| &*cset)
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut ContentSet> {
        self.check(name)?;
        self.registry.resolve(name)
    }

    /// Replace the value of `name` for the rest of the phase
    pub fn replace(&mut self, name: &str, cset: ContentSet) -> Result<()> {
        self.check(name)?;
        self.registry.set(name, cset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::FsEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn one(location: &str) -> ContentSet {
        vec![FsEntry::dir(location).build_partial().unwrap()]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_alias_is_a_copy() {
        let mut registry = CsetRegistry::new();
        registry.add_source("base", CsetSource::constant(one("/a")));
        registry.add_source("alias", CsetSource::alias("base"));

        registry
            .resolve("alias")
            .unwrap()
            .add(FsEntry::dir("/b").build_partial().unwrap())
            .unwrap();

        assert_eq!(registry.resolve("base").unwrap().len(), 1);
        assert_eq!(registry.resolve("alias").unwrap().len(), 2);
    }

    #[test]
    fn test_regenerate_drops_changes_unless_preserved() {
        let mut registry = CsetRegistry::new();
        registry.add_source("fresh", CsetSource::constant(one("/a")));
        registry.add_preserved_source("kept", CsetSource::constant(one("/a")));
        assert!(!registry.is_preserved("fresh"));
        assert!(registry.is_preserved("kept"));

        for name in ["fresh", "kept"] {
            registry
                .resolve(name)
                .unwrap()
                .add(FsEntry::dir("/b").build_partial().unwrap())
                .unwrap();
        }
        registry.regenerate();

        assert_eq!(registry.resolve("fresh").unwrap().len(), 1);
        assert_eq!(registry.resolve("kept").unwrap().len(), 2);

        // Re-registering as regenerated drops the preserved value
        registry.add_source("kept", CsetSource::constant(one("/c")));
        assert!(!registry.is_preserved("kept"));
        assert!(registry.resolve("kept").unwrap().contains("/c"));
    }

    #[test]
    fn test_computed_runs_once_per_phase() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = CsetRegistry::new();
        registry.add_source(
            "counted",
            CsetSource::computed(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ContentSet::new())
            }),
        );

        registry.resolve("counted").unwrap();
        registry.resolve("counted").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.regenerate();
        registry.resolve("counted").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_computed_reads_other_sets() {
        let mut registry = CsetRegistry::new();
        registry.add_source("left", CsetSource::constant(one("/a")));
        registry.add_source("right", CsetSource::constant(one("/b")));
        registry.add_source(
            "both",
            CsetSource::computed(|csets| {
                let left = csets.resolve("left")?.clone();
                Ok(left.union(csets.resolve("right")?))
            }),
        );
        assert_eq!(registry.resolve("both").unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_and_cyclic_names() {
        let mut registry = CsetRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(Error::UnknownCset(_))
        ));

        registry.add_source("a", CsetSource::alias("b"));
        registry.add_source("b", CsetSource::alias("a"));
        assert!(matches!(registry.resolve("a"), Err(Error::CsetCycle(_))));
    }

    #[test]
    fn test_view_enforces_declared_names() {
        let mut registry = CsetRegistry::new();
        registry.add_source("a", CsetSource::constant(one("/a")));
        registry.add_source("b", CsetSource::constant(one("/b")));

        let allowed: HashSet<String> = ["a".to_string()].into_iter().collect();
        let mut view = CsetView::new(&mut registry, Some(allowed));
        assert!(view.get("a").is_ok());
        assert!(matches!(view.get("b"), Err(Error::CsetNotRequired(_))));

        view.replace("a", ContentSet::new()).unwrap();
        assert!(view.get("a").unwrap().is_empty());
    }
}
