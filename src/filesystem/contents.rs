// src/filesystem/contents.rs

//! Content sets: the collection of filesystem entries a package owns
//!
//! A [`ContentSet`] holds at most one entry per location. Set algebra is
//! keyed purely on location, so an intersection keeps entries whose *paths*
//! match even if their metadata differs. Sets are either mutable or frozen;
//! every mutating call on a frozen set fails with `ImmutableSet`.

use crate::error::{Error, Result};
use crate::filesystem::entry::{EntryType, FsEntry};
use crate::filesystem::path;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// Anything that names an entry location
pub trait AsLocation {
    fn as_location(&self) -> &str;
}

impl AsLocation for FsEntry {
    fn as_location(&self) -> &str {
        self.location()
    }
}

impl AsLocation for str {
    fn as_location(&self) -> &str {
        self
    }
}

impl AsLocation for String {
    fn as_location(&self) -> &str {
        self
    }
}

impl<T: AsLocation + ?Sized> AsLocation for &T {
    fn as_location(&self) -> &str {
        (**self).as_location()
    }
}

/// Attributes for directories synthesized by `add_missing_directories`
#[derive(Debug, Clone)]
pub struct DirTemplate {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: Option<i64>,
}

impl Default for DirTemplate {
    fn default() -> Self {
        Self {
            mode: 0o775,
            uid: 0,
            gid: 0,
            mtime: None,
        }
    }
}

/// Location-keyed set of filesystem entries
#[derive(Debug, Clone, Default)]
pub struct ContentSet {
    entries: BTreeMap<String, FsEntry>,
    frozen: bool,
}

impl ContentSet {
    /// Create an empty, mutable set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frozen set from entries
    pub fn frozen(entries: impl IntoIterator<Item = FsEntry>) -> Self {
        entries.into_iter().collect::<ContentSet>().freeze()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Consume the set and return a frozen version of it
    pub fn freeze(mut self) -> Self {
        self.frozen = true;
        self
    }

    /// Mutable copy of this set
    pub fn thaw(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            frozen: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in location order (parents before children)
    pub fn iter(&self) -> impl Iterator<Item = &FsEntry> {
        self.entries.values()
    }

    pub fn locations(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains<K: AsLocation + ?Sized>(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn get<K: AsLocation + ?Sized>(&self, key: &K) -> Option<&FsEntry> {
        let raw = key.as_location();
        if let Some(entry) = self.entries.get(raw) {
            return Some(entry);
        }
        path::location(raw)
            .ok()
            .and_then(|normalized| self.entries.get(&normalized))
    }

    fn check_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(Error::ImmutableSet);
        }
        Ok(())
    }

    /// Add an entry, replacing any existing entry at the same location
    pub fn add(&mut self, entry: FsEntry) -> Result<()> {
        self.check_mutable()?;
        self.entries.insert(entry.location().to_string(), entry);
        Ok(())
    }

    /// Remove an entry, failing if nothing is at that location
    pub fn remove<K: AsLocation + ?Sized>(&mut self, key: &K) -> Result<FsEntry> {
        self.check_mutable()?;
        let location = path::location(key.as_location())?;
        self.entries
            .remove(&location)
            .ok_or(Error::NotFound(location))
    }

    /// Remove an entry if present
    pub fn discard<K: AsLocation + ?Sized>(&mut self, key: &K) -> Result<Option<FsEntry>> {
        self.check_mutable()?;
        let location = path::location(key.as_location())?;
        Ok(self.entries.remove(&location))
    }

    pub fn clear(&mut self) -> Result<()> {
        self.check_mutable()?;
        self.entries.clear();
        Ok(())
    }

    /// Add every entry, replacing existing entries at the same locations
    pub fn update(&mut self, entries: impl IntoIterator<Item = FsEntry>) -> Result<()> {
        self.check_mutable()?;
        for entry in entries {
            self.entries.insert(entry.location().to_string(), entry);
        }
        Ok(())
    }

    /// Entries of one type, or of every other type when `invert` is set
    pub fn iter_type(&self, ty: EntryType, invert: bool) -> impl Iterator<Item = &FsEntry> {
        self.entries
            .values()
            .filter(move |entry| (entry.entry_type() == ty) != invert)
    }

    pub fn iter_files(&self, invert: bool) -> impl Iterator<Item = &FsEntry> {
        self.iter_type(EntryType::File, invert)
    }

    pub fn iter_dirs(&self, invert: bool) -> impl Iterator<Item = &FsEntry> {
        self.iter_type(EntryType::Dir, invert)
    }

    pub fn iter_links(&self, invert: bool) -> impl Iterator<Item = &FsEntry> {
        self.iter_type(EntryType::Symlink, invert)
    }

    pub fn iter_devices(&self, invert: bool) -> impl Iterator<Item = &FsEntry> {
        self.iter_type(EntryType::Device, invert)
    }

    pub fn iter_fifos(&self, invert: bool) -> impl Iterator<Item = &FsEntry> {
        self.iter_type(EntryType::Fifo, invert)
    }

    /// Entries lying strictly below `start`
    pub fn child_nodes(&self, start: &str) -> ContentSet {
        let start = path::normalize(start);
        let entries = if start == "/" {
            self.entries
                .iter()
                .filter(|(location, _)| location.as_str() != "/")
                .map(|(location, entry)| (location.clone(), entry.clone()))
                .collect()
        } else {
            let prefix = format!("{}/", start);
            self.entries
                .range(prefix.clone()..)
                .take_while(|(location, _)| location.starts_with(&prefix))
                .map(|(location, entry)| (location.clone(), entry.clone()))
                .collect()
        };
        ContentSet {
            entries,
            frozen: false,
        }
    }

    fn has_children(&self, start: &str) -> bool {
        let prefix = format!("{}/", start.trim_end_matches('/'));
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(location, _)| location.starts_with(&prefix))
    }

    /// Union; for shared locations the entry from `other` wins
    pub fn union(&self, other: &ContentSet) -> ContentSet {
        let mut entries = self.entries.clone();
        for (location, entry) in &other.entries {
            entries.insert(location.clone(), entry.clone());
        }
        ContentSet {
            entries,
            frozen: false,
        }
    }

    /// Entries of `self` whose location is also in `other`
    pub fn intersection(&self, other: &ContentSet) -> ContentSet {
        self.entries
            .values()
            .filter(|entry| other.entries.contains_key(entry.location()))
            .cloned()
            .collect()
    }

    /// Entries of `self` whose location is not in `other`
    pub fn difference(&self, other: &ContentSet) -> ContentSet {
        self.entries
            .values()
            .filter(|entry| !other.entries.contains_key(entry.location()))
            .cloned()
            .collect()
    }

    /// Entries whose location is in exactly one of the two sets
    pub fn symmetric_difference(&self, other: &ContentSet) -> ContentSet {
        let mut result = self.difference(other);
        result
            .entries
            .extend(other.difference(self).entries);
        result
    }

    pub fn union_update(&mut self, other: &ContentSet) -> Result<()> {
        self.update(other.iter().cloned())
    }

    pub fn intersection_update(&mut self, other: &ContentSet) -> Result<()> {
        self.check_mutable()?;
        self.entries
            .retain(|location, _| other.entries.contains_key(location));
        Ok(())
    }

    pub fn difference_update(&mut self, other: &ContentSet) -> Result<()> {
        self.check_mutable()?;
        self.entries
            .retain(|location, _| !other.entries.contains_key(location));
        Ok(())
    }

    pub fn symmetric_difference_update(&mut self, other: &ContentSet) -> Result<()> {
        self.check_mutable()?;
        for (location, entry) in &other.entries {
            if self.entries.remove(location).is_none() {
                self.entries.insert(location.clone(), entry.clone());
            }
        }
        Ok(())
    }

    pub fn issubset(&self, other: &ContentSet) -> bool {
        self.entries.keys().all(|location| other.entries.contains_key(location))
    }

    pub fn issuperset(&self, other: &ContentSet) -> bool {
        other.issubset(self)
    }

    pub fn isdisjoint(&self, other: &ContentSet) -> bool {
        self.entries
            .keys()
            .all(|location| !other.entries.contains_key(location))
    }

    /// Prefix every location with `prefix`
    pub fn insert_offset(&self, prefix: &str) -> Result<ContentSet> {
        self.change_offset("/", prefix)
    }

    /// Move every entry from under `old` to under `new`
    ///
    /// Fails with `OffsetMismatch` if a member is neither `old` itself nor
    /// below it.
    pub fn change_offset(&self, old: &str, new: &str) -> Result<ContentSet> {
        let old = path::normalize(old);
        let new = path::normalize(new);
        let mut result = ContentSet::new();

        for entry in self.entries.values() {
            let location = path::rebase(entry.location(), &old, &new).ok_or_else(|| {
                Error::OffsetMismatch {
                    path: entry.location().to_string(),
                    offset: old.clone(),
                }
            })?;
            let moved = if location == entry.location() {
                entry.clone()
            } else {
                entry.relocated(&location)?
            };
            result.entries.insert(location, moved);
        }

        Ok(result)
    }

    /// Collapse paths that `other` implements through directory symlinks
    ///
    /// `other` is an on-disk view. For each symlink in `other` at a location
    /// where this set has a directory (or has children but no entry), the
    /// children are moved under the symlink's resolved target and the
    /// directory entry itself is dropped. With `add_conflicting_target`, the
    /// entry `other` holds for the resolved target is added to the result.
    /// Rewritten children may expose further symlinked directories; those are
    /// handled in later rounds. Rounds are capped at one more than the number
    /// of symlinks in `other`, which bounds symlink cycles.
    pub fn map_directory_structure(
        &self,
        other: &ContentSet,
        add_conflicting_target: bool,
    ) -> Result<ContentSet> {
        self.map_directory_structure_under(other, add_conflicting_target, "/")
    }

    /// [`ContentSet::map_directory_structure`] with symlinks resolved as if
    /// `root` were `/`
    pub fn map_directory_structure_under(
        &self,
        other: &ContentSet,
        add_conflicting_target: bool,
        root: &str,
    ) -> Result<ContentSet> {
        let links: BTreeMap<&str, String> = other
            .iter_links(false)
            .filter_map(|link| {
                link.resolved_target_under(root)
                    .map(|target| (link.location(), target))
            })
            .collect();

        let mut result = self.thaw();

        for _ in 0..=links.len() {
            let conflicts: Vec<&str> = links
                .keys()
                .copied()
                .filter(|location| match result.entries.get(*location) {
                    Some(entry) => entry.is_dir(),
                    None => result.has_children(location),
                })
                .collect();

            if conflicts.is_empty() {
                break;
            }

            for location in conflicts {
                let target = &links[location];

                result.entries.remove(location);
                let children = result.child_nodes(location);
                result.difference_update(&children)?;
                let moved = children.change_offset(location, target)?;
                result.union_update(&moved)?;

                if add_conflicting_target {
                    if let Some(target_entry) = other.get(target.as_str()) {
                        result.add(target_entry.clone())?;
                    }
                }
            }
        }

        Ok(result)
    }

    /// Add directory entries for every missing ancestor, mode 0775 root:root
    pub fn add_missing_directories(&mut self) -> Result<()> {
        self.add_missing_directories_with(&DirTemplate::default())
    }

    /// Add directory entries for every missing ancestor (excluding `/`)
    pub fn add_missing_directories_with(&mut self, template: &DirTemplate) -> Result<()> {
        self.check_mutable()?;

        let mut missing: HashSet<String> = HashSet::new();
        for location in self.entries.keys() {
            let mut parent = path::dirname(location);
            while parent != "/"
                && !self.entries.contains_key(parent)
                && !missing.contains(parent)
            {
                missing.insert(parent.to_string());
                parent = path::dirname(parent);
            }
        }

        if missing.is_empty() {
            return Ok(());
        }

        let mtime = template.mtime.unwrap_or_else(now_secs);
        for location in missing {
            let dir = FsEntry::dir(location)
                .mode(template.mode)
                .owner(template.uid, template.gid)
                .mtime(mtime)
                .build()?;
            self.entries.insert(dir.location().to_string(), dir);
        }
        Ok(())
    }

    /// Group regular files by `(dev, inode)` so hardlinks can be handled once
    ///
    /// Files without inode information each form their own group.
    pub fn inode_map(&self) -> Vec<Vec<FsEntry>> {
        let mut grouped: HashMap<(u64, u64), Vec<FsEntry>> = HashMap::new();
        let mut order: Vec<(u64, u64)> = Vec::new();
        let mut groups = Vec::new();

        for entry in self.iter_files(false) {
            match entry.file_data().and_then(|data| data.inode()) {
                Some(key) => {
                    let group = grouped.entry(key).or_default();
                    if group.is_empty() {
                        order.push(key);
                    }
                    group.push(entry.clone());
                }
                None => groups.push(vec![entry.clone()]),
            }
        }

        for key in order {
            if let Some(group) = grouped.remove(&key) {
                groups.push(group);
            }
        }
        groups
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl PartialEq for ContentSet {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len() && self.issubset(other)
    }
}

impl Eq for ContentSet {}

impl FromIterator<FsEntry> for ContentSet {
    fn from_iter<I: IntoIterator<Item = FsEntry>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|entry| (entry.location().to_string(), entry))
            .collect();
        ContentSet {
            entries,
            frozen: false,
        }
    }
}

impl IntoIterator for ContentSet {
    type Item = FsEntry;
    type IntoIter = std::collections::btree_map::IntoValues<String, FsEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

impl<'a> IntoIterator for &'a ContentSet {
    type Item = &'a FsEntry;
    type IntoIter = std::collections::btree_map::Values<'a, String, FsEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::entry::{DataSource, DeviceKind};
    use proptest::prelude::*;

    fn dir(location: &str) -> FsEntry {
        FsEntry::dir(location).mode(0o755).build_partial().unwrap()
    }

    fn file(location: &str) -> FsEntry {
        FsEntry::file(location)
            .mode(0o644)
            .data(DataSource::bytes(Vec::new()))
            .build_partial()
            .unwrap()
    }

    fn link(location: &str, target: &str) -> FsEntry {
        FsEntry::symlink(location, target).build_partial().unwrap()
    }

    fn sorted_locations(cset: &ContentSet) -> Vec<String> {
        cset.locations().map(str::to_string).collect()
    }

    #[test]
    fn test_add_replaces_same_location() {
        let mut cset = ContentSet::new();
        cset.add(file("/a")).unwrap();
        cset.add(dir("/a")).unwrap();
        assert_eq!(cset.len(), 1);
        assert!(cset.get("/a").unwrap().is_dir());
    }

    #[test]
    fn test_frozen_rejects_mutation() {
        let mut cset = ContentSet::frozen(vec![file("/a")]);
        assert!(matches!(cset.add(file("/b")), Err(Error::ImmutableSet)));
        assert!(matches!(cset.remove("/a"), Err(Error::ImmutableSet)));
        assert!(matches!(
            cset.difference_update(&ContentSet::new()),
            Err(Error::ImmutableSet)
        ));
        assert!(matches!(cset.add_missing_directories(), Err(Error::ImmutableSet)));

        let mut thawed = cset.thaw();
        thawed.add(file("/b")).unwrap();
        assert_eq!(thawed.len(), 2);
    }

    #[test]
    fn test_remove_errors() {
        let mut cset: ContentSet = vec![file("/a")].into_iter().collect();
        assert!(matches!(cset.remove("/missing"), Err(Error::NotFound(_))));
        assert!(matches!(cset.remove("relative"), Err(Error::NotAnEntry(_))));
        let removed = cset.remove("/a/").unwrap();
        assert_eq!(removed.location(), "/a");
        assert!(cset.is_empty());
    }

    #[test]
    fn test_type_filtered_views() {
        let dev = FsEntry::device("/dev/null", DeviceKind::Char)
            .rdev(1, 3)
            .build_partial()
            .unwrap();
        let fifo = FsEntry::fifo("/run/pipe").build_partial().unwrap();
        let cset: ContentSet = vec![dir("/d"), file("/d/f"), link("/l", "d"), dev, fifo]
            .into_iter()
            .collect();

        assert_eq!(cset.iter_files(false).count(), 1);
        assert_eq!(cset.iter_dirs(false).count(), 1);
        assert_eq!(cset.iter_dirs(true).count(), 4);
        assert_eq!(cset.iter_links(false).count(), 1);
        assert_eq!(cset.iter_devices(false).count(), 1);
        assert_eq!(cset.iter_fifos(false).count(), 1);
    }

    #[test]
    fn test_child_nodes_is_separator_bounded() {
        let cset: ContentSet = vec![
            dir("/usr"),
            dir("/usr/lib"),
            file("/usr/lib/libc.so"),
            file("/usrlocal"),
        ]
        .into_iter()
        .collect();

        let children = cset.child_nodes("/usr");
        assert_eq!(sorted_locations(&children), vec!["/usr/lib", "/usr/lib/libc.so"]);
        assert_eq!(cset.child_nodes("/").len(), 4);
        assert!(cset.child_nodes("/usr/lib/libc.so").is_empty());
    }

    #[test]
    fn test_algebra_keys_on_location() {
        let a: ContentSet = vec![file("/x"), file("/y")].into_iter().collect();
        let b: ContentSet = vec![dir("/y"), file("/z")].into_iter().collect();

        let inter = a.intersection(&b);
        assert_eq!(sorted_locations(&inter), vec!["/y"]);
        assert!(inter.get("/y").unwrap().is_file());

        let union = a.union(&b);
        assert_eq!(sorted_locations(&union), vec!["/x", "/y", "/z"]);
        assert!(union.get("/y").unwrap().is_dir());

        assert_eq!(sorted_locations(&a.difference(&b)), vec!["/x"]);
        assert_eq!(sorted_locations(&a.symmetric_difference(&b)), vec!["/x", "/z"]);

        let mut c = a.clone();
        c.symmetric_difference_update(&b).unwrap();
        assert_eq!(c, a.symmetric_difference(&b));

        let mut d = a.clone();
        d.intersection_update(&b).unwrap();
        assert_eq!(d, inter);

        assert!(inter.issubset(&a));
        assert!(a.issuperset(&inter));
        assert!(a.difference(&b).isdisjoint(&b));
    }

    #[test]
    fn test_change_offset_requires_prefix() {
        let cset: ContentSet = vec![file("/off/a"), file("/elsewhere")].into_iter().collect();
        assert!(matches!(
            cset.change_offset("/off", "/"),
            Err(Error::OffsetMismatch { .. })
        ));
    }

    #[test]
    fn test_insert_offset_rewrites_locations() {
        let cset: ContentSet = vec![dir("/usr"), link("/usr/lib64", "lib")].into_iter().collect();
        let moved = cset.insert_offset("/tmp/root").unwrap();
        assert_eq!(
            sorted_locations(&moved),
            vec!["/tmp/root/usr", "/tmp/root/usr/lib64"]
        );
        // raw symlink targets are left alone
        assert_eq!(moved.get("/tmp/root/usr/lib64").unwrap().target(), Some("lib"));
    }

    #[test]
    fn test_add_missing_directories() {
        let mut cset: ContentSet = vec![file("/a/b/file")].into_iter().collect();
        cset.add_missing_directories().unwrap();

        assert_eq!(sorted_locations(&cset), vec!["/a", "/a/b", "/a/b/file"]);
        for location in ["/a", "/a/b"] {
            let entry = cset.get(location).unwrap();
            assert!(entry.is_dir());
            assert_eq!(entry.mode(), Some(0o775));
        }
    }

    #[test]
    fn test_add_missing_directories_keeps_existing() {
        let mut cset: ContentSet = vec![dir("/a"), file("/a/b/c")].into_iter().collect();
        cset.add_missing_directories_with(&DirTemplate {
            mode: 0o755,
            uid: 1,
            gid: 1,
            mtime: Some(7),
        })
        .unwrap();

        assert_eq!(cset.get("/a").unwrap().mode(), Some(0o755));
        assert_eq!(cset.get("/a").unwrap().uid(), None);
        assert_eq!(cset.get("/a/b").unwrap().mtime(), Some(7));
    }

    #[test]
    fn test_map_directory_structure() {
        let live: ContentSet = vec![dir("/dir"), link("/sym", "dir")].into_iter().collect();
        let planned: ContentSet = vec![file("/sym/a")].into_iter().collect();

        let mapped = planned.map_directory_structure(&live, false).unwrap();
        assert!(mapped.contains("/dir/a"));
        assert!(!mapped.contains("/sym/a"));
    }

    #[test]
    fn test_map_directory_structure_recurses() {
        let mut live: ContentSet = vec![dir("/dir"), link("/sym", "dir")].into_iter().collect();
        let mut planned: ContentSet = vec![file("/sym/a"), dir("/sym")].into_iter().collect();

        let mapped = planned.map_directory_structure(&live, true).unwrap();
        assert_eq!(sorted_locations(&mapped), vec!["/dir", "/dir/a"]);

        live.add(link("/dir/sym", "dir2")).unwrap();
        live.add(dir("/dir/dir2")).unwrap();
        planned.add(file("/dir/sym/b")).unwrap();
        planned.add(dir("/sym/sym")).unwrap();

        let mapped = planned.map_directory_structure(&live, true).unwrap();
        assert_eq!(
            sorted_locations(&mapped),
            vec!["/dir", "/dir/a", "/dir/dir2", "/dir/dir2/b"]
        );
    }

    #[test]
    fn test_map_directory_structure_under_root() {
        let live: ContentSet = vec![dir("/root/usr/lib"), link("/root/lib", "/usr/lib")]
            .into_iter()
            .collect();
        let planned: ContentSet = vec![dir("/root/lib"), file("/root/lib/libdemo.so")]
            .into_iter()
            .collect();

        let mapped = planned.map_directory_structure_under(&live, true, "/root").unwrap();
        assert_eq!(
            sorted_locations(&mapped),
            vec!["/root/usr/lib", "/root/usr/lib/libdemo.so"]
        );
    }

    #[test]
    fn test_map_directory_structure_ignores_file_at_link() {
        let live: ContentSet = vec![link("/sym", "dir")].into_iter().collect();
        let planned: ContentSet = vec![file("/sym")].into_iter().collect();
        let mapped = planned.map_directory_structure(&live, true).unwrap();
        assert_eq!(mapped, planned);
    }

    #[test]
    fn test_inode_map_groups_hardlinks() {
        let data = crate::filesystem::entry::FileData::new(None).with_inode(1, 42);
        let a = FsEntry::file("/a").file_data(data.clone()).build_partial().unwrap();
        let b = FsEntry::file("/b").file_data(data).build_partial().unwrap();
        let c = file("/c");
        let cset: ContentSet = vec![a, b, c].into_iter().collect();

        let groups = cset.inode_map();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().any(|g| g.len() == 2));
    }

    fn location_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-c]{1,2}", 1..4).prop_map(|parts| format!("/{}", parts.join("/")))
    }

    fn cset_strategy() -> impl Strategy<Value = ContentSet> {
        prop::collection::vec(location_strategy(), 0..12)
            .prop_map(|locations| locations.iter().map(|l| file(l)).collect())
    }

    proptest! {
        #[test]
        fn test_union_is_idempotent(a in cset_strategy(), b in cset_strategy()) {
            let once = a.union(&b);
            prop_assert_eq!(once.union(&b), once);
        }

        #[test]
        fn test_difference_with_self_is_empty(a in cset_strategy()) {
            prop_assert!(a.difference(&a).is_empty());
        }

        #[test]
        fn test_offset_round_trip(a in cset_strategy(), prefix in location_strategy()) {
            let shifted = a.insert_offset(&prefix).unwrap();
            let back = shifted.change_offset(&prefix, "/").unwrap();
            prop_assert_eq!(back, a);
        }

        #[test]
        fn test_symmetric_difference_is_union_minus_intersection(
            a in cset_strategy(),
            b in cset_strategy(),
        ) {
            let expected = a.union(&b).difference(&a.intersection(&b));
            prop_assert_eq!(a.symmetric_difference(&b), expected);
        }
    }
}
