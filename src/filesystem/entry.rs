// src/filesystem/entry.rs

//! Filesystem entry value model
//!
//! An [`FsEntry`] describes one filesystem node (file, directory, symlink,
//! device or fifo) at a normalized absolute location. Entries are immutable:
//! metadata changes go through [`FsEntry::with_attributes`], which returns a
//! new entry and carries every unchanged field forward.
//!
//! Equality, ordering and hashing consider only the location, so two entries
//! for the same path are duplicates regardless of their metadata.

use crate::error::{Error, Result};
use crate::filesystem::path;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

/// Discriminant of an entry's node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Device,
    Fifo,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::File => "file",
            EntryType::Dir => "dir",
            EntryType::Symlink => "symlink",
            EntryType::Device => "device",
            EntryType::Fifo => "fifo",
        }
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(EntryType::File),
            "dir" => Ok(EntryType::Dir),
            "symlink" => Ok(EntryType::Symlink),
            "device" => Ok(EntryType::Device),
            "fifo" => Ok(EntryType::Fifo),
            _ => Err(format!("Invalid entry type: {}", s)),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character or block special file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Char,
    Block,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Char => "char",
            DeviceKind::Block => "block",
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "char" => Ok(DeviceKind::Char),
            "block" => Ok(DeviceKind::Block),
            _ => Err(format!("Invalid device kind: {}", s)),
        }
    }
}

/// Where a regular file's content comes from
#[derive(Debug, Clone)]
pub enum DataSource {
    /// Content lives in a file on disk. `mutable` marks a private scratch
    /// copy that may be rewritten in place.
    Path { path: PathBuf, mutable: bool },
    /// Content held in memory
    Bytes(Arc<[u8]>),
}

impl DataSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        DataSource::Path {
            path: path.into(),
            mutable: false,
        }
    }

    pub fn mutable_path(path: impl Into<PathBuf>) -> Self {
        DataSource::Path {
            path: path.into(),
            mutable: true,
        }
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        DataSource::Bytes(Arc::from(data.into()))
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self, DataSource::Path { mutable: true, .. })
    }

    /// Backing file, if the content is on disk
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            DataSource::Path { path, .. } => Some(path),
            DataSource::Bytes(_) => None,
        }
    }

    /// Open a byte stream over the content
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self {
            DataSource::Path { path, .. } => Ok(Box::new(File::open(path)?)),
            DataSource::Bytes(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
        }
    }
}

/// Content reference of a regular file, with a lazily computed checksum
///
/// The checksum cache is shared between clones of the same data and is reset
/// whenever the data source changes.
#[derive(Debug, Clone, Default)]
pub struct FileData {
    source: Option<DataSource>,
    inode: Option<(u64, u64)>,
    sha256: Arc<OnceLock<String>>,
}

impl FileData {
    pub fn new(source: Option<DataSource>) -> Self {
        Self {
            source,
            inode: None,
            sha256: Arc::new(OnceLock::new()),
        }
    }

    /// Record the `(dev, inode)` pair the data was read from
    pub fn with_inode(mut self, dev: u64, ino: u64) -> Self {
        self.inode = Some((dev, ino));
        self
    }

    /// Seed the checksum with a value known ahead of time
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(digest.into());
        self.sha256 = Arc::new(cell);
        self
    }

    pub fn source(&self) -> Option<&DataSource> {
        self.source.as_ref()
    }

    pub fn inode(&self) -> Option<(u64, u64)> {
        self.inode
    }

    /// Checksum if it has already been computed or seeded
    pub fn known_sha256(&self) -> Option<&str> {
        self.sha256.get().map(String::as_str)
    }

    /// SHA-256 of the content, hashed on first request
    ///
    /// Returns `None` when the entry has no data source.
    pub fn sha256(&self) -> Result<Option<String>> {
        if let Some(digest) = self.sha256.get() {
            return Ok(Some(digest.clone()));
        }
        let Some(source) = &self.source else {
            return Ok(None);
        };

        let mut reader = source.open()?;
        let mut hasher = Sha256::new();
        io::copy(&mut reader, &mut hasher)?;
        let digest = format!("{:x}", hasher.finalize());

        let _ = self.sha256.set(digest.clone());
        Ok(Some(digest))
    }
}

/// Type-specific part of an entry
#[derive(Debug, Clone)]
pub enum EntryKind {
    File(FileData),
    Dir,
    Symlink {
        target: String,
    },
    Device {
        kind: DeviceKind,
        major: Option<u32>,
        minor: Option<u32>,
    },
    Fifo,
}

impl EntryKind {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryKind::File(_) => EntryType::File,
            EntryKind::Dir => EntryType::Dir,
            EntryKind::Symlink { .. } => EntryType::Symlink,
            EntryKind::Device { .. } => EntryType::Device,
            EntryKind::Fifo => EntryType::Fifo,
        }
    }
}

/// One filesystem node
#[derive(Debug, Clone)]
pub struct FsEntry {
    location: String,
    kind: EntryKind,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    mtime: Option<i64>,
    strict: bool,
}

impl FsEntry {
    pub fn file(location: impl Into<String>) -> EntryBuilder {
        EntryBuilder::new(location, EntryKind::File(FileData::default()))
    }

    pub fn dir(location: impl Into<String>) -> EntryBuilder {
        EntryBuilder::new(location, EntryKind::Dir)
    }

    pub fn symlink(location: impl Into<String>, target: impl Into<String>) -> EntryBuilder {
        EntryBuilder::new(
            location,
            EntryKind::Symlink {
                target: target.into(),
            },
        )
    }

    pub fn device(location: impl Into<String>, kind: DeviceKind) -> EntryBuilder {
        EntryBuilder::new(
            location,
            EntryKind::Device {
                kind,
                major: None,
                minor: None,
            },
        )
    }

    pub fn fifo(location: impl Into<String>) -> EntryBuilder {
        EntryBuilder::new(location, EntryKind::Fifo)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.location)
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub fn entry_type(&self) -> EntryType {
        self.kind.entry_type()
    }

    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    pub fn gid(&self) -> Option<u32> {
        self.gid
    }

    pub fn mtime(&self) -> Option<i64> {
        self.mtime
    }

    /// Whether the entry was built with every core attribute present
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File(_))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink { .. })
    }

    pub fn is_device(&self) -> bool {
        matches!(self.kind, EntryKind::Device { .. })
    }

    pub fn is_fifo(&self) -> bool {
        matches!(self.kind, EntryKind::Fifo)
    }

    pub fn file_data(&self) -> Option<&FileData> {
        match &self.kind {
            EntryKind::File(data) => Some(data),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&DataSource> {
        self.file_data().and_then(FileData::source)
    }

    /// Raw symlink target
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Symlink { target } => Some(target),
            _ => None,
        }
    }

    /// Symlink target resolved against the link's own directory
    pub fn resolved_target(&self) -> Option<String> {
        self.target().map(|target| {
            if target.starts_with('/') {
                path::normalize(target)
            } else {
                path::join(self.dirname(), target)
            }
        })
    }

    /// Symlink target resolved as if `root` were `/`
    ///
    /// Absolute targets are placed under `root` and `..` never climbs above
    /// it. Links outside `root` resolve as [`FsEntry::resolved_target`] does.
    pub fn resolved_target_under(&self, root: &str) -> Option<String> {
        if root == "/" {
            return self.resolved_target();
        }
        let target = self.target()?;
        let Some(dir) = path::rebase(self.dirname(), root, "/") else {
            return self.resolved_target();
        };
        let inner = if target.starts_with('/') {
            path::normalize(target)
        } else {
            path::join(&dir, target)
        };
        Some(path::join(root, &inner))
    }

    /// Device numbers as `(kind, major, minor)`
    pub fn device_numbers(&self) -> Option<(DeviceKind, Option<u32>, Option<u32>)> {
        match &self.kind {
            EntryKind::Device { kind, major, minor } => Some((*kind, *major, *minor)),
            _ => None,
        }
    }

    pub fn dirname(&self) -> &str {
        path::dirname(&self.location)
    }

    pub fn basename(&self) -> &str {
        path::basename(&self.location)
    }

    /// Return a copy with the given changes applied
    ///
    /// Unset fields in `changes` keep their current values. Fails with
    /// `InvalidEntry` if the result breaks an entry invariant, such as a
    /// relative location or a symlink target on a non-symlink.
    pub fn with_attributes(&self, changes: &EntryChanges) -> Result<FsEntry> {
        let mut entry = self.clone();

        if let Some(location) = &changes.location {
            if !location.starts_with('/') {
                return Err(Error::InvalidEntry(format!(
                    "location must be absolute: {}",
                    location
                )));
            }
            entry.location = path::normalize(location);
        }
        if let Some(mode) = changes.mode {
            entry.mode = Some(mode);
        }
        if let Some(uid) = changes.uid {
            entry.uid = Some(uid);
        }
        if let Some(gid) = changes.gid {
            entry.gid = Some(gid);
        }
        if let Some(mtime) = changes.mtime {
            entry.mtime = Some(mtime);
        }

        if let Some(new_target) = &changes.target {
            match &mut entry.kind {
                EntryKind::Symlink { target } => *target = new_target.clone(),
                other => {
                    return Err(Error::InvalidEntry(format!(
                        "{}: cannot set a symlink target on a {}",
                        entry.location,
                        other.entry_type()
                    )));
                }
            }
        }

        if let Some(source) = &changes.data {
            match &mut entry.kind {
                EntryKind::File(data) => *data = FileData::new(Some(source.clone())),
                other => {
                    return Err(Error::InvalidEntry(format!(
                        "{}: cannot attach file data to a {}",
                        entry.location,
                        other.entry_type()
                    )));
                }
            }
        }

        if let Some((new_major, new_minor)) = changes.rdev {
            match &mut entry.kind {
                EntryKind::Device { major, minor, .. } => {
                    *major = Some(new_major);
                    *minor = Some(new_minor);
                }
                other => {
                    return Err(Error::InvalidEntry(format!(
                        "{}: cannot set device numbers on a {}",
                        entry.location,
                        other.entry_type()
                    )));
                }
            }
        }

        entry.validate()?;
        Ok(entry)
    }

    /// Copy of this entry at another location
    pub fn relocated(&self, location: &str) -> Result<FsEntry> {
        self.with_attributes(&EntryChanges::new().location(location))
    }

    pub fn with_mode(&self, mode: u32) -> FsEntry {
        let mut entry = self.clone();
        entry.mode = Some(mode);
        entry
    }

    pub fn with_uid(&self, uid: u32) -> FsEntry {
        let mut entry = self.clone();
        entry.uid = Some(uid);
        entry
    }

    pub fn with_gid(&self, gid: u32) -> FsEntry {
        let mut entry = self.clone();
        entry.gid = Some(gid);
        entry
    }

    pub fn with_mtime(&self, mtime: i64) -> FsEntry {
        let mut entry = self.clone();
        entry.mtime = Some(mtime);
        entry
    }

    fn validate(&self) -> Result<()> {
        if !self.location.starts_with('/') {
            return Err(Error::InvalidEntry(format!(
                "location must be absolute: {}",
                self.location
            )));
        }

        if let EntryKind::Symlink { target } = &self.kind {
            if target.is_empty() {
                return Err(Error::InvalidEntry(format!(
                    "{}: symlink target is empty",
                    self.location
                )));
            }
        }

        if !self.strict {
            return Ok(());
        }

        let missing = [
            ("mode", self.mode.is_none()),
            ("uid", self.uid.is_none()),
            ("gid", self.gid.is_none()),
            ("mtime", self.mtime.is_none()),
        ];
        if let Some((field, _)) = missing.iter().find(|(_, absent)| *absent) {
            return Err(Error::InvalidEntry(format!(
                "{}: missing required attribute {}",
                self.location, field
            )));
        }

        if let EntryKind::Device { major, minor, .. } = &self.kind {
            if major.is_none() || minor.is_none() {
                return Err(Error::InvalidEntry(format!(
                    "{}: device requires major and minor numbers",
                    self.location
                )));
            }
        }

        Ok(())
    }
}

impl PartialEq for FsEntry {
    fn eq(&self, other: &Self) -> bool {
        self.location == other.location
    }
}

impl Eq for FsEntry {}

impl Hash for FsEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.location.hash(state);
    }
}

impl PartialOrd for FsEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FsEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.location.cmp(&other.location)
    }
}

impl fmt::Display for FsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EntryKind::Symlink { target } => {
                write!(f, "symlink {} -> {}", self.location, target)
            }
            kind => write!(f, "{} {}", kind.entry_type(), self.location),
        }
    }
}

/// Builder for a new entry
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    location: String,
    kind: EntryKind,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    mtime: Option<i64>,
    data: Option<DataSource>,
    rdev: Option<(u32, u32)>,
}

impl EntryBuilder {
    fn new(location: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            location: location.into(),
            kind,
            mode: None,
            uid: None,
            gid: None,
            mtime: None,
            data: None,
            rdev: None,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    pub fn owner(self, uid: u32, gid: u32) -> Self {
        self.uid(uid).gid(gid)
    }

    pub fn mtime(mut self, mtime: i64) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn data(mut self, source: DataSource) -> Self {
        self.data = Some(source);
        self
    }

    /// Replace the whole file data (source, inode and checksum)
    pub fn file_data(mut self, data: FileData) -> Self {
        if let EntryKind::File(current) = &mut self.kind {
            *current = data;
        }
        self
    }

    pub fn rdev(mut self, major: u32, minor: u32) -> Self {
        self.rdev = Some((major, minor));
        self
    }

    /// Build an entry that must carry mode, ownership and mtime
    pub fn build(self) -> Result<FsEntry> {
        self.finish(true)
    }

    /// Build an entry that may leave metadata unset
    pub fn build_partial(self) -> Result<FsEntry> {
        self.finish(false)
    }

    fn finish(self, strict: bool) -> Result<FsEntry> {
        let location = path::location(&self.location)
            .map_err(|_| Error::InvalidEntry(format!("location must be absolute: {}", self.location)))?;

        let mut kind = self.kind;
        if let Some(source) = self.data {
            match &mut kind {
                EntryKind::File(data) => *data = FileData::new(Some(source)),
                other => {
                    return Err(Error::InvalidEntry(format!(
                        "{}: cannot attach file data to a {}",
                        location,
                        other.entry_type()
                    )));
                }
            }
        }
        if let Some((new_major, new_minor)) = self.rdev {
            match &mut kind {
                EntryKind::Device { major, minor, .. } => {
                    *major = Some(new_major);
                    *minor = Some(new_minor);
                }
                other => {
                    return Err(Error::InvalidEntry(format!(
                        "{}: cannot set device numbers on a {}",
                        location,
                        other.entry_type()
                    )));
                }
            }
        }

        let entry = FsEntry {
            location,
            kind,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            mtime: self.mtime,
            strict,
        };
        entry.validate()?;
        Ok(entry)
    }
}

/// Attribute changes for [`FsEntry::with_attributes`]
#[derive(Debug, Clone, Default)]
pub struct EntryChanges {
    location: Option<String>,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    mtime: Option<i64>,
    target: Option<String>,
    data: Option<DataSource>,
    rdev: Option<(u32, u32)>,
}

impl EntryChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    pub fn mtime(mut self, mtime: i64) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn data(mut self, source: DataSource) -> Self {
        self.data = Some(source);
        self
    }

    pub fn rdev(mut self, major: u32, minor: u32) -> Self {
        self.rdev = Some((major, minor));
        self
    }
}
