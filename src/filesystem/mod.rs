// src/filesystem/mod.rs

//! Filesystem entry model, content sets and their application to disk

pub mod contents;
pub mod entry;
pub mod livefs;
pub mod ops;
pub mod path;

pub use contents::{AsLocation, ContentSet, DirTemplate};
pub use entry::{
    DataSource, DeviceKind, EntryBuilder, EntryChanges, EntryKind, EntryType, FileData, FsEntry,
};
pub use livefs::{
    LivefsScanner, fill_symlink_targets, fill_symlink_targets_under, gen_entry, intersect, scan,
};
pub use ops::{FsOps, LiveFsOps, copyfile, ensure_perms, merge_contents, mkdir, set_mtime, unmerge_contents};
