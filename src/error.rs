// src/error.rs

use std::path::Path;
use thiserror::Error;

/// Core error types for fsmerge
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// A mutating call was made on a frozen content set
    #[error("Content set is frozen and cannot be modified")]
    ImmutableSet,

    /// The value given where an entry location was expected is not one
    #[error("Not a filesystem entry location: {0}")]
    NotAnEntry(String),

    /// Removal target is not a member of the content set
    #[error("Entry not found in content set: {0}")]
    NotFound(String),

    /// Entry construction or attribute change violated an entry invariant
    #[error("Invalid filesystem entry: {0}")]
    InvalidEntry(String),

    /// Merge target is occupied by something that cannot be replaced
    #[error("Cannot overwrite {existing} at {path}")]
    CannotOverwrite { path: String, existing: String },

    /// Copying or creating a filesystem node failed
    #[error("Failed to copy {path}: {reason}")]
    FailedCopy { path: String, reason: String },

    /// A trigger vetoed the transaction
    #[error("Modification blocked by trigger {trigger}: {reason}")]
    BlockModification { trigger: String, reason: String },

    /// A trigger reported a describable failure
    #[error("Modification error in trigger {trigger}: {reason}")]
    ModificationError { trigger: String, reason: String },

    /// Content set name has no source in the engine
    #[error("Unknown content set: {0}")]
    UnknownCset(String),

    /// Trigger asked for a content set it did not declare
    #[error("Content set {0} was not declared as required by this trigger")]
    CsetNotRequired(String),

    /// Content set sources reference each other in a loop
    #[error("Content set {0} depends on itself")]
    CsetCycle(String),

    /// Hook name is not part of the engine's current mode
    #[error("Unknown hook: {0}")]
    UnknownHook(String),

    /// Path cannot be represented as a UTF-8 location
    #[error("Path is not valid UTF-8: {0}")]
    NonUtf8Path(String),

    /// Offset exists and is not a directory
    #[error("Offset must be a directory or not exist: {0}")]
    InvalidOffset(String),

    /// Entry is outside the offset being rewritten
    #[error("Entry {path} is not under offset {offset}")]
    OffsetMismatch { path: String, offset: String },

    /// External command could not run or exited unsuccessfully
    #[error("Command {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a `NonUtf8Path` error for a path
    pub fn non_utf8(path: &Path) -> Self {
        Error::NonUtf8Path(path.to_string_lossy().into_owned())
    }

    /// True for errors a trigger raises to deliberately stop a transaction
    pub fn is_trigger_fatal(&self) -> bool {
        matches!(
            self,
            Error::BlockModification { .. } | Error::ModificationError { .. }
        )
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

/// Result type alias using fsmerge's Error type
pub type Result<T> = std::result::Result<T, Error>;
