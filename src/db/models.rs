// src/db/models.rs

//! Data models for registry database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::{Error, Result};
use crate::filesystem::{ContentSet, DeviceKind, EntryType, FileData, FsEntry};
use crate::merge::MergeMode;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// Conversion error for a text column that failed to parse
fn invalid_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// A Trove is one installed package
#[derive(Debug, Clone)]
pub struct Trove {
    pub id: Option<i64>,
    pub name: String,
    pub version: String,
    pub installed_at: Option<String>,
    pub installed_by_changeset_id: Option<i64>,
}

impl Trove {
    /// Create a new Trove
    pub fn new(name: String, version: String) -> Self {
        Self {
            id: None,
            name,
            version,
            installed_at: None,
            installed_by_changeset_id: None,
        }
    }

    /// Insert this trove into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO troves (name, version, installed_by_changeset_id) VALUES (?1, ?2, ?3)",
            params![&self.name, &self.version, &self.installed_by_changeset_id],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a trove by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, installed_at, installed_by_changeset_id FROM troves WHERE id = ?1",
        )?;

        let trove = stmt.query_row([id], Self::from_row).optional()?;

        Ok(trove)
    }

    /// Find the trove installed under `name`
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, installed_at, installed_by_changeset_id FROM troves WHERE name = ?1",
        )?;

        let trove = stmt.query_row([name], Self::from_row).optional()?;

        Ok(trove)
    }

    /// Troves whose name contains `pattern`
    pub fn search(conn: &Connection, pattern: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, installed_at, installed_by_changeset_id FROM troves
             WHERE name LIKE ?1 ORDER BY name",
        )?;

        let troves = stmt
            .query_map([format!("%{}%", pattern)], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(troves)
    }

    /// List all troves
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, installed_at, installed_by_changeset_id FROM troves ORDER BY name",
        )?;

        let troves = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(troves)
    }

    /// Record a new version installed over this trove
    pub fn update_version(
        &mut self,
        conn: &Connection,
        version: String,
        changeset_id: Option<i64>,
    ) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update trove without ID".to_string()))?;

        conn.execute(
            "UPDATE troves SET version = ?1, installed_by_changeset_id = ?2,
             installed_at = CURRENT_TIMESTAMP WHERE id = ?3",
            params![&version, &changeset_id, id],
        )?;

        self.version = version;
        self.installed_by_changeset_id = changeset_id;
        Ok(())
    }

    /// Delete a trove by ID
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM troves WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to a Trove
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            version: row.get(2)?,
            installed_at: row.get(3)?,
            installed_by_changeset_id: row.get(4)?,
        })
    }
}

/// One filesystem entry owned by a trove
#[derive(Debug, Clone)]
pub struct ContentRow {
    pub id: Option<i64>,
    pub trove_id: i64,
    pub path: String,
    pub entry_type: EntryType,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<i64>,
    pub target: Option<String>,
    pub device_kind: Option<DeviceKind>,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub sha256: Option<String>,
}

const CONTENT_COLUMNS: &str =
    "id, trove_id, path, type, mode, uid, gid, mtime, target, device_kind, major, minor, sha256";

impl ContentRow {
    /// Row describing `entry`, computing the file checksum if needed
    pub fn from_entry(trove_id: i64, entry: &FsEntry) -> Result<Self> {
        let sha256 = entry
            .file_data()
            .map(|data| data.sha256())
            .transpose()?
            .flatten();
        let (device_kind, major, minor) = match entry.device_numbers() {
            Some((kind, major, minor)) => (Some(kind), major, minor),
            None => (None, None, None),
        };

        Ok(Self {
            id: None,
            trove_id,
            path: entry.location().to_string(),
            entry_type: entry.entry_type(),
            mode: entry.mode(),
            uid: entry.uid(),
            gid: entry.gid(),
            mtime: entry.mtime(),
            target: entry.target().map(str::to_string),
            device_kind,
            major,
            minor,
            sha256,
        })
    }

    /// Rebuild the entry this row describes (without file data)
    pub fn to_entry(&self) -> Result<FsEntry> {
        let mut builder = match self.entry_type {
            EntryType::File => {
                let mut data = FileData::new(None);
                if let Some(sha256) = &self.sha256 {
                    data = data.with_sha256(sha256.clone());
                }
                FsEntry::file(self.path.as_str()).file_data(data)
            }
            EntryType::Dir => FsEntry::dir(self.path.as_str()),
            EntryType::Symlink => {
                let target = self.target.as_deref().ok_or_else(|| {
                    Error::InvalidEntry(format!("{}: symlink without target", self.path))
                })?;
                FsEntry::symlink(self.path.as_str(), target)
            }
            EntryType::Device => {
                let kind = self.device_kind.ok_or_else(|| {
                    Error::InvalidEntry(format!("{}: device without kind", self.path))
                })?;
                FsEntry::device(self.path.as_str(), kind)
            }
            EntryType::Fifo => FsEntry::fifo(self.path.as_str()),
        };

        if let Some(mode) = self.mode {
            builder = builder.mode(mode);
        }
        if let Some(uid) = self.uid {
            builder = builder.uid(uid);
        }
        if let Some(gid) = self.gid {
            builder = builder.gid(gid);
        }
        if let Some(mtime) = self.mtime {
            builder = builder.mtime(mtime);
        }
        if let (Some(major), Some(minor)) = (self.major, self.minor) {
            builder = builder.rdev(major, minor);
        }
        builder.build_partial()
    }

    /// Insert this row into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO contents (trove_id, path, type, mode, uid, gid, mtime, target,
                                   device_kind, major, minor, sha256)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                &self.trove_id,
                &self.path,
                self.entry_type.as_str(),
                &self.mode,
                &self.uid,
                &self.gid,
                &self.mtime,
                &self.target,
                self.device_kind.map(|k| k.as_str()),
                &self.major,
                &self.minor,
                &self.sha256,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find all rows belonging to a trove
    pub fn find_by_trove(conn: &Connection, trove_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contents WHERE trove_id = ?1 ORDER BY path",
            CONTENT_COLUMNS
        ))?;

        let rows = stmt
            .query_map([trove_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Every row recorded at `path`, across troves
    pub fn find_by_path(conn: &Connection, path: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contents WHERE path = ?1 ORDER BY trove_id",
            CONTENT_COLUMNS
        ))?;

        let rows = stmt
            .query_map([path], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    pub fn delete_by_trove(conn: &Connection, trove_id: i64) -> Result<()> {
        conn.execute("DELETE FROM contents WHERE trove_id = ?1", [trove_id])?;
        Ok(())
    }

    /// Replace the recorded contents of a trove, returning the row count
    pub fn replace_for_trove(conn: &Connection, trove_id: i64, cset: &ContentSet) -> Result<usize> {
        Self::delete_by_trove(conn, trove_id)?;
        for entry in cset.iter() {
            Self::from_entry(trove_id, entry)?.insert(conn)?;
        }
        Ok(cset.len())
    }

    /// The recorded contents of a trove as a content set
    pub fn load_contents(conn: &Connection, trove_id: i64) -> Result<ContentSet> {
        Self::find_by_trove(conn, trove_id)?
            .iter()
            .map(Self::to_entry)
            .collect::<Result<Vec<_>>>()
            .map(ContentSet::frozen)
    }

    /// Convert a database row to a ContentRow
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let type_str: String = row.get(3)?;
        let entry_type = type_str
            .parse::<EntryType>()
            .map_err(|e| invalid_column(3, e))?;
        let device_kind = row
            .get::<_, Option<String>>(9)?
            .map(|kind| kind.parse::<DeviceKind>().map_err(|e| invalid_column(9, e)))
            .transpose()?;

        Ok(Self {
            id: Some(row.get(0)?),
            trove_id: row.get(1)?,
            path: row.get(2)?,
            entry_type,
            mode: row.get(4)?,
            uid: row.get(5)?,
            gid: row.get(6)?,
            mtime: row.get(7)?,
            target: row.get(8)?,
            device_kind,
            major: row.get(10)?,
            minor: row.get(11)?,
            sha256: row.get(12)?,
        })
    }
}

/// Changeset status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangesetStatus {
    Pending,
    Applied,
    Failed,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Applied => "applied",
            ChangesetStatus::Failed => "failed",
        }
    }
}

impl FromStr for ChangesetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "applied" => Ok(ChangesetStatus::Applied),
            "failed" => Ok(ChangesetStatus::Failed),
            _ => Err(format!("Invalid changeset status: {}", s)),
        }
    }
}

/// A Changeset records one merge transaction
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: Option<i64>,
    pub description: String,
    pub operation: MergeMode,
    pub status: ChangesetStatus,
    pub created_at: Option<String>,
    pub finished_at: Option<String>,
}

impl Changeset {
    /// Create a new Changeset
    pub fn new(description: String, operation: MergeMode) -> Self {
        Self {
            id: None,
            description,
            operation,
            status: ChangesetStatus::Pending,
            created_at: None,
            finished_at: None,
        }
    }

    /// Insert this changeset into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO changesets (description, operation, status) VALUES (?1, ?2, ?3)",
            params![&self.description, self.operation.as_str(), self.status.as_str()],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a changeset by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, operation, status, created_at, finished_at
             FROM changesets WHERE id = ?1",
        )?;

        let changeset = stmt.query_row([id], Self::from_row).optional()?;

        Ok(changeset)
    }

    /// List all changesets, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, operation, status, created_at, finished_at
             FROM changesets ORDER BY id DESC",
        )?;

        let changesets = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    /// Update changeset status
    pub fn update_status(&mut self, conn: &Connection, new_status: ChangesetStatus) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update changeset without ID".to_string()))?;

        if new_status == ChangesetStatus::Pending {
            conn.execute(
                "UPDATE changesets SET status = ?1 WHERE id = ?2",
                params![new_status.as_str(), id],
            )?;
        } else {
            conn.execute(
                "UPDATE changesets SET status = ?1, finished_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![new_status.as_str(), id],
            )?;
        }

        self.status = new_status;
        Ok(())
    }

    /// Convert a database row to a Changeset
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let operation_str: String = row.get(2)?;
        let operation = operation_str
            .parse::<MergeMode>()
            .map_err(|e| invalid_column(2, e))?;
        let status_str: String = row.get(3)?;
        let status = status_str
            .parse::<ChangesetStatus>()
            .map_err(|e| invalid_column(3, e))?;

        Ok(Self {
            id: Some(row.get(0)?),
            description: row.get(1)?,
            operation,
            status,
            created_at: row.get(4)?,
            finished_at: row.get(5)?,
        })
    }
}
