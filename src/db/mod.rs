// src/db/mod.rs

//! Registry of installed packages
//!
//! This module handles all SQLite operations including:
//! - Database initialization and schema migration
//! - Connection management
//! - Transaction handling
//! - Recording the contents of installed packages and transaction history

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use rusqlite::{Connection, Transaction};
use std::path::Path;
use tracing::{debug, info, warn};

/// Per-connection settings; journal mode is persistent and set once by `init`
const CONNECTION_PRAGMAS: &str = "
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

/// Create (or upgrade) the registry at `db_path` and return a connection
///
/// Safe to call on an existing registry.
pub fn init(db_path: &str) -> Result<Connection> {
    debug!("Initializing registry at: {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create registry directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
    conn.execute_batch(CONNECTION_PRAGMAS)?;
    schema::migrate(&conn)?;

    info!("Registry ready at {}", db_path);
    Ok(conn)
}

/// Open an initialized registry
///
/// Files that were never initialized are rejected rather than silently turned
/// into registries; an older schema is migrated in place.
pub fn open(db_path: &str) -> Result<Connection> {
    if !Path::new(db_path).exists() {
        return Err(Error::DatabaseNotFound(db_path.to_string()));
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch(CONNECTION_PRAGMAS)?;

    match registry_version(&conn)? {
        0 => Err(Error::InitError(format!(
            "{} is not an fsmerge registry (run `fsmerge init`)",
            db_path
        ))),
        version if version > schema::SCHEMA_VERSION => Err(Error::InitError(format!(
            "{} has schema version {}, newer than supported {}",
            db_path,
            version,
            schema::SCHEMA_VERSION
        ))),
        version if version < schema::SCHEMA_VERSION => {
            warn!("Registry {} is at schema version {}, upgrading", db_path, version);
            schema::migrate(&conn)?;
            Ok(conn)
        }
        _ => Ok(conn),
    }
}

/// Schema version without creating the tracking table
fn registry_version(conn: &Connection) -> Result<i32> {
    let tracked: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !tracked {
        return Ok(0);
    }
    schema::get_schema_version(conn)
}

/// Run `f` inside a transaction, committing only if it succeeds
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_init_creates_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();

        // Remove the temp file so init can create it
        drop(temp_file);

        let result = init(&db_path);
        assert!(result.is_ok());
        assert!(Path::new(&db_path).exists());
    }

    #[test]
    fn test_open_existing_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        drop(init(db_path).unwrap());

        let conn = open(db_path).unwrap();
        assert_eq!(schema::get_schema_version(&conn).unwrap(), schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_open_rejects_uninitialized_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let result = open(db_path);
        assert!(matches!(result, Err(Error::InitError(_))));

        let conn = Connection::open(db_path).unwrap();
        let tables: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn test_open_upgrades_older_registry() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        {
            let conn = Connection::open(db_path).unwrap();
            schema::migrate_to(&conn, 1).unwrap();
        }

        let conn = open(db_path).unwrap();
        assert_eq!(schema::get_schema_version(&conn).unwrap(), schema::SCHEMA_VERSION);
        let changesets: i64 = conn
            .query_row("SELECT COUNT(*) FROM changesets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(changesets, 0);
    }

    #[test]
    fn test_open_rejects_newer_registry() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        {
            let conn = init(db_path).unwrap();
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION + 1],
            )
            .unwrap();
        }

        assert!(matches!(open(db_path), Err(Error::InitError(_))));
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open("/nonexistent/path/db.sqlite");
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        init(db_path).unwrap();
        let mut conn = open(db_path).unwrap();

        let result: Result<()> = transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO troves (name, version) VALUES ('demo', '1.0')",
                [],
            )?;
            Err(Error::NotFound("demo".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM troves", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
