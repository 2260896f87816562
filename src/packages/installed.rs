// src/packages/installed.rs

//! Packages already present on the system

use crate::db::models::{ContentRow, Trove};
use crate::error::{Error, Result};
use crate::filesystem::ContentSet;
use crate::packages::Package;
use rusqlite::Connection;

/// Recorded contents of an installed package
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    name: String,
    version: String,
    contents: ContentSet,
}

impl InstalledPackage {
    pub fn new(name: impl Into<String>, version: impl Into<String>, contents: ContentSet) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            contents: contents.freeze(),
        }
    }

    /// Load the package installed under `name` from the registry
    pub fn load(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let Some(trove) = Trove::find_by_name(conn, name)? else {
            return Ok(None);
        };
        let id = trove
            .id
            .ok_or_else(|| Error::NotFound(format!("trove {} has no id", name)))?;
        let contents = ContentRow::load_contents(conn, id)?;
        Ok(Some(Self::new(trove.name, trove.version, contents)))
    }
}

impl Package for InstalledPackage {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn contents(&self) -> Result<ContentSet> {
        Ok(self.contents.clone())
    }
}
