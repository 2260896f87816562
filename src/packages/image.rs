// src/packages/image.rs

//! Staged image packages
//!
//! An image is a directory tree laid out exactly as it should appear under
//! the target root. Its contents are scanned with the image directory as the
//! offset, so `<image>/usr/bin/tool` becomes `/usr/bin/tool`.

use crate::error::{Error, Result};
use crate::filesystem::{ContentSet, LivefsScanner, path};
use crate::packages::Package;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ImagePackage {
    name: String,
    version: String,
    root: PathBuf,
}

impl ImagePackage {
    /// Describe the tree at `root`, which must be an existing directory
    pub fn new(name: impl Into<String>, version: impl Into<String>, root: &Path) -> Result<Self> {
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(Error::InvalidOffset(root.display().to_string()));
        }
        Ok(Self {
            name: name.into(),
            version: version.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Package for ImagePackage {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn contents(&self) -> Result<ContentSet> {
        let offset = path::from_path(&self.root)?;
        let cset = LivefsScanner::new().offset(offset).scan(&self.root)?;
        debug!("Image {} has {} entries", self.identity(), cset.len());
        Ok(cset.freeze())
    }
}
