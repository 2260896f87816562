// src/packages/traits.rs

//! Common traits for packages handed to the merge engine

use crate::error::Result;
use crate::filesystem::ContentSet;

/// Something with a name, a version and a set of filesystem contents
///
/// Locations in `contents` are relative to the target root; the engine
/// projects them under its offset.
pub trait Package: Send + Sync {
    /// Get the package name
    fn name(&self) -> &str;

    /// Get the package version
    fn version(&self) -> &str;

    /// Human readable identity used in logs and history
    fn identity(&self) -> String {
        format!("{}-{}", self.name(), self.version())
    }

    /// The entries this package owns
    fn contents(&self) -> Result<ContentSet>;
}
