// src/filesystem/path.rs

//! Location handling for filesystem entries
//!
//! Entry locations are normalized, `/`-separated UTF-8 strings. These helpers
//! do purely lexical work; nothing here touches the disk.

use crate::error::{Error, Result};
use std::path::Path;

/// Normalize a path lexically
///
/// Collapses repeated separators, drops `.` components and resolves `..`
/// against preceding components. A `..` above the root of an absolute path is
/// discarded. Trailing separators are removed (except for `/` itself).
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join `tail` onto `base`, treating `tail` as relative even if it is absolute
pub fn join(base: &str, tail: &str) -> String {
    let tail = tail.trim_start_matches('/');
    if tail.is_empty() {
        return normalize(base);
    }
    normalize(&format!("{}/{}", base, tail))
}

/// Parent of a normalized absolute location (`/` is its own parent)
pub fn dirname(location: &str) -> &str {
    match location.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &location[..idx],
    }
}

/// Final component of a location
pub fn basename(location: &str) -> &str {
    match location.rfind('/') {
        Some(idx) => &location[idx + 1..],
        None => location,
    }
}

/// True if `path` lies strictly below `parent`, on a separator boundary
pub fn is_under(path: &str, parent: &str) -> bool {
    if parent == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.len() > parent.len()
        && path.starts_with(parent)
        && path.as_bytes()[parent.len()] == b'/'
}

/// Rewrite `location` from under `old` to under `new`
///
/// Returns `None` when `location` is neither `old` nor below it.
pub fn rebase(location: &str, old: &str, new: &str) -> Option<String> {
    if location == old {
        return Some(normalize(new));
    }
    if !is_under(location, old) {
        return None;
    }
    let tail = if old == "/" {
        location
    } else {
        &location[old.len()..]
    };
    Some(join(new, tail))
}

/// Convert a filesystem path into a normalized location string
pub fn from_path(path: &Path) -> Result<String> {
    path.to_str()
        .map(normalize)
        .ok_or_else(|| Error::non_utf8(path))
}

/// Validate and normalize a caller-supplied location
///
/// Locations must be absolute; anything else is rejected as not naming an
/// entry.
pub fn location(raw: &str) -> Result<String> {
    if !raw.starts_with('/') {
        return Err(Error::NotAnEntry(raw.to_string()));
    }
    Ok(normalize(raw))
}
