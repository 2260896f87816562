// src/lib.rs

//! fsmerge - filesystem merge engine for package transactions
//!
//! Installs, removes and replaces package contents on a target root while
//! running pluggable triggers around each step.
//!
//! # Architecture
//!
//! - Entries: `FsEntry` values describe single filesystem nodes
//! - Content sets: location-keyed sets of entries with set algebra
//! - Merge engine: one transaction over named, lazily computed content sets
//! - Triggers: prioritized extension logic attached to hook points
//! - Registry: installed contents and transaction history in SQLite

pub mod config;
pub mod db;
mod error;
pub mod filesystem;
pub mod merge;
pub mod packages;
pub mod trigger;

pub use error::{Error, Result};
