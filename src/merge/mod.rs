// src/merge/mod.rs

//! Merge transactions
//!
//! A transaction is driven by a [`MergeEngine`] over a table of named,
//! lazily computed content sets. Progress is reported through an
//! [`Observer`].

pub mod csets;
pub mod engine;
pub mod observer;

pub use csets::{CsetRegistry, CsetSource, CsetView};
pub use engine::{MergeEngine, MergeMode};
pub use observer::{NullObserver, Observer, TracingObserver};
