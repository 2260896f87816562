// src/merge/observer.rs

//! Progress reporting for merge transactions
//!
//! Every method has a no-op default so an observer only implements what it
//! cares about. Observers are best-effort: they return nothing and cannot
//! stop a transaction.

use crate::filesystem::FsEntry;
use tracing::{debug, error, info, warn};

pub trait Observer: Send + Sync {
    fn phase_start(&self, _hook: &str) {}

    fn phase_end(&self, _hook: &str) {}

    fn trigger_start(&self, _hook: &str, _trigger: &str) {}

    fn trigger_end(&self, _hook: &str, _trigger: &str) {}

    fn installing_fs_obj(&self, _entry: &FsEntry) {}

    fn removing_fs_obj(&self, _entry: &FsEntry) {}

    fn info(&self, _msg: &str) {}

    fn warn(&self, _msg: &str) {}

    fn error(&self, _msg: &str) {}

    fn debug(&self, _msg: &str) {}
}

/// Observer that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// Observer that forwards to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn phase_start(&self, hook: &str) {
        debug!("Starting phase {}", hook);
    }

    fn phase_end(&self, hook: &str) {
        debug!("Finished phase {}", hook);
    }

    fn trigger_start(&self, hook: &str, trigger: &str) {
        debug!("Running trigger {} in {}", trigger, hook);
    }

    fn trigger_end(&self, hook: &str, trigger: &str) {
        debug!("Trigger {} finished in {}", trigger, hook);
    }

    fn installing_fs_obj(&self, entry: &FsEntry) {
        info!(">>> {}", entry);
    }

    fn removing_fs_obj(&self, entry: &FsEntry) {
        info!("<<< {}", entry);
    }

    fn info(&self, msg: &str) {
        info!("{}", msg);
    }

    fn warn(&self, msg: &str) {
        warn!("{}", msg);
    }

    fn error(&self, msg: &str) {
        error!("{}", msg);
    }

    fn debug(&self, msg: &str) {
        debug!("{}", msg);
    }
}
