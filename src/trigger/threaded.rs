// src/trigger/threaded.rs

//! Triggers that fan per-file work out to a worker pool
//!
//! A [`ThreadedTrigger`] splits its job in three: `identify_work` and `finish`
//! run on the control thread with access to the content sets, while
//! `process` runs on a bounded rayon pool and only sees one work item. All
//! workers are joined before `finish` touches any content set.

use crate::config::{StripMode, StripSettings};
use crate::error::{Error, Result};
use crate::filesystem::{DataSource, EntryChanges, FsEntry, path};
use crate::merge::csets::{self, CsetView};
use crate::merge::engine::{MergeMode, PRE_MERGE};
use crate::trigger::regen::find_binary;
use crate::trigger::{DEFAULT_PRIORITY, RequiredCsets, Trigger, TriggerContext};
use rayon::prelude::*;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Trigger whose per-item work is independent and may run in parallel
pub trait ThreadedTrigger: Send + Sync {
    type Work: Send + Sync;
    type Output: Send;

    fn label(&self) -> &str;

    fn hooks(&self, mode: MergeMode) -> Vec<&'static str>;

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::ALL
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::All
    }

    fn priority(&self) -> u8 {
        DEFAULT_PRIORITY
    }

    /// Collect work items; runs on the control thread
    fn identify_work(
        &mut self,
        ctx: &TriggerContext<'_>,
        csets: &mut CsetView<'_>,
    ) -> Result<Vec<Self::Work>>;

    /// Handle one work item; runs on a worker thread
    fn process(&self, ctx: &TriggerContext<'_>, work: &Self::Work) -> Result<Self::Output>;

    /// Fold the results back into the content sets; runs on the control thread
    fn finish(
        &mut self,
        ctx: &TriggerContext<'_>,
        csets: &mut CsetView<'_>,
        outputs: Vec<Self::Output>,
    ) -> Result<()>;
}

/// Adapter running a [`ThreadedTrigger`] as a regular [`Trigger`]
#[derive(Debug)]
pub struct Threaded<T>(T);

impl<T: ThreadedTrigger> Threaded<T> {
    pub fn new(inner: T) -> Self {
        Self(inner)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }
}

impl<T: ThreadedTrigger> Trigger for Threaded<T> {
    fn label(&self) -> &str {
        self.0.label()
    }

    fn hooks(&self, mode: MergeMode) -> Vec<&'static str> {
        self.0.hooks(mode)
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        self.0.applicable_modes()
    }

    fn required_csets(&self, mode: MergeMode) -> RequiredCsets {
        self.0.required_csets(mode)
    }

    fn priority(&self) -> u8 {
        self.0.priority()
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, csets: &mut CsetView<'_>) -> Result<()> {
        let work = self.0.identify_work(ctx, csets)?;
        if work.is_empty() {
            return self.0.finish(ctx, csets, Vec::new());
        }

        let workers = ctx.parallelism.max(1).min(work.len());
        debug!(
            "{}: {} work items on {} workers",
            self.0.label(),
            work.len(),
            workers
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::Io(io::Error::other(e)))?;

        let inner = &self.0;
        let results: Vec<Result<T::Output>> =
            pool.install(|| work.par_iter().map(|item| inner.process(ctx, item)).collect());

        let mut outputs = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(e) if e.is_trigger_fatal() => return Err(e),
                Err(e) => ctx.observer.warn(&format!("{}: {}", self.0.label(), e)),
            }
        }

        self.0.finish(ctx, csets, outputs)
    }
}

/// ELF object type, from `e_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfKind {
    Relocatable,
    Executable,
    Shared,
}

impl ElfKind {
    fn strip_args(&self) -> &'static [&'static str] {
        match self {
            ElfKind::Relocatable => &["-g"],
            ElfKind::Executable | ElfKind::Shared => &["--strip-unneeded", "-R", ".comment"],
        }
    }
}

/// Classify a file by its ELF header, `None` for anything else
pub fn elf_kind(entry: &FsEntry) -> Result<Option<ElfKind>> {
    let Some(data) = entry.data() else {
        return Ok(None);
    };

    let mut header = [0u8; 18];
    let mut reader = data.open()?;
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if &header[..4] != b"\x7fELF" {
        return Ok(None);
    }
    let e_type = match header[5] {
        1 => u16::from_le_bytes([header[16], header[17]]),
        2 => u16::from_be_bytes([header[16], header[17]]),
        _ => return Ok(None),
    };
    Ok(match e_type {
        1 => Some(ElfKind::Relocatable),
        2 => Some(ElfKind::Executable),
        3 => Some(ElfKind::Shared),
        _ => None,
    })
}

/// One hardlink group of an ELF file
#[derive(Debug)]
pub struct StripWork {
    entries: Vec<FsEntry>,
    /// Location relative to the offset
    relative: String,
    kind: ElfKind,
}

#[derive(Debug)]
pub struct StripOutput {
    entries: Vec<FsEntry>,
    debug: Option<FsEntry>,
}

/// Strips ELF binaries, optionally splitting debug info into separate files
#[derive(Debug)]
pub struct BinaryDebug {
    mode: StripMode,
    strip_binary: Option<PathBuf>,
    objcopy_binary: Option<PathBuf>,
    debug_storage: String,
}

impl BinaryDebug {
    pub fn from_settings(settings: &StripSettings) -> Self {
        Self {
            mode: settings.mode,
            strip_binary: settings.strip_binary.clone(),
            objcopy_binary: settings.objcopy_binary.clone(),
            debug_storage: path::normalize(&settings.debug_storage),
        }
    }

    fn split(&self) -> bool {
        self.mode == StripMode::Split
    }

    /// Resolve tool paths, warning and returning false if one is missing
    fn resolve_binaries(&mut self, ctx: &TriggerContext<'_>) -> bool {
        if self.strip_binary.is_none() {
            self.strip_binary = find_binary("strip");
        }
        if self.split() && self.objcopy_binary.is_none() {
            self.objcopy_binary = find_binary("objcopy");
        }

        if self.strip_binary.is_none() {
            ctx.observer.warn("strip binary not found, skipping binary_debug");
            return false;
        }
        if self.split() && self.objcopy_binary.is_none() {
            ctx.observer.warn("objcopy binary not found, skipping binary_debug");
            return false;
        }
        true
    }

    fn debug_location(&self, relative: &str) -> String {
        format!("{}.debug", path::join(&self.debug_storage, relative))
    }
}

fn run_tool(binary: &Path, args: &[&OsStr]) -> Result<()> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .map_err(|e| Error::CommandFailed {
            command: binary.display().to_string(),
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: binary.display().to_string(),
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

impl ThreadedTrigger for BinaryDebug {
    type Work = StripWork;
    type Output = StripOutput;

    fn label(&self) -> &str {
        "binary_debug"
    }

    fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
        vec![PRE_MERGE]
    }

    fn applicable_modes(&self) -> &[MergeMode] {
        &MergeMode::INSTALLING
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[csets::NEW_CSET])
    }

    fn identify_work(
        &mut self,
        ctx: &TriggerContext<'_>,
        csets: &mut CsetView<'_>,
    ) -> Result<Vec<StripWork>> {
        if self.mode == StripMode::None || !self.resolve_binaries(ctx) {
            return Ok(Vec::new());
        }

        let cset = csets.get(csets::NEW_CSET)?;
        let mut work = Vec::new();
        for group in cset.inode_map() {
            let Some(first) = group.first() else { continue };
            let Some(relative) = path::rebase(first.location(), ctx.offset, "/") else {
                continue;
            };
            if path::is_under(&relative, &self.debug_storage) {
                continue;
            }
            if let Some(kind) = elf_kind(first)? {
                work.push(StripWork {
                    entries: group,
                    relative,
                    kind,
                });
            }
        }
        Ok(work)
    }

    fn process(&self, ctx: &TriggerContext<'_>, work: &StripWork) -> Result<StripOutput> {
        let Some(first) = work.entries.first() else {
            return Ok(StripOutput {
                entries: Vec::new(),
                debug: None,
            });
        };
        let strip = self
            .strip_binary
            .as_deref()
            .ok_or_else(|| Error::InvalidEntry("no strip binary".to_string()))?;

        let writable = ctx.get_writable_fsobj(first, false)?;
        let Some(target) = writable.data().and_then(|d| d.local_path()).map(Path::to_path_buf)
        else {
            return Err(Error::InvalidEntry(format!(
                "{} has no local data",
                first.location()
            )));
        };

        let mut debug = None;
        if self.split() {
            let objcopy = self
                .objcopy_binary
                .as_deref()
                .ok_or_else(|| Error::InvalidEntry("no objcopy binary".to_string()))?;

            let debug_file = ctx
                .tempdir
                .join("debug")
                .join(format!("{}.debug", work.relative.trim_start_matches('/')));
            if let Some(parent) = debug_file.parent() {
                fs::create_dir_all(parent)?;
            }

            run_tool(
                objcopy,
                &[
                    OsStr::new("--only-keep-debug"),
                    target.as_os_str(),
                    debug_file.as_os_str(),
                ],
            )?;

            let mut builder = FsEntry::file(ctx.offset_path(&self.debug_location(&work.relative)))
                .mode(0o644)
                .data(DataSource::mutable_path(&debug_file));
            if let Some(uid) = first.uid() {
                builder = builder.uid(uid);
            }
            if let Some(gid) = first.gid() {
                builder = builder.gid(gid);
            }
            if let Some(mtime) = first.mtime() {
                builder = builder.mtime(mtime);
            }
            debug = Some((builder.build_partial()?, debug_file));
        }

        let mut args: Vec<&OsStr> = work.kind.strip_args().iter().map(OsStr::new).collect();
        args.push(target.as_os_str());
        run_tool(strip, &args)?;

        if let (Some(objcopy), Some((_, debug_file))) = (self.objcopy_binary.as_deref(), &debug) {
            let mut link = std::ffi::OsString::from("--add-gnu-debuglink=");
            link.push(debug_file.as_os_str());
            run_tool(objcopy, &[link.as_os_str(), target.as_os_str()])?;
        }

        info!(
            "{} {}",
            if self.split() { "splitdebug" } else { "strip" },
            work.relative
        );

        let changes = EntryChanges::new().data(DataSource::mutable_path(&target));
        let entries = work
            .entries
            .iter()
            .map(|entry| entry.with_attributes(&changes))
            .collect::<Result<Vec<_>>>()?;

        Ok(StripOutput {
            entries,
            debug: debug.map(|(entry, _)| entry),
        })
    }

    fn finish(
        &mut self,
        ctx: &TriggerContext<'_>,
        csets: &mut CsetView<'_>,
        outputs: Vec<StripOutput>,
    ) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        let cset = csets.get_mut(csets::NEW_CSET)?;

        for output in outputs {
            cset.update(output.entries)?;
            let Some(debug) = output.debug else { continue };

            let mut dir = path::dirname(debug.location()).to_string();
            while dir != ctx.offset && dir != "/" && !cset.contains(dir.as_str()) {
                cset.add(FsEntry::dir(dir.as_str()).mode(0o755).owner(0, 0).build_partial()?)?;
                dir = path::dirname(&dir).to_string();
            }
            cset.add(debug)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{ContentSet, LiveFsOps};
    use crate::merge::csets::{CsetRegistry, CsetSource};
    use crate::merge::observer::NullObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn elf_header(class_data: u8, e_type: [u8; 2]) -> Vec<u8> {
        let mut header = vec![0x7f, b'E', b'L', b'F', 2, class_data, 1];
        header.resize(16, 0);
        header.extend_from_slice(&e_type);
        header.resize(64, 0);
        header
    }

    fn bytes_file(location: &str, data: Vec<u8>) -> FsEntry {
        FsEntry::file(location)
            .mode(0o755)
            .owner(0, 0)
            .data(DataSource::bytes(data))
            .build_partial()
            .unwrap()
    }

    fn context<'a>(tempdir: &'a Path, offset: &'a str) -> TriggerContext<'a> {
        TriggerContext {
            mode: MergeMode::Install,
            phase: PRE_MERGE,
            offset,
            tempdir,
            observer: &NullObserver,
            fs_ops: &LiveFsOps,
            parallelism: 4,
        }
    }

    #[test]
    fn test_elf_detection() {
        let so = bytes_file("/lib/libx.so", elf_header(1, [3, 0]));
        let exe = bytes_file("/bin/x", elf_header(2, [0, 2]));
        let obj = bytes_file("/lib/x.o", elf_header(1, [1, 0]));
        let text = bytes_file("/etc/x.conf", b"#!/bin/sh\necho hello world\n".to_vec());
        let short = bytes_file("/short", b"\x7fELF".to_vec());

        assert_eq!(elf_kind(&so).unwrap(), Some(ElfKind::Shared));
        assert_eq!(elf_kind(&exe).unwrap(), Some(ElfKind::Executable));
        assert_eq!(elf_kind(&obj).unwrap(), Some(ElfKind::Relocatable));
        assert_eq!(elf_kind(&text).unwrap(), None);
        assert_eq!(elf_kind(&short).unwrap(), None);
    }

    struct Lengths {
        processed: AtomicUsize,
        finished: Vec<usize>,
    }

    impl ThreadedTrigger for Lengths {
        type Work = FsEntry;
        type Output = usize;

        fn label(&self) -> &str {
            "lengths"
        }

        fn hooks(&self, _mode: MergeMode) -> Vec<&'static str> {
            vec![PRE_MERGE]
        }

        fn identify_work(
            &mut self,
            _ctx: &TriggerContext<'_>,
            csets: &mut CsetView<'_>,
        ) -> Result<Vec<FsEntry>> {
            Ok(csets.get(csets::NEW_CSET)?.iter().cloned().collect())
        }

        fn process(&self, _ctx: &TriggerContext<'_>, work: &FsEntry) -> Result<usize> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            if work.location() == "/bad" {
                return Err(Error::InvalidEntry("bad".to_string()));
            }
            Ok(work.location().len())
        }

        fn finish(
            &mut self,
            _ctx: &TriggerContext<'_>,
            csets: &mut CsetView<'_>,
            mut outputs: Vec<usize>,
        ) -> Result<()> {
            outputs.sort();
            self.finished = outputs;
            csets.get_mut(csets::NEW_CSET)?.discard("/bad")?;
            Ok(())
        }
    }

    #[test]
    fn test_threaded_joins_before_finish() {
        let tmp = TempDir::new().unwrap();
        let cset: ContentSet = ["/a", "/bb", "/ccc", "/bad"]
            .iter()
            .map(|l| bytes_file(l, Vec::new()))
            .collect();
        let mut registry = CsetRegistry::new();
        registry.add_preserved_source(csets::NEW_CSET, CsetSource::constant(cset));

        let mut trigger = Threaded::new(Lengths {
            processed: AtomicUsize::new(0),
            finished: Vec::new(),
        });
        let ctx = context(tmp.path(), "/");
        let mut view = CsetView::new(&mut registry, None);
        trigger.trigger(&ctx, &mut view).unwrap();

        assert_eq!(trigger.inner().processed.load(Ordering::SeqCst), 4);
        assert_eq!(trigger.inner().finished, vec![2, 3, 4]);
        assert!(!registry.resolve(csets::NEW_CSET).unwrap().contains("/bad"));
    }

    #[test]
    fn test_binary_debug_work_selection() {
        let tmp = TempDir::new().unwrap();
        let cset: ContentSet = vec![
            bytes_file("/img/usr/bin/tool", elf_header(1, [2, 0])),
            bytes_file("/img/usr/share/doc/README", b"plain text file here".to_vec()),
            bytes_file("/img/usr/lib/debug/usr/bin/tool.debug", elf_header(1, [1, 0])),
        ]
        .into_iter()
        .collect();
        let mut registry = CsetRegistry::new();
        registry.add_preserved_source(csets::NEW_CSET, CsetSource::constant(cset));

        let mut debug = BinaryDebug::from_settings(&StripSettings {
            mode: StripMode::Strip,
            strip_binary: Some(PathBuf::from("/nonexistent/strip")),
            ..StripSettings::default()
        });
        let ctx = context(tmp.path(), "/img");
        let mut view = CsetView::new(&mut registry, None);
        let work = debug.identify_work(&ctx, &mut view).unwrap();

        assert_eq!(work.len(), 1);
        assert_eq!(work[0].relative, "/usr/bin/tool");
        assert_eq!(work[0].kind, ElfKind::Executable);
        assert_eq!(debug.debug_location(&work[0].relative), "/usr/lib/debug/usr/bin/tool.debug");
    }

    #[test]
    fn test_binary_debug_failure_is_reported_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let original = elf_header(1, [3, 0]);
        let cset: ContentSet = vec![bytes_file("/usr/lib/libdemo.so", original.clone())]
            .into_iter()
            .collect();
        let mut registry = CsetRegistry::new();
        registry.add_preserved_source(csets::NEW_CSET, CsetSource::constant(cset));

        let mut trigger = Threaded::new(BinaryDebug::from_settings(&StripSettings {
            mode: StripMode::Strip,
            strip_binary: Some(PathBuf::from("/nonexistent/strip")),
            ..StripSettings::default()
        }));
        let ctx = context(tmp.path(), "/");
        let mut view = CsetView::new(&mut registry, None);
        trigger.trigger(&ctx, &mut view).unwrap();

        let cset = registry.resolve(csets::NEW_CSET).unwrap();
        let entry = cset.get("/usr/lib/libdemo.so").unwrap();
        assert!(!entry.data().unwrap().is_mutable());
    }

    #[test]
    fn test_binary_debug_strip_replaces_data() {
        let Some(true_bin) = find_binary("true") else { return };
        let tmp = TempDir::new().unwrap();
        let cset: ContentSet = vec![bytes_file("/usr/bin/tool", elf_header(1, [2, 0]))]
            .into_iter()
            .collect();
        let mut registry = CsetRegistry::new();
        registry.add_preserved_source(csets::NEW_CSET, CsetSource::constant(cset));

        let mut trigger = Threaded::new(BinaryDebug::from_settings(&StripSettings {
            mode: StripMode::Split,
            strip_binary: Some(true_bin.clone()),
            objcopy_binary: Some(true_bin),
            ..StripSettings::default()
        }));
        let ctx = context(tmp.path(), "/");
        let mut view = CsetView::new(&mut registry, None);
        trigger.trigger(&ctx, &mut view).unwrap();

        let cset = registry.resolve(csets::NEW_CSET).unwrap();
        let tool = cset.get("/usr/bin/tool").unwrap();
        let data = tool.data().unwrap();
        assert!(data.is_mutable());
        assert!(data.local_path().unwrap().starts_with(tmp.path()));

        let debug = cset.get("/usr/lib/debug/usr/bin/tool.debug").unwrap();
        assert_eq!(debug.mode(), Some(0o644));
        assert!(cset.get("/usr/lib/debug/usr/bin").unwrap().is_dir());
        assert!(cset.contains("/usr/lib/debug"));
        assert!(cset.contains("/usr"));
    }
}
