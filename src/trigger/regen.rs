// src/trigger/regen.rs

//! Cache regeneration triggers
//!
//! Both triggers snapshot directory mtimes before the filesystem changes and
//! only do their (expensive) regeneration work when a watched directory moved
//! across the change.

use crate::error::{Error, Result};
use crate::filesystem::path;
use crate::merge::csets::CsetView;
use crate::merge::engine::{MergeMode, POST_MERGE, POST_UNMERGE, PRE_MERGE, PRE_UNMERGE};
use crate::trigger::{MtimeWatcher, RequiredCsets, Trigger, TriggerContext};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Trusted library directories, watched whatever ld.so.conf lists
pub const DEFAULT_LIB_DIRS: &[&str] = &[
    "/usr/lib",
    "/usr/lib64",
    "/usr/lib32",
    "/lib",
    "/lib64",
    "/lib32",
];

/// Snapshot and check hooks bracketing the filesystem change of `mode`
fn bracket(mode: MergeMode) -> (&'static str, &'static str) {
    match mode {
        MergeMode::Install => (PRE_MERGE, POST_MERGE),
        MergeMode::Uninstall => (PRE_UNMERGE, POST_UNMERGE),
        MergeMode::Replace => (PRE_MERGE, POST_UNMERGE),
    }
}

/// Search `PATH` for an executable named `name`
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            fs::metadata(candidate)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Rebuilds the dynamic linker cache
#[derive(Debug)]
pub struct LdConfig {
    binary: PathBuf,
    ld_so_conf: String,
    watcher: MtimeWatcher,
}

impl LdConfig {
    /// `ld_so_conf` is relative to the offset
    pub fn new(binary: PathBuf, ld_so_conf: &str) -> Self {
        Self {
            binary,
            ld_so_conf: ld_so_conf.to_string(),
            watcher: MtimeWatcher::new(),
        }
    }

    /// Library directories under the offset: ld.so.conf entries followed by
    /// the trusted directories
    ///
    /// A missing ld.so.conf is created empty; failing to create it blocks the
    /// transaction.
    fn read_ld_so_conf(&self, ctx: &TriggerContext<'_>) -> Result<Vec<PathBuf>> {
        let conf = PathBuf::from(ctx.offset_path(&self.ld_so_conf));

        let mut dirs: Vec<String> = match fs::read_to_string(&conf) {
            Ok(content) => content
                .lines()
                .map(|line| line.split('#').next().unwrap_or("").trim())
                .filter(|line| !line.is_empty() && !line.starts_with("include"))
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.create_ld_so_conf(&conf)
                    .map_err(|e| Error::BlockModification {
                        trigger: self.label().to_string(),
                        reason: format!("failed creating {}: {}", conf.display(), e),
                    })?;
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        for dir in DEFAULT_LIB_DIRS {
            if !dirs.iter().any(|d| path::normalize(d) == *dir) {
                dirs.push(dir.to_string());
            }
        }

        Ok(dirs
            .iter()
            .map(|dir| PathBuf::from(ctx.offset_path(dir)))
            .collect())
    }

    fn create_ld_so_conf(&self, conf: &Path) -> io::Result<()> {
        if let Some(parent) = conf.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(conf, b"")?;
        info!("Created {}", conf.display());
        Ok(())
    }

    fn regen(&self, offset: &str) -> Result<()> {
        info!("Regenerating linker cache under {}", offset);
        let output = Command::new(&self.binary)
            .arg("-r")
            .arg(offset)
            .output()
            .map_err(|e| Error::CommandFailed {
                command: self.binary.display().to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: self.binary.display().to_string(),
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl Trigger for LdConfig {
    fn label(&self) -> &str {
        "ldconfig"
    }

    fn hooks(&self, mode: MergeMode) -> Vec<&'static str> {
        let (snapshot, check) = bracket(mode);
        vec![snapshot, check]
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[])
    }

    fn priority(&self) -> u8 {
        10
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, _csets: &mut CsetView<'_>) -> Result<()> {
        let (snapshot, _) = bracket(ctx.mode);
        if ctx.phase == snapshot {
            let dirs = self.read_ld_so_conf(ctx)?;
            return self.watcher.set_state(&dirs);
        }

        // ld.so.conf may have been changed by the transaction itself
        let dirs = self.read_ld_so_conf(ctx)?;
        if self.watcher.check_state_at(&dirs)? {
            self.regen(ctx.offset)?;
        } else {
            debug!("Library directories unchanged, skipping ldconfig");
        }
        Ok(())
    }
}

/// Rebuilds info `dir` indexes
#[derive(Debug)]
pub struct InfoRegen {
    dirs: Vec<String>,
    watcher: MtimeWatcher,
}

impl InfoRegen {
    pub fn new(dirs: Vec<String>) -> Self {
        Self {
            dirs,
            watcher: MtimeWatcher::new(),
        }
    }

    fn watched(&self, ctx: &TriggerContext<'_>) -> Vec<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| PathBuf::from(ctx.offset_path(dir)))
            .collect()
    }

    /// Changed directories plus existing ones with no `dir` index
    fn stale_dirs(&self, ctx: &TriggerContext<'_>) -> Result<Vec<PathBuf>> {
        let mut stale: Vec<PathBuf> = self
            .watcher
            .get_changes_at(&self.watched(ctx))?
            .iter()
            .map(|entry| entry.path().to_path_buf())
            .collect();

        for dir in self.watched(ctx) {
            if dir.is_dir() && !dir.join("dir").exists() && !stale.contains(&dir) {
                stale.push(dir);
            }
        }
        Ok(stale)
    }

    /// Rebuild the index of one directory, returning files install-info rejected
    fn regen_dir(&self, binary: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
        let index = dir.join("dir");
        remove_if_exists(&index)?;
        remove_if_exists(&dir.join("dir.old"))?;

        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .map(|entry| entry.path())
            .collect();
        files.sort();

        let mut bad = Vec::new();
        for file in files {
            let output = Command::new(binary)
                .arg("--quiet")
                .arg(&file)
                .arg("--dir-file")
                .arg(&index)
                .output()
                .map_err(|e| Error::CommandFailed {
                    command: binary.display().to_string(),
                    reason: e.to_string(),
                })?;
            if !output.status.success() {
                bad.push(file);
            }
        }
        Ok(bad)
    }
}

impl Trigger for InfoRegen {
    fn label(&self) -> &str {
        "info_regen"
    }

    fn hooks(&self, mode: MergeMode) -> Vec<&'static str> {
        let (snapshot, check) = bracket(mode);
        vec![snapshot, check]
    }

    fn required_csets(&self, _mode: MergeMode) -> RequiredCsets {
        RequiredCsets::named(&[])
    }

    fn trigger(&mut self, ctx: &TriggerContext<'_>, _csets: &mut CsetView<'_>) -> Result<()> {
        let (snapshot, _) = bracket(ctx.mode);
        if ctx.phase == snapshot {
            let watched = self.watched(ctx);
            return self.watcher.set_state(&watched);
        }

        let Some(binary) = find_binary("install-info") else {
            debug!("install-info not found, skipping info regeneration");
            return Ok(());
        };

        for dir in self.stale_dirs(ctx)? {
            info!("Regenerating info index in {}", dir.display());
            let bad = self.regen_dir(&binary, &dir)?;
            if !bad.is_empty() {
                let names: Vec<String> = bad
                    .iter()
                    .map(|p| path::from_path(p).unwrap_or_else(|_| p.display().to_string()))
                    .collect();
                ctx.observer.warn(&format!(
                    "install-info rejected {} file(s) in {}: {}",
                    bad.len(),
                    dir.display(),
                    names.join(", ")
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::LiveFsOps;
    use crate::merge::csets::CsetRegistry;
    use crate::merge::observer::NullObserver;
    use tempfile::TempDir;

    fn run(trigger: &mut dyn Trigger, mode: MergeMode, phase: &str, offset: &str) -> Result<()> {
        let mut registry = CsetRegistry::new();
        let ctx = TriggerContext {
            mode,
            phase,
            offset,
            tempdir: Path::new("/nonexistent"),
            observer: &NullObserver,
            fs_ops: &LiveFsOps,
            parallelism: 1,
        };
        let mut view = CsetView::new(&mut registry, Some(Default::default()));
        trigger.trigger(&ctx, &mut view)
    }

    #[test]
    fn test_bracket_hooks() {
        let ld = LdConfig::new(PathBuf::from("/sbin/ldconfig"), "etc/ld.so.conf");
        assert_eq!(ld.hooks(MergeMode::Install), vec![PRE_MERGE, POST_MERGE]);
        assert_eq!(ld.hooks(MergeMode::Uninstall), vec![PRE_UNMERGE, POST_UNMERGE]);
        assert_eq!(ld.hooks(MergeMode::Replace), vec![PRE_MERGE, POST_UNMERGE]);
        assert_eq!(ld.priority(), 10);
    }

    #[test]
    fn test_missing_ld_so_conf_is_created() {
        let root = TempDir::new().unwrap();
        let offset = path::from_path(root.path()).unwrap();
        let mut ld = LdConfig::new(PathBuf::from("/nonexistent/ldconfig"), "etc/ld.so.conf");

        run(&mut ld, MergeMode::Install, PRE_MERGE, &offset).unwrap();
        assert!(root.path().join("etc/ld.so.conf").is_file());
        assert_eq!(ld.watcher.locations().len(), DEFAULT_LIB_DIRS.len());
        assert_eq!(ld.watcher.locations()[0], root.path().join("usr/lib"));
    }

    #[test]
    fn test_ld_so_conf_parsing() {
        let root = TempDir::new().unwrap();
        let offset = path::from_path(root.path()).unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::create_dir_all(root.path().join("opt/lib")).unwrap();
        fs::write(
            root.path().join("etc/ld.so.conf"),
            "# comment\n/opt/lib  # trailing\n\ninclude ld.so.conf.d/*.conf\n/usr/local/lib\n",
        )
        .unwrap();

        let mut ld = LdConfig::new(PathBuf::from("/nonexistent/ldconfig"), "etc/ld.so.conf");
        run(&mut ld, MergeMode::Install, PRE_MERGE, &offset).unwrap();
        let locations = ld.watcher.locations();
        assert_eq!(
            &locations[..2],
            &[root.path().join("opt/lib"), root.path().join("usr/local/lib")]
        );
        assert_eq!(locations.len(), 2 + DEFAULT_LIB_DIRS.len());
        assert_eq!(locations[2], root.path().join("usr/lib"));
    }

    #[test]
    fn test_ldconfig_runs_only_on_change() {
        let root = TempDir::new().unwrap();
        let offset = path::from_path(root.path()).unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::create_dir_all(root.path().join("usr/lib")).unwrap();
        fs::write(root.path().join("etc/ld.so.conf"), "/usr/lib\n").unwrap();

        let mut ld = LdConfig::new(PathBuf::from("/nonexistent/ldconfig"), "etc/ld.so.conf");
        run(&mut ld, MergeMode::Install, PRE_MERGE, &offset).unwrap();
        run(&mut ld, MergeMode::Install, POST_MERGE, &offset).unwrap();

        run(&mut ld, MergeMode::Install, PRE_MERGE, &offset).unwrap();
        fs::write(root.path().join("usr/lib/libdemo.so"), b"").unwrap();
        let err = run(&mut ld, MergeMode::Install, POST_MERGE, &offset).unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_info_dirs_without_index_are_stale() {
        let root = TempDir::new().unwrap();
        let offset = path::from_path(root.path()).unwrap();
        let info = root.path().join("usr/share/info");
        fs::create_dir_all(&info).unwrap();

        let mut regen = InfoRegen::new(vec!["/usr/share/info".to_string()]);
        run(&mut regen, MergeMode::Uninstall, PRE_UNMERGE, &offset).unwrap();

        let ctx = TriggerContext {
            mode: MergeMode::Uninstall,
            phase: POST_UNMERGE,
            offset: &offset,
            tempdir: Path::new("/nonexistent"),
            observer: &NullObserver,
            fs_ops: &LiveFsOps,
            parallelism: 1,
        };
        assert_eq!(regen.stale_dirs(&ctx).unwrap(), vec![info.clone()]);

        fs::write(info.join("dir"), b"").unwrap();
        let watched = regen.watched(&ctx);
        regen.watcher.set_state(&watched).unwrap();
        assert!(regen.stale_dirs(&ctx).unwrap().is_empty());
    }
}
