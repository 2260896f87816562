// src/main.rs

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use fsmerge::config::EngineConfig;
use fsmerge::db::models::{Changeset, ChangesetStatus, ContentRow, Trove};
use fsmerge::merge::csets::RESOLVED_INSTALL;
use fsmerge::merge::{MergeEngine, MergeMode};
use fsmerge::packages::{ImagePackage, InstalledPackage, Package};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const DEFAULT_DB_PATH: &str = "/var/lib/fsmerge/fsmerge.db";

#[derive(Parser)]
#[command(name = "fsmerge")]
#[command(author, version, about = "Filesystem merge engine for package installation transactions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the package registry
    Init {
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Install a staged image (replaces an installed package of the same name)
    Install {
        /// Directory laid out as it should appear under the root
        image: String,
        /// Package name
        #[arg(short, long)]
        name: String,
        /// Package version
        #[arg(short = 'V', long)]
        version: String,
        /// Target root directory (overrides the config offset)
        #[arg(short, long)]
        root: Option<String>,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// JSON engine configuration
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Remove an installed package
    Remove {
        /// Package name to remove
        package_name: String,
        /// Target root directory (overrides the config offset)
        #[arg(short, long)]
        root: Option<String>,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        /// JSON engine configuration
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Query installed packages
    Query {
        /// Package name pattern (optional, shows all if omitted)
        pattern: Option<String>,
        /// List the recorded contents of each package
        #[arg(short, long)]
        files: bool,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Show which installed package owns a path
    Owner {
        /// Absolute path as recorded at install time
        path: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Print the entries found under a directory
    Scan {
        path: String,
        /// Report locations relative to this directory
        #[arg(short, long)]
        offset: Option<String>,
    },
    /// Show transaction history
    History {
        /// Show a single transaction
        #[arg(long)]
        id: Option<i64>,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Generate shell completion scripts
    Completions {
        shell: Shell,
    },
}

fn load_config(config: Option<&str>, root: Option<String>) -> Result<EngineConfig> {
    let mut engine_config = match config {
        Some(path) => EngineConfig::load(Path::new(path))?,
        None => EngineConfig::default(),
    };
    if let Some(root) = root {
        engine_config.offset = root;
    }
    Ok(engine_config)
}

/// Run `engine`, recording the outcome on `changeset`
fn run_engine(conn: &Connection, engine: &mut MergeEngine, changeset: &mut Changeset) -> Result<()> {
    changeset.insert(conn)?;
    if let Err(e) = engine.run() {
        changeset.update_status(conn, ChangesetStatus::Failed)?;
        return Err(anyhow::anyhow!(
            "{} failed during {}: {}",
            changeset.description,
            engine.phase().unwrap_or("setup"),
            e
        ));
    }
    Ok(())
}

fn install(
    image: &str,
    name: String,
    version: String,
    config: &EngineConfig,
    db_path: &str,
) -> Result<()> {
    let mut conn = fsmerge::db::open(db_path)?;
    let pkg = Arc::new(ImagePackage::new(name, version, Path::new(image))?);

    let existing = InstalledPackage::load(&conn, pkg.name())?;
    let (mut engine, mut changeset) = match existing {
        Some(old) => {
            info!("Replacing {} with {}", old.identity(), pkg.identity());
            let description = format!("Replace {} with {}", old.identity(), pkg.identity());
            (
                MergeEngine::replace(Arc::new(old), pkg.clone(), config)?,
                Changeset::new(description, MergeMode::Replace),
            )
        }
        None => (
            MergeEngine::install(pkg.clone(), config)?,
            Changeset::new(format!("Install {}", pkg.identity()), MergeMode::Install),
        ),
    };

    run_engine(&conn, &mut engine, &mut changeset)?;

    let offset = engine.offset().to_string();
    let installed = engine.get_cset(RESOLVED_INSTALL)?.change_offset(&offset, "/")?;

    let count = fsmerge::db::transaction(&mut conn, |tx| {
        let changeset_id = changeset.id;
        let trove_id = match Trove::find_by_name(tx, pkg.name())? {
            Some(mut trove) => {
                trove.update_version(tx, pkg.version().to_string(), changeset_id)?;
                trove.id
            }
            None => {
                let mut trove = Trove::new(pkg.name().to_string(), pkg.version().to_string());
                trove.installed_by_changeset_id = changeset_id;
                Some(trove.insert(tx)?)
            }
        };
        let trove_id = trove_id
            .ok_or_else(|| fsmerge::Error::NotFound(format!("trove {}", pkg.name())))?;
        let count = ContentRow::replace_for_trove(tx, trove_id, &installed)?;
        changeset.update_status(tx, ChangesetStatus::Applied)?;
        Ok(count)
    })?;

    println!("Installed package: {} version {}", pkg.name(), pkg.version());
    println!("  Root: {}", offset);
    println!("  Entries: {}", count);
    Ok(())
}

fn remove(package_name: &str, config: &EngineConfig, db_path: &str) -> Result<()> {
    let mut conn = fsmerge::db::open(db_path)?;

    let pkg = InstalledPackage::load(&conn, package_name)?
        .ok_or_else(|| anyhow::anyhow!("Package '{}' is not installed", package_name))?;
    let entries = pkg.contents()?.len();
    let pkg = Arc::new(pkg);

    let mut engine = MergeEngine::uninstall(pkg.clone(), config)?;
    let mut changeset = Changeset::new(format!("Remove {}", pkg.identity()), MergeMode::Uninstall);
    run_engine(&conn, &mut engine, &mut changeset)?;

    fsmerge::db::transaction(&mut conn, |tx| {
        if let Some(trove) = Trove::find_by_name(tx, pkg.name())? {
            if let Some(id) = trove.id {
                Trove::delete(tx, id)?;
            }
        }
        changeset.update_status(tx, ChangesetStatus::Applied)?;
        Ok(())
    })?;

    println!("Removed package: {} version {}", pkg.name(), pkg.version());
    println!("  Entries: {}", entries);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { db_path }) => {
            info!("Initializing registry at: {}", db_path);
            fsmerge::db::init(&db_path)?;
            println!("Database initialized successfully at: {}", db_path);
            Ok(())
        }
        Some(Commands::Install {
            image,
            name,
            version,
            root,
            db_path,
            config,
        }) => {
            info!("Installing {} {} from {}", name, version, image);
            let config = load_config(config.as_deref(), root)?;
            install(&image, name, version, &config, &db_path)
        }
        Some(Commands::Remove {
            package_name,
            root,
            db_path,
            config,
        }) => {
            info!("Removing package: {}", package_name);
            let config = load_config(config.as_deref(), root)?;
            remove(&package_name, &config, &db_path)
        }
        Some(Commands::Query {
            pattern,
            files,
            db_path,
        }) => {
            let conn = fsmerge::db::open(&db_path)?;

            let troves = match pattern {
                Some(pattern) => Trove::search(&conn, &pattern)?,
                None => Trove::list_all(&conn)?,
            };

            if troves.is_empty() {
                println!("No packages found.");
                return Ok(());
            }

            println!("Installed packages:");
            for trove in &troves {
                println!(
                    "  {} {} (installed {})",
                    trove.name,
                    trove.version,
                    trove.installed_at.as_deref().unwrap_or("unknown")
                );
                if files {
                    if let Some(id) = trove.id {
                        for entry in ContentRow::load_contents(&conn, id)?.iter() {
                            println!("    {}", entry);
                        }
                    }
                }
            }
            println!("\nTotal: {} package(s)", troves.len());
            Ok(())
        }
        Some(Commands::Scan { path, offset }) => {
            let cset = fsmerge::filesystem::scan(Path::new(&path), offset.as_deref())?;
            for entry in cset.iter() {
                println!("{}", entry);
            }
            println!("\nTotal: {} entries", cset.len());
            Ok(())
        }
        Some(Commands::Owner { path, db_path }) => {
            let conn = fsmerge::db::open(&db_path)?;
            let location = fsmerge::filesystem::path::location(&path)?;

            let rows = ContentRow::find_by_path(&conn, &location)?;
            if rows.is_empty() {
                println!("{} is not owned by any package.", location);
                return Ok(());
            }
            for row in &rows {
                match Trove::find_by_id(&conn, row.trove_id)? {
                    Some(trove) => println!(
                        "{} is owned by {} {} ({})",
                        location, trove.name, trove.version, row.entry_type
                    ),
                    None => println!("{} is recorded for a missing package", location),
                }
            }
            Ok(())
        }
        Some(Commands::History { id, db_path }) => {
            let conn = fsmerge::db::open(&db_path)?;

            let changesets = match id {
                Some(id) => Changeset::find_by_id(&conn, id)?.into_iter().collect(),
                None => Changeset::list_all(&conn)?,
            };

            if changesets.is_empty() {
                println!("No transaction history.");
                return Ok(());
            }

            println!("Transaction history:");
            for changeset in &changesets {
                let timestamp = changeset
                    .finished_at
                    .as_deref()
                    .or(changeset.created_at.as_deref())
                    .unwrap_or("pending");

                println!(
                    "  [{}] {} - {} ({}, {:?})",
                    changeset.id.unwrap_or_default(),
                    timestamp,
                    changeset.description,
                    changeset.operation,
                    changeset.status
                );
            }
            println!("\nTotal: {} transaction(s)", changesets.len());
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "fsmerge", &mut std::io::stdout());
            Ok(())
        }
        None => {
            println!("fsmerge v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'fsmerge --help' for usage information");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_install_arguments() {
        let cli = Cli::try_parse_from([
            "fsmerge", "install", "/tmp/image", "--name", "demo", "-V", "1.0", "--root", "/mnt",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Install {
                image,
                name,
                version,
                root,
                db_path,
                config,
            }) => {
                assert_eq!(image, "/tmp/image");
                assert_eq!(name, "demo");
                assert_eq!(version, "1.0");
                assert_eq!(root.as_deref(), Some("/mnt"));
                assert_eq!(db_path, DEFAULT_DB_PATH);
                assert!(config.is_none());
            }
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn test_owner_and_history_arguments() {
        let cli = Cli::try_parse_from(["fsmerge", "owner", "/usr/bin/tool"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Owner { ref path, .. }) if path == "/usr/bin/tool"
        ));

        let cli = Cli::try_parse_from(["fsmerge", "history", "--id", "7"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::History { id: Some(7), .. })));
    }

    #[test]
    fn test_root_overrides_config_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsmerge.json");
        EngineConfig::with_offset("/srv/a").save(&path).unwrap();

        let config = load_config(path.to_str(), None).unwrap();
        assert_eq!(config.offset, "/srv/a");
        let config = load_config(path.to_str(), Some("/srv/b".to_string())).unwrap();
        assert_eq!(config.offset, "/srv/b");
        assert_eq!(load_config(None, None).unwrap().offset, "/");
    }
}
