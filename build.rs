// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

const DEFAULT_DB_PATH: &str = "/var/lib/fsmerge/fsmerge.db";

fn db_path_arg() -> Arg {
    Arg::new("db_path")
        .short('d')
        .long("db-path")
        .value_name("PATH")
        .default_value(DEFAULT_DB_PATH)
        .help("Registry database path")
}

fn root_arg() -> Arg {
    Arg::new("root")
        .short('r')
        .long("root")
        .value_name("DIR")
        .help("Target root directory (overrides the config offset)")
}

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("JSON engine configuration")
}

fn build_cli() -> Command {
    Command::new("fsmerge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Filesystem merge engine for package installation transactions")
        .subcommand_required(false)
        .subcommand(
            Command::new("init")
                .about("Initialize the package registry")
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("install")
                .about("Install a staged image (replaces an installed package of the same name)")
                .arg(Arg::new("image").required(true).help("Directory laid out as it should appear under the root"))
                .arg(Arg::new("name").short('n').long("name").required(true).help("Package name"))
                .arg(Arg::new("version").short('V').long("version").required(true).help("Package version"))
                .arg(root_arg())
                .arg(db_path_arg())
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove an installed package")
                .arg(Arg::new("package_name").required(true).help("Package name to remove"))
                .arg(root_arg())
                .arg(db_path_arg())
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("query")
                .about("Query installed packages")
                .arg(Arg::new("pattern").help("Package name pattern (optional)"))
                .arg(
                    Arg::new("files")
                        .short('f')
                        .long("files")
                        .action(ArgAction::SetTrue)
                        .help("List the recorded contents of each package"),
                )
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("owner")
                .about("Show which installed package owns a path")
                .arg(Arg::new("path").required(true))
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("scan")
                .about("Print the entries found under a directory")
                .arg(Arg::new("path").required(true))
                .arg(
                    Arg::new("offset")
                        .short('o')
                        .long("offset")
                        .help("Report locations relative to this directory"),
                ),
        )
        .subcommand(
            Command::new("history")
                .about("Show transaction history")
                .arg(
                    Arg::new("id")
                        .long("id")
                        .help("Show a single transaction"),
                )
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("fsmerge.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
