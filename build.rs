// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn rollback_timeout_arg() -> Arg {
    Arg::new("rollback_timeout")
        .short('r')
        .long("rollback-timeout")
        .value_name("MS")
        .help("Roll back unless notify-ready is called within this many milliseconds")
}

fn build_cli() -> Command {
    Command::new("updraft")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Updraft Contributors")
        .about("Over-the-air update client with verified installs and automatic rollback")
        .subcommand_required(false)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value("/etc/updraft/config.json")
                .global(true)
                .help("Config file path"),
        )
        .arg(
            Arg::new("data_dir")
                .long("data-dir")
                .value_name("PATH")
                .global(true)
                .help("Data directory (overrides the config file)"),
        )
        .arg(
            Arg::new("server_url")
                .long("server-url")
                .value_name("URL")
                .global(true)
                .help("Update service URL (overrides the config file)"),
        )
        .arg(
            Arg::new("deployment_key")
                .long("deployment-key")
                .value_name("KEY")
                .global(true)
                .help("Deployment key (overrides the config file)"),
        )
        .arg(
            Arg::new("app_version")
                .long("app-version")
                .value_name("VERSION")
                .global(true)
                .help("Native application version (overrides the config file)"),
        )
        .subcommand(Command::new("init").about("Initialize the Updraft database"))
        .subcommand(Command::new("status").about("Show the current and previous packages"))
        .subcommand(Command::new("check").about("Check the update service for a newer package"))
        .subcommand(
            Command::new("update")
                .about("Download, verify and install an available update")
                .arg(rollback_timeout_arg())
                .arg(
                    Arg::new("allow_failed")
                        .long("allow-failed")
                        .action(ArgAction::SetTrue)
                        .help("Install even if the update previously failed to apply"),
                )
                .arg(
                    Arg::new("restart")
                        .long("restart")
                        .action(ArgAction::SetTrue)
                        .help("Restart the application after installing"),
                ),
        )
        .subcommand(
            Command::new("notify-ready")
                .about("Confirm that the application started on the current package"),
        )
        .subcommand(
            Command::new("rollback")
                .about("Revert to the previous package and blacklist the current one"),
        )
        .subcommand(Command::new("history").about("Show update history"))
        .subcommand(
            Command::new("blacklist")
                .about("List packages that failed to apply")
                .arg(
                    Arg::new("clear")
                        .long("clear")
                        .action(ArgAction::SetTrue)
                        .help("Remove every entry"),
                ),
        )
        .subcommand(
            Command::new("daemon")
                .about("Check for and install updates periodically")
                .arg(rollback_timeout_arg()),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("updraft.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
