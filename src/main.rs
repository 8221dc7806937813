// src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use updraft::config::ClientConfig;
use updraft::installer::ResumeOutcome;
use updraft::lifecycle::{InstallOptions, SyncOptions, SyncOutcome, UpdateLifecycle};
use updraft::packages::{LocalPackageRecord, UpdateCheckResult};
use updraft::store::PackageStore;

#[derive(Parser)]
#[command(name = "updraft")]
#[command(author, version, about = "Over-the-air update client with verified installs and automatic rollback", long_about = None)]
struct Cli {
    /// Config file path (default: /etc/updraft/config.json)
    #[arg(short, long, global = true, default_value = "/etc/updraft/config.json")]
    config: PathBuf,

    /// Data directory (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Update service URL (overrides the config file)
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Deployment key (overrides the config file)
    #[arg(long, global = true)]
    deployment_key: Option<String>,

    /// Native application version (overrides the config file)
    #[arg(long, global = true)]
    app_version: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the Updraft database
    Init,
    /// Show the current and previous packages
    Status,
    /// Check the update service for a newer package
    Check,
    /// Download, verify and install an available update
    Update {
        /// Roll back unless notify-ready is called within this many milliseconds
        #[arg(short, long)]
        rollback_timeout: Option<u32>,
        /// Install even if the update previously failed to apply
        #[arg(long)]
        allow_failed: bool,
        /// Restart the application after installing
        #[arg(long)]
        restart: bool,
    },
    /// Confirm that the application started on the current package
    NotifyReady,
    /// Revert to the previous package and blacklist the current one
    Rollback,
    /// Show update history
    History,
    /// List packages that failed to apply
    Blacklist {
        /// Remove every entry
        #[arg(long)]
        clear: bool,
    },
    /// Check for and install updates periodically
    Daemon {
        /// Roll back unless notify-ready is called within this many milliseconds
        #[arg(short, long)]
        rollback_timeout: Option<u32>,
    },
}

impl Cli {
    fn load_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::load(&self.config)?;
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(server_url) = &self.server_url {
            config.server_url = server_url.clone();
        }
        if let Some(deployment_key) = &self.deployment_key {
            config.deployment_key = deployment_key.clone();
        }
        if let Some(app_version) = &self.app_version {
            config.app_version = app_version.clone();
        }
        Ok(config)
    }
}

fn print_record(title: &str, record: &LocalPackageRecord) {
    println!("{}: {}", title, record.metadata.label);
    println!("  Hash: {}", record.identity().package_hash);
    println!("  App version: {}", record.identity().app_version);
    println!("  Deployment key: {}", record.identity().deployment_key);
    println!("  Installed: {}", record.installed_at);
    if record.is_pending {
        match record.rollback_deadline() {
            Some(deadline) => println!("  Pending confirmation (deadline {})", deadline.to_rfc3339()),
            None => println!("  Pending confirmation"),
        }
    }
    if !record.metadata.description.is_empty() {
        println!("  Description: {}", record.metadata.description);
    }
}

fn print_install_options(options: &InstallOptions) {
    if let Some(timeout) = options.rollback_timeout_ms {
        println!(
            "Run 'updraft notify-ready' within {}ms or the update will be rolled back",
            timeout
        );
    }
}

async fn run_sync(lifecycle: &UpdateLifecycle, options: SyncOptions) -> updraft::Result<()> {
    match lifecycle.sync(options).await? {
        SyncOutcome::UpToDate => println!("The application is up to date."),
        SyncOutcome::UpdateIgnored(meta) => println!(
            "Update {} previously failed to apply; skipped (use --allow-failed to install)",
            meta.label
        ),
        SyncOutcome::Installed(record) => {
            println!("Installed {} ({})", record.metadata.label, record.identity().package_hash);
            print_install_options(&options.install);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let Some(command) = &cli.command else {
        // No command provided, show help
        println!("Updraft update client v{}", env!("CARGO_PKG_VERSION"));
        println!("Run 'updraft --help' for usage information");
        return Ok(());
    };

    let config = cli.load_config()?;

    match command {
        Commands::Init => {
            info!("Initializing Updraft data in {}", config.data_dir.display());
            PackageStore::open_in(&config.data_dir)?;
            println!("Database initialized successfully in: {}", config.data_dir.display());
            Ok(())
        }
        Commands::Status => {
            let store = PackageStore::open_in(&config.data_dir)?;
            match store.current()? {
                Some(current) => {
                    print_record("Current package", &current);
                    if let Some(previous) = &current.previous {
                        print_record("Previous package", previous);
                    }
                }
                None => println!("No update installed; running the binary package ({})", config.app_version),
            }
            Ok(())
        }
        Commands::Check => {
            config.validate()?;
            let lifecycle = UpdateLifecycle::from_config(config)?;
            match lifecycle.check_for_update().await? {
                UpdateCheckResult::UpToDate => println!("The application is up to date."),
                UpdateCheckResult::UpdateForOtherVersion { app_version } => {
                    println!("An update exists for app version {} only.", app_version)
                }
                UpdateCheckResult::UpdateAvailable(meta) => {
                    println!("Update available: {}", meta.label);
                    println!("  Hash: {}", meta.identity.package_hash);
                    println!("  Size: {} bytes", meta.package_size);
                    println!("  Mandatory: {}", meta.is_mandatory);
                    if !meta.description.is_empty() {
                        println!("  Description: {}", meta.description);
                    }
                    if meta.failed_apply {
                        println!("  Previously failed to apply");
                    }
                }
            }
            Ok(())
        }
        Commands::Update {
            rollback_timeout,
            allow_failed,
            restart,
        } => {
            config.validate()?;
            let rollback_timeout_ms = rollback_timeout.or(config.rollback_timeout_ms);
            let lifecycle = UpdateLifecycle::from_config(config)?;
            lifecycle.resume_pending().await?;

            let options = SyncOptions {
                install: InstallOptions {
                    rollback_timeout_ms,
                    allow_failed: *allow_failed,
                    restart: *restart,
                },
            };
            run_sync(&lifecycle, options).await?;
            Ok(())
        }
        Commands::NotifyReady => {
            let lifecycle = UpdateLifecycle::from_config(config)?;
            if let ResumeOutcome::RolledBack(_) = lifecycle.resume_pending().await? {
                return Err(anyhow::anyhow!(
                    "The rollback deadline had passed; the update was rolled back"
                ));
            }
            lifecycle.notify_application_ready().await?;
            println!("Current package confirmed.");
            Ok(())
        }
        Commands::Rollback => {
            let lifecycle = UpdateLifecycle::from_config(config)?;
            match lifecycle.rollback().await? {
                Some(restored) => println!("Rolled back to {}", restored.metadata.label),
                None => println!("Rolled back to the binary package"),
            }
            Ok(())
        }
        Commands::History => {
            let store = PackageStore::open_in(&config.data_dir)?;
            let events = store.history()?;

            if events.is_empty() {
                println!("No update history.");
            } else {
                println!("Update history:");
                for event in &events {
                    println!(
                        "  [{}] {} - {} {} ({})",
                        event.id.unwrap_or_default(),
                        event.created_at.as_deref().unwrap_or("unknown"),
                        event.action.as_str(),
                        event.label,
                        event.package_hash
                    );
                }
                println!("\nTotal: {} event(s)", events.len());
            }
            Ok(())
        }
        Commands::Blacklist { clear } => {
            let store = PackageStore::open_in(&config.data_dir)?;
            if *clear {
                let removed = store.clear_blacklist()?;
                println!("Removed {} blacklist entr{}", removed, if removed == 1 { "y" } else { "ies" });
                return Ok(());
            }

            let failed = store.failed_updates()?;
            if failed.is_empty() {
                println!("No failed updates.");
            } else {
                println!("Failed updates:");
                for identity in &failed {
                    println!("  {}", identity);
                }
            }
            Ok(())
        }
        Commands::Daemon { rollback_timeout } => {
            config.validate()?;
            let rollback_timeout_ms = rollback_timeout.or(config.rollback_timeout_ms);
            let interval = config.check_interval();
            let lifecycle = UpdateLifecycle::from_config(config)?;
            lifecycle.resume_pending().await?;

            info!("Checking for updates every {}s", interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            let options = SyncOptions {
                install: InstallOptions {
                    rollback_timeout_ms,
                    allow_failed: false,
                    restart: true,
                },
            };

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match run_sync(&lifecycle, options).await {
                            Ok(()) => {}
                            Err(updraft::Error::ConcurrentUpdate(phase)) => {
                                debug!("Skipping check while an update is {}", phase);
                            }
                            Err(e) if e.is_retryable() => {
                                warn!("Update check failed, retrying next interval: {}", e);
                            }
                            Err(e) => warn!("Update attempt failed: {}", e),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"deploymentKey": "file-key", "appVersion": "1.0.0"}"#).unwrap();

        let cli = Cli::parse_from([
            "updraft",
            "--config",
            path.to_str().unwrap(),
            "--deployment-key",
            "flag-key",
            "status",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.deployment_key, "flag-key");
        assert_eq!(config.app_version, "1.0.0");
    }

    #[test]
    fn test_update_arguments() {
        let cli = Cli::parse_from(["updraft", "update", "--rollback-timeout", "5000", "--allow-failed"]);
        match cli.command {
            Some(Commands::Update {
                rollback_timeout,
                allow_failed,
                restart,
            }) => {
                assert_eq!(rollback_timeout, Some(5000));
                assert!(allow_failed);
                assert!(!restart);
            }
            _ => panic!("expected update command"),
        }
    }
}
