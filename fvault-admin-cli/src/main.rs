//! fvault administration CLI
//!
//! Inspect and maintain a version store from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Create a store with a config file
//! fvault-admin --config fvault.json init --store .fvault --live-root .
//!
//! # Record the current content of a file
//! fvault-admin create notes.md --author alice --reason "draft"
//!
//! # Capture every changed file under the live root
//! fvault-admin scan
//!
//! # Show history and read an old version
//! fvault-admin log notes.md
//! fvault-admin cat <version-id>
//!
//! # Roll back, prune, check
//! fvault-admin restore notes.md <version-id>
//! fvault-admin cleanup --retention 7days
//! fvault-admin verify
//!
//! # Run the retention scheduler until Ctrl-C
//! fvault-admin serve
//! ```

mod output;
mod scan;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use fvault_core::{
    RetentionScheduler, SchedulerConfig, VersionId, VersionManager, VersioningConfig,
    VersioningPolicy,
};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fvault-admin")]
#[command(author = "fvault Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Versioned file store administration tool")]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true, default_value = "fvault.json")]
    config: PathBuf,

    /// Store directory, overriding the config file
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a config file and create an empty store
    Init {
        /// Root that file keys are relative to
        #[arg(long)]
        live_root: Option<PathBuf>,
        /// full_copy, diff_based or hybrid
        #[arg(long)]
        policy: Option<VersioningPolicy>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Record a new version of a file
    Create {
        file_key: String,
        /// Read content from this path instead of the live file ("-" for stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        author: Option<String>,
        #[arg(short, long)]
        reason: Option<String>,
        /// Override the configured policy for this version
        #[arg(long)]
        policy: Option<VersioningPolicy>,
    },

    /// List the versions of a file
    Log {
        file_key: String,
    },

    /// Show the metadata of one version
    Info {
        version_id: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the content of one version
    Cat {
        version_id: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a version back to its live file
    Restore {
        file_key: String,
        version_id: String,
    },

    /// Capture every included live file that changed since its latest version
    Scan {
        /// Only report what would be captured
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove versions past the retention window
    Cleanup {
        /// Retention window, e.g. "30days" or "12h" (default: from config)
        #[arg(long)]
        retention: Option<String>,
    },

    /// Delete blobs that no version refers to
    Gc,

    /// Rebuild versions from storage and check their hashes
    Verify {
        /// Only this file (default: every file)
        file_key: Option<String>,
    },

    /// List versions quarantined after integrity failures
    Flags {
        /// Clear the flag on this version
        #[arg(long)]
        clear: Option<String>,
    },

    /// Run the retention scheduler until interrupted
    Serve {
        /// Sweep once right away
        #[arg(long)]
        now: bool,
        /// Skip garbage collection after each sweep
        #[arg(long)]
        no_gc: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    if let Commands::Init {
        live_root,
        policy,
        force,
    } = &cli.command
    {
        return cmd_init(&cli, live_root.clone(), *policy, *force).await;
    }

    let config = load_config(&cli)?;
    let manager = VersionManager::open(config.clone())
        .with_context(|| format!("Failed to open store at {:?}", config.base_dir))?;
    let manager = Arc::new(manager);

    let result = match cli.command {
        // handled before the store is opened
        Commands::Init { .. } => Ok(()),
        Commands::Create {
            file_key,
            input,
            author,
            reason,
            policy,
        } => cmd_create(&manager, &config, file_key, input, author, reason, policy).await,
        Commands::Log { file_key } => cmd_log(&manager, file_key).await,
        Commands::Info { version_id, json } => cmd_info(&manager, version_id, json),
        Commands::Cat { version_id, output } => cmd_cat(&manager, version_id, output).await,
        Commands::Restore {
            file_key,
            version_id,
        } => cmd_restore(&manager, file_key, version_id).await,
        Commands::Scan { dry_run } => cmd_scan(&manager, &config, dry_run).await,
        Commands::Cleanup { retention } => cmd_cleanup(&manager, retention).await,
        Commands::Gc => cmd_gc(&manager).await,
        Commands::Verify { file_key } => cmd_verify(&manager, file_key).await,
        Commands::Flags { clear } => cmd_flags(&manager, clear).await,
        Commands::Serve { now, no_gc } => cmd_serve(manager.clone(), &config, now, no_gc).await,
    };

    manager.shutdown().await?;
    result
}

/// Config file plus command line overrides
fn load_config(cli: &Cli) -> Result<VersioningConfig> {
    let mut config = VersioningConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {:?}", cli.config))?;
    if let Some(store) = &cli.store {
        config.base_dir = store.clone();
    }
    config.validate()?;
    Ok(config)
}

fn parse_version_id(s: &str) -> Result<VersionId> {
    VersionId::parse(s).ok_or_else(|| anyhow!("Not a version id: {}", s))
}

async fn cmd_init(
    cli: &Cli,
    live_root: Option<PathBuf>,
    policy: Option<VersioningPolicy>,
    force: bool,
) -> Result<()> {
    if cli.config.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", cli.config);
    }

    let mut config = VersioningConfig::default();
    if let Some(store) = &cli.store {
        config.base_dir = store.clone();
    }
    if let Some(root) = live_root {
        config.live_root = root;
    }
    if let Some(policy) = policy {
        config.default_policy = policy;
    }
    config.validate()?;
    config
        .save(&cli.config)
        .with_context(|| format!("Failed to write {:?}", cli.config))?;

    let manager = VersionManager::open(config.clone())?;
    manager.shutdown().await?;

    println!("Initialized version store");
    println!("  Config:    {}", cli.config.display());
    println!("  Store:     {}", config.base_dir.display());
    println!("  Live root: {}", config.live_root.display());
    println!("  Policy:    {:?}", config.default_policy);
    Ok(())
}

async fn cmd_create(
    manager: &VersionManager,
    config: &VersioningConfig,
    file_key: String,
    input: Option<PathBuf>,
    author: Option<String>,
    reason: Option<String>,
    policy: Option<VersioningPolicy>,
) -> Result<()> {
    let content = match input {
        Some(path) if path.as_os_str() == "-" => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
        Some(path) => std::fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?,
        None => {
            let path = config.live_root.join(&file_key);
            std::fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?
        }
    };

    if !config.should_version(&file_key) {
        println!("Note: {} is excluded by the include/exclude patterns", file_key);
    }

    let version_id = manager
        .create_version(
            &file_key,
            Bytes::from(content),
            author.as_deref(),
            reason.as_deref(),
            policy,
        )
        .await?;
    let record = manager.get_version_info(&version_id)?;
    println!(
        "Created {} ({}, {})",
        version_id,
        record.representation,
        output::format_size(record.size)
    );
    Ok(())
}

async fn cmd_log(manager: &VersionManager, file_key: String) -> Result<()> {
    let history = manager.list_versions(&file_key).await?;
    if history.is_empty() {
        println!("No versions of {}", file_key);
        return Ok(());
    }
    print!("{}", output::history_table(&history));
    Ok(())
}

fn cmd_info(manager: &VersionManager, version_id: String, json: bool) -> Result<()> {
    let record = manager.get_version_info(&parse_version_id(&version_id)?)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print!("{}", output::record_details(&record));
    }
    Ok(())
}

async fn cmd_cat(
    manager: &VersionManager,
    version_id: String,
    output: Option<PathBuf>,
) -> Result<()> {
    let content = manager
        .get_version_content(&parse_version_id(&version_id)?)
        .await?;
    match output {
        Some(path) => {
            std::fs::write(&path, &content).with_context(|| format!("Failed to write {:?}", path))?
        }
        None => std::io::stdout().write_all(&content)?,
    }
    Ok(())
}

async fn cmd_restore(manager: &VersionManager, file_key: String, version_id: String) -> Result<()> {
    let version_id = parse_version_id(&version_id)?;
    if !manager.restore_version(&file_key, &version_id).await? {
        bail!("Version {} does not belong to {}", version_id, file_key);
    }
    println!("Restored {} to version {}", file_key, version_id);
    Ok(())
}

async fn cmd_scan(manager: &VersionManager, config: &VersioningConfig, dry_run: bool) -> Result<()> {
    if !config.auto_create_versions {
        println!("auto_create_versions is disabled in the config; nothing to do");
        return Ok(());
    }

    let summary = scan::scan_live_tree(manager, config, dry_run).await?;
    let verb = if dry_run { "Would capture" } else { "Captured" };
    for file_key in &summary.captured {
        println!("  {} {}", verb, file_key);
    }
    println!("Scan of {} finished:", config.live_root.display());
    println!("  Examined:  {}", summary.examined);
    println!("  {}: {}", verb, summary.captured.len());
    println!("  Unchanged: {}", summary.unchanged);
    for (file_key, error) in &summary.failed {
        println!("  FAILED {}: {}", file_key, error);
    }
    if !summary.failed.is_empty() {
        bail!("Scan failed for {} files", summary.failed.len());
    }
    Ok(())
}

async fn cmd_cleanup(manager: &VersionManager, retention: Option<String>) -> Result<()> {
    let retention = retention
        .map(|r| humantime_serde::re::humantime::parse_duration(&r))
        .transpose()
        .context("Invalid retention")?;

    let report = manager.cleanup_report(retention).await?;
    println!("Cleanup finished:");
    println!("  Files scanned: {}", report.files_scanned);
    println!("  Removed:       {}", report.removed);
    println!("  Promoted:      {}", report.promoted);
    if report.skipped_flagged > 0 {
        println!("  Skipped:       {} (flagged as damaged)", report.skipped_flagged);
    }
    for (file_key, error) in &report.failed_files {
        println!("  FAILED {}: {}", file_key, error);
    }
    if !report.is_clean() {
        bail!("Cleanup failed for {} files", report.failed_files.len());
    }
    Ok(())
}

async fn cmd_gc(manager: &VersionManager) -> Result<()> {
    let removed = manager.collect_garbage().await?;
    println!("Removed {} unreferenced blobs", removed);
    Ok(())
}

async fn cmd_verify(manager: &VersionManager, file_key: Option<String>) -> Result<()> {
    let file_keys = match file_key {
        Some(key) => vec![key],
        None => manager.file_keys()?,
    };

    let mut checked = 0;
    let mut failed = 0;
    for file_key in file_keys {
        let report = manager.verify_file(&file_key).await?;
        checked += report.checked;
        failed += report.failures.len();
        for (version_id, error) in &report.failures {
            println!("  {} {}: {}", file_key, version_id, error);
        }
    }

    println!("Verified {} versions, {} failed", checked, failed);
    if failed > 0 {
        bail!("Verification failed");
    }
    Ok(())
}

async fn cmd_flags(manager: &VersionManager, clear: Option<String>) -> Result<()> {
    if let Some(version_id) = clear {
        let version_id = parse_version_id(&version_id)?;
        if manager.clear_flag(&version_id).await? {
            println!("Cleared flag on {}", version_id);
        } else {
            println!("{} was not flagged", version_id);
        }
        return Ok(());
    }

    let flags = manager.flagged_versions()?;
    if flags.is_empty() {
        println!("No flagged versions");
    }
    for (version_id, reason) in flags {
        println!("{}  {}", version_id, reason);
    }
    Ok(())
}

async fn cmd_serve(
    manager: Arc<VersionManager>,
    config: &VersioningConfig,
    now: bool,
    no_gc: bool,
) -> Result<()> {
    let mut scheduler_config = SchedulerConfig::from_versioning(config);
    scheduler_config.run_on_start = now;
    scheduler_config.collect_garbage = !no_gc;

    println!(
        "Retention scheduler running every {} (retention {}), Ctrl-C to stop",
        humantime_serde::re::humantime::format_duration(scheduler_config.interval),
        humantime_serde::re::humantime::format_duration(config.retention_duration)
    );
    let handle = RetentionScheduler::new(manager, scheduler_config).spawn();

    let mut status = handle.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = status.borrow_and_update().clone();
                println!("{}", output::status_line(&s));
            }
        }
    }

    handle.shutdown().await?;
    println!("Scheduler stopped");
    Ok(())
}
