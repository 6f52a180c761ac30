// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Level;

use tubeoffline::config::{self, load_config, save_config, OfflineConfig};
use tubeoffline::download::{
    AssetStore, CoordinatorEvent, DownloadCoordinator, DownloadStatus, HttpTransport,
};
use tubeoffline::error::format_error;
use tubeoffline::watch::{HttpWatchReporter, WatchReporter};
use tubeoffline::{asset_id_from_source, OfflineError, Video};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// I/O error - network or file operation failed
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - interrupted, try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// tubeoffline - Keep your video archive available offline.
#[derive(Parser)]
#[command(name = "tubeoffline")]
#[command(version = VERSION)]
#[command(about = "Offline downloads and watched tracking for a self-hosted video archive.")]
#[command(long_about = "tubeoffline - Offline asset coordinator\n\n\
    Point at your server:  tubeoffline config set-server https://archive.example.org\n\
    Download a video:      tubeoffline download <id> /media/<id>.mp4\n\
    See what is offline:   tubeoffline list\n\
    Continue transfers:    tubeoffline resume")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Quiet mode: warnings and errors only
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: detailed output for debugging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List downloaded videos and pending transfers
    List,

    /// Show the offline status of one video
    ///
    /// Example:
    ///   tubeoffline status dQw4w9WgXcQ
    Status {
        /// Asset id
        id: String,
    },

    /// Print the local file path of a downloaded video
    Locate {
        /// Asset id
        id: String,
    },

    /// Download a video and wait for it to finish
    ///
    /// Examples:
    ///   tubeoffline download dQw4w9WgXcQ /media/UC123/dQw4w9WgXcQ.mp4
    ///   tubeoffline download abc https://cdn.example.net/abc.mp4 --title "Talk"
    Download {
        /// Asset id
        id: String,
        /// Media URL, absolute or relative to the configured server
        url: String,
        /// Display title
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Cancel a pending transfer and discard its partial data
    Cancel {
        /// Asset id
        id: String,
    },

    /// Delete a downloaded video
    Delete {
        /// Asset id
        id: String,
    },

    /// Continue transfers interrupted by a previous run
    Resume,

    /// Tell the server a video has been watched
    ///
    /// Accepts an asset id, a media URL or a local file path.
    MarkWatched {
        /// Asset id or playback source
        id: String,
    },

    /// View or change configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set the media server base URL
    ///
    /// Example:
    ///   tubeoffline config set-server https://archive.example.org
    SetServer {
        /// Server URL
        url: String,
    },

    /// Set the API token sent with every request
    SetToken {
        /// API token
        token: String,
    },

    /// Store downloads somewhere other than the platform cache directory
    SetCacheDir {
        /// Cache root
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "{}",
                format_error(
                    "Could not load configuration",
                    &[&format!("{:#}", e)],
                    &["Fix or remove ~/.tubeoffline/config.json"],
                )
            );
            std::process::exit(CONFIG);
        }
    };

    match cli.command {
        Commands::List => list(&config),
        Commands::Status { id } => status(&config, &id),
        Commands::Locate { id } => locate(&config, &id),
        Commands::Download { id, url, title } => {
            let title = title.unwrap_or_else(|| id.clone());
            download(&config, Video::new(id, url, title)).await
        }
        Commands::Cancel { id } => cancel(&config, &id),
        Commands::Delete { id } => delete(&config, &id),
        Commands::Resume => resume(&config).await,
        Commands::MarkWatched { id } => mark_watched(&config, &id).await,
        Commands::Config { command } => handle_config(config, command),
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        Level::DEBUG
    } else if quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// Session
// ============================================================================

/// A coordinator wired to the HTTP transport, with its event loop running.
struct Session {
    coordinator: DownloadCoordinator,
    _event_loop: JoinHandle<()>,
}

fn open_session(config: &OfflineConfig) -> Result<Session> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = HttpTransport::open(config.staging_dir(), config.api_token(), events_tx)
        .context("Failed to open transfer journal")?;
    let store = AssetStore::load(config.storage_dir(), config.state_path()?, &config.file_extension);

    let coordinator = DownloadCoordinator::start_up(store, Arc::new(transport), config.base_url());
    let event_loop = coordinator.spawn_event_loop(events_rx);
    Ok(Session {
        coordinator,
        _event_loop: event_loop,
    })
}

fn open_store(config: &OfflineConfig) -> Result<AssetStore> {
    Ok(AssetStore::open(
        config.storage_dir(),
        config.state_path()?,
        &config.file_extension,
    ))
}

// ============================================================================
// Read-only commands
// ============================================================================

fn list(config: &OfflineConfig) -> Result<()> {
    let store = open_store(config)?;
    let pending = HttpTransport::journaled(&config.staging_dir())?;

    println!();
    println!("{}", "=== Offline Videos ===".bright_cyan().bold());
    println!();

    let ids: Vec<&String> = store.ids().collect();
    if ids.is_empty() {
        println!("  {}", "(none downloaded)".bright_black());
    }
    for id in ids {
        let size = store
            .locate(id)
            .and_then(|path| std::fs::metadata(path).ok())
            .map(|meta| format_size(meta.len()))
            .unwrap_or_else(|| "?".to_string());
        println!("  {} {:<24} {}", "[OK]".green(), id, size.bright_black());
    }

    if !pending.is_empty() {
        println!();
        println!("{}", "Pending transfers:".bold());
        for (handle, title) in pending {
            println!("  {} {:<24} {}", "[..]".yellow(), handle.asset_id, title.bright_black());
        }
        println!();
        println!("Continue them with: {}", "tubeoffline resume".bright_white());
    }
    println!();
    Ok(())
}

fn status(config: &OfflineConfig, id: &str) -> Result<()> {
    let store = open_store(config)?;
    if let Some(path) = store.locate(id) {
        println!("{} {} is downloaded: {}", "[OK]".green(), id, path.display());
        return Ok(());
    }

    let pending = HttpTransport::journaled(&config.staging_dir())?;
    if pending.iter().any(|(handle, _)| handle.asset_id == id) {
        println!(
            "{} {} has a pending transfer. Continue it with: tubeoffline resume",
            "[..]".yellow(),
            id
        );
    } else {
        println!("{} {} is not downloaded", "[-]".bright_black(), id);
    }
    Ok(())
}

fn locate(config: &OfflineConfig, id: &str) -> Result<()> {
    match open_store(config)?.locate(id) {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => {
            eprintln!("{} {}", "[X]".red(), OfflineError::NotFound(id.to_string()));
            std::process::exit(ERROR);
        }
    }
}

// ============================================================================
// Transfer commands
// ============================================================================

async fn download(config: &OfflineConfig, video: Video) -> Result<()> {
    let session = open_session(config)?;
    let coordinator = &session.coordinator;
    let events = coordinator.events();

    match coordinator.start(&video) {
        Ok(_) => {}
        Err(e) if e.is_precondition() => {
            println!("{} {}", "[!]".yellow(), e);
            if let Some(path) = coordinator.locate(&video.id) {
                println!("    {}", path.display());
            }
            return Ok(());
        }
        Err(e @ OfflineError::InvalidSource(_)) => {
            eprintln!(
                "{}",
                format_error(
                    &e.to_string(),
                    &["The URL is relative and no server is configured", "The URL is not http(s)"],
                    &["Set the server: tubeoffline config set-server <url>"],
                )
            );
            std::process::exit(CONFIG);
        }
        Err(e) => return Err(e.into()),
    }

    println!("{} Downloading {}", "[↓]".cyan(), video.title.bright_white());
    let outcome = wait_for_transfers(coordinator, vec![video.id.clone()], events).await?;
    finish(coordinator, outcome)
}

async fn resume(config: &OfflineConfig) -> Result<()> {
    let session = open_session(config)?;
    let coordinator = &session.coordinator;
    let events = coordinator.events();

    let ids: Vec<String> = coordinator
        .active_transfers()
        .into_iter()
        .map(|t| t.handle.asset_id)
        .collect();
    if ids.is_empty() {
        println!("{} No pending transfers", "[OK]".green());
        return Ok(());
    }

    println!("{} Resuming {} transfer(s)", "[↓]".cyan(), ids.len());
    let outcome = wait_for_transfers(coordinator, ids, events).await?;
    finish(coordinator, outcome)
}

/// Only the journal is touched; opening a session would relaunch every
/// other pending transfer.
fn cancel(config: &OfflineConfig, id: &str) -> Result<()> {
    let discarded = HttpTransport::discard_journaled(&config.staging_dir(), id)?;
    if discarded.is_empty() {
        println!("{} {}", "[!]".yellow(), OfflineError::NotInProgress(id.to_string()));
    } else {
        println!("{} Cancelled {}", "[OK]".green(), id);
    }
    Ok(())
}

fn delete(config: &OfflineConfig, id: &str) -> Result<()> {
    match open_store(config)?.remove(id) {
        Ok(()) => println!("{} Deleted {}", "[OK]".green(), id),
        Err(e) if e.is_precondition() => println!("{} {}", "[!]".yellow(), e),
        Err(e) => {
            eprintln!("{} {}", "[X]".red(), e);
            std::process::exit(IO_ERR);
        }
    }
    Ok(())
}

struct WaitOutcome {
    ids: Vec<String>,
    failures: HashMap<String, OfflineError>,
    interrupted: bool,
}

/// Show progress bars until every id has settled or Ctrl+C is pressed.
async fn wait_for_transfers(
    coordinator: &DownloadCoordinator,
    ids: Vec<String>,
    mut events: tokio::sync::broadcast::Receiver<CoordinatorEvent>,
) -> Result<WaitOutcome> {
    let style = ProgressStyle::default_bar()
        .template("  {spinner:.green} {prefix:<16} [{bar:40.cyan/blue}] {percent:>3}% {msg}")?
        .progress_chars("█▓░");

    let multi = MultiProgress::new();
    let bars: HashMap<String, ProgressBar> = ids
        .iter()
        .map(|id| {
            let bar = multi.add(ProgressBar::new(1000));
            bar.set_style(style.clone());
            bar.set_prefix(id.clone());
            bar.enable_steady_tick(Duration::from_millis(100));
            (id.clone(), bar)
        })
        .collect();

    let mut snapshots = coordinator.subscribe();
    let mut failures = HashMap::new();
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        for (id, bar) in &bars {
            if bar.is_finished() {
                continue;
            }
            match snapshot.status(id) {
                DownloadStatus::Downloading { progress: Some(p) } => {
                    bar.set_position((p * 1000.0) as u64);
                    bar.set_message("");
                }
                DownloadStatus::Downloading { progress: None } => bar.set_message("waiting for size"),
                DownloadStatus::Downloaded => bar.finish_with_message("done"),
                DownloadStatus::NotDownloaded => bar.abandon_with_message("stopped"),
            }
        }
        if ids.iter().all(|id| !snapshot.status(id).is_downloading()) {
            break;
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(CoordinatorEvent::Failed { asset_id, error })
                | Ok(CoordinatorEvent::CommitFailed { asset_id, error }) => {
                    failures.insert(asset_id, error);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                interrupted = true;
                break;
            }
        }
    }

    for bar in bars.values() {
        if !bar.is_finished() {
            bar.abandon();
        }
    }
    Ok(WaitOutcome {
        ids,
        failures,
        interrupted,
    })
}

fn finish(coordinator: &DownloadCoordinator, outcome: WaitOutcome) -> Result<()> {
    println!();
    if outcome.interrupted {
        println!(
            "{} Interrupted. Pending transfers continue with: {}",
            "[!]".yellow(),
            "tubeoffline resume".bright_white()
        );
        std::process::exit(TEMP_FAIL);
    }

    let mut failed = false;
    for id in &outcome.ids {
        match coordinator.locate(id) {
            Some(path) => println!("{} {} -> {}", "[OK]".green(), id, path.display()),
            None => {
                failed = true;
                let reason = outcome
                    .failures
                    .get(id)
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "transfer stopped".to_string());
                println!("{} {}: {}", "[X]".red(), id, reason);
            }
        }
    }

    if failed {
        println!();
        println!("Retry with the same download command once the server is reachable.");
        std::process::exit(IO_ERR);
    }
    Ok(())
}

// ============================================================================
// Watched reporting
// ============================================================================

async fn mark_watched(config: &OfflineConfig, id_or_source: &str) -> Result<()> {
    let id = if id_or_source.contains('/') {
        asset_id_from_source(id_or_source)
            .with_context(|| format!("No asset id in {}", id_or_source))?
    } else {
        id_or_source.to_string()
    };

    let reporter = HttpWatchReporter::from_config(config)?;
    match reporter.report_watched(&id).await {
        Ok(()) => {
            println!("{} Marked {} as watched", "[OK]".green(), id);
            Ok(())
        }
        Err(e) => {
            eprintln!(
                "{}",
                format_error(
                    &format!("Could not mark {} as watched", id),
                    &[&format!("{:#}", e)],
                    &["Check the server and token: tubeoffline config show"],
                )
            );
            std::process::exit(IO_ERR);
        }
    }
}

// ============================================================================
// Config
// ============================================================================

fn handle_config(mut config: OfflineConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", "=== tubeoffline Configuration ===".bright_cyan().bold());
            println!();

            let server = if config.base_url().is_empty() {
                "(not set)".bright_black().to_string()
            } else {
                config.base_url()
            };
            println!("  Server:      {}", server);

            let token = config.api_token();
            let token_display = match token.len() {
                0 => "(not set)".bright_black().to_string(),
                n if n > 8 => format!("{}...", token.chars().take(4).collect::<String>()),
                _ => "****".to_string(),
            };
            println!("  API token:   {}", token_display);
            println!("  Storage:     {}", config.storage_dir().display());
            println!("  Staging:     {}", config.staging_dir().display());
            println!("  Extension:   .{}", config.file_extension);
            println!(
                "  Watched:     last {:.0}% or {:.0}s, sampled every {}ms",
                config.watch.threshold_fraction * 100.0,
                config.watch.min_remaining_secs,
                config.watch.sample_interval_ms
            );
            println!();

            if let Ok(dir) = config::config_dir() {
                println!("Config file: {}", dir.join("config.json").display());
            }
            println!();
        }
        Some(ConfigCommands::SetServer { url }) => {
            let parsed = reqwest::Url::parse(url.trim()).with_context(|| format!("Invalid URL: {}", url))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                eprintln!("{} Server URL must be http or https", "[X]".red());
                std::process::exit(CONFIG);
            }
            config.server_url = url.trim().to_string();
            save_config(&config)?;
            println!("{} Server set to: {}", "[✓]".green(), config.base_url());
        }
        Some(ConfigCommands::SetToken { token }) => {
            config.api_token = token.trim().to_string();
            save_config(&config)?;
            println!("{} API token set", "[✓]".green());
        }
        Some(ConfigCommands::SetCacheDir { path }) => {
            config.cache_dir = Some(path);
            save_config(&config)?;
            println!("{} Downloads stored under: {}", "[✓]".green(), config.storage_dir().display());
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = MB * 1024.0;
    let bytes = bytes as f64;
    if bytes >= GB {
        format!("{:.2} GB", bytes / GB)
    } else {
        format!("{:.1} MB", bytes / MB)
    }
}
