//! # Virtual Tourist
//!
//! Command-line front end standing in for the map and photo grid. Every
//! adapter is built exactly once here and handed to the orchestration layer.

use anyhow::Context;
use clap::{Parser, Subcommand};
use configs::{LogFormat, LogSettings, Settings};
use secrecy::SecretString;
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vt_core::error::AppError;
use vt_core::models::{Coordinate, PhotoId, PinId};
use vt_db_sqlite::SqliteMetadataStore;
use vt_fetch::{FetchCoordinator, FetchOptions, PinLifecycleManager, RefreshOutcome};
use vt_flickr::{FlickrClient, FlickrConfig};
use vt_storage_local::LocalContentStore;

#[derive(Parser)]
#[command(name = "virtual-tourist", version, about = "Drop pins, browse photos taken nearby")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage pins
    #[command(subcommand)]
    Pin(PinCommand),
    /// Show a pin's photos, searching for them the first time
    Photos { pin: PinId },
    /// Remove selected photos, or replace the whole collection when none are given
    Refresh {
        pin: PinId,
        #[arg(long = "remove", value_name = "PHOTO_ID")]
        remove: Vec<PhotoId>,
    },
    /// Reclaim cached images that no photo owns
    Sweep,
}

#[derive(Subcommand)]
enum PinCommand {
    #[command(allow_negative_numbers = true)]
    Add { lat: f64, lon: f64 },
    List,
    #[command(allow_negative_numbers = true)]
    Find { lat: f64, lon: f64 },
    Rm { id: PinId },
    /// Delete every pin, or with --photos-only every photo
    Clear {
        #[arg(long)]
        photos_only: bool,
    },
}

impl Command {
    fn needs_provider(&self) -> bool {
        matches!(self, Command::Photos { .. } | Command::Refresh { .. })
    }
}

struct App {
    coordinator: Arc<FetchCoordinator>,
    lifecycle: PinLifecycleManager,
}

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match log.format {
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn build_app(mut settings: Settings) -> anyhow::Result<App> {
    let metadata = Arc::new(
        SqliteMetadataStore::new(&settings.database.url)
            .await
            .with_context(|| format!("opening {}", settings.database.url))?,
    );
    let content = Arc::new(
        LocalContentStore::new(
            settings.storage.cache_dir.clone(),
            settings.storage.memory_capacity_bytes,
        )
        .await
        .with_context(|| format!("opening {}", settings.storage.cache_dir.display()))?,
    );

    // Commands that never reach the provider run without a key.
    let api_key = settings
        .flickr
        .api_key
        .take()
        .unwrap_or_else(|| SecretString::from(String::new()));
    let mut flickr = FlickrConfig::new(api_key);
    flickr.endpoint = settings.flickr.endpoint.clone();
    flickr.per_page = settings.flickr.per_page;
    flickr.max_page = settings.flickr.max_page;
    flickr.timeout = settings.flickr.timeout();
    let flickr = Arc::new(FlickrClient::new(flickr)?);

    let coordinator = Arc::new(FetchCoordinator::new(
        metadata.clone(),
        content.clone(),
        flickr.clone(),
        flickr,
        FetchOptions {
            prefetch_images: settings.fetch.prefetch_images,
        },
    ));
    let lifecycle = PinLifecycleManager::new(metadata, content, coordinator.clone());

    Ok(App {
        coordinator,
        lifecycle,
    })
}

/// Prints the advisory for a pin-wide failure and maps it to an exit code.
fn advise(err: &AppError) -> ExitCode {
    match err.advisory() {
        Some(advisory) => eprintln!("{advisory}"),
        None => eprintln!("{err}"),
    }
    ExitCode::FAILURE
}

async fn run(app: &App, command: Command) -> Result<ExitCode, AppError> {
    match command {
        Command::Pin(PinCommand::Add { lat, lon }) => {
            let pin = app.lifecycle.create_pin(Coordinate::new(lat, lon)).await?;
            println!("{}", pin.id);
        }
        Command::Pin(PinCommand::List) => {
            for pin in app.lifecycle.list_pins().await? {
                println!(
                    "{}  {}  {}",
                    pin.id,
                    pin.coordinate(),
                    pin.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Pin(PinCommand::Find { lat, lon }) => {
            let coordinate = Coordinate::new(lat, lon);
            match app.lifecycle.find_pin_at(coordinate).await? {
                Some(pin) => println!("{}", pin.id),
                None => {
                    eprintln!("no pin at {coordinate}");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::Pin(PinCommand::Rm { id }) => {
            let report = app.lifecycle.delete_pin(id).await?;
            println!("deleted 1 pin and {} photos", report.photos);
            for err in &report.errors {
                eprintln!("warning: {err}");
            }
        }
        Command::Pin(PinCommand::Clear { photos_only }) => {
            let report = if photos_only {
                app.lifecycle.delete_all_photos().await?
            } else {
                app.lifecycle.delete_all_pins().await?
            };
            println!("deleted {} pins and {} photos", report.pins, report.photos);
            for err in &report.errors {
                eprintln!("warning: {err}");
            }
        }
        Command::Photos { pin } => {
            let photos = match app.coordinator.ensure_photos(pin).await {
                Ok(outcome) => outcome.photos().to_vec(),
                Err(e) => return Ok(advise(&e)),
            };
            let mut results = app.coordinator.prefetch_images(photos.clone()).await;
            results.sort_by_key(|(id, _)| *id);
            for (id, result) in results {
                match result {
                    Ok(bytes) => println!("{id}  {} bytes", bytes.len()),
                    Err(_) => println!("{id}  [placeholder]"),
                }
            }
        }
        Command::Refresh { pin, remove } => {
            let selection: HashSet<PhotoId> = remove.into_iter().collect();
            match app.coordinator.refresh(pin, &selection).await {
                Ok(RefreshOutcome::Removed(removed)) => {
                    println!("removed {} photos", removed.len());
                }
                Ok(RefreshOutcome::Replaced { removed, outcome }) => {
                    println!(
                        "replaced {} photos with {} new ones",
                        removed.len(),
                        outcome.photos().len()
                    );
                }
                Err(e) => return Ok(advise(&e)),
            }
        }
        Command::Sweep => {
            let report = app.lifecycle.sweep_orphans().await?;
            println!(
                "removed {} orphaned images and {} partial writes",
                report.orphans_removed, report.temp_files_removed
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    init_tracing(&settings.log);

    if cli.command.needs_provider() {
        settings.require_api_key()?;
    }

    let app = build_app(settings).await?;

    if !matches!(cli.command, Command::Sweep) {
        if let Err(e) = app.lifecycle.sweep_orphans().await {
            error!(error = %e, "startup sweep failed");
        }
    }

    info!("virtual tourist ready");
    match run(&app, cli.command).await {
        Ok(code) => Ok(code),
        Err(e) => Ok(advise(&e)),
    }
}
