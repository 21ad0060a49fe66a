//! Image Service - image registry with a node-local image cache
//!
//! One binary for the API server and the operator utilities: schema
//! management, registry purge, cache management and cache maintenance.

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use image_service::api::{create_router, AppState};
use image_service::backend::StoreRegistry;
use image_service::cache::{Cleaner, ImageCache, Prefetcher, Pruner};
use image_service::client::CacheClient;
use image_service::config::Config;
use image_service::migration::Migrator;
use image_service::models::ClearTarget;
use image_service::registry::Registry;
use image_service::tasks::TaskExecutor;
use image_service::workers::{spawn_maintenance_task, spawn_prefetch_task};

#[derive(Parser)]
#[command(name = "image-service")]
#[command(about = "Image registry with a node-local image cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and its background workers
    Serve,
    /// Registry schema and purge commands
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// Manage the cache of a running server
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Evict least recently used images until the cache fits its ceiling
    CachePrune,
    /// Remove stalled, invalid and orphaned cache files
    CacheClean,
    /// Fetch queued images into the cache
    CachePrefetch,
}

#[derive(Subcommand)]
enum DbCommands {
    /// Print the schema version
    Version,
    /// Expand, migrate and contract to the newest release
    Sync,
    /// Same as sync
    Upgrade,
    /// Apply additive schema changes
    Expand,
    /// Run pending data migrations
    Migrate,
    /// Remove what the previous release needed
    Contract,
    /// Delete old soft-deleted rows from every table except images
    Purge(PurgeArgs),
    /// Delete old soft-deleted images no location references
    #[command(name = "purge_images_table")]
    PurgeImagesTable(PurgeArgs),
}

#[derive(Args)]
struct PurgeArgs {
    /// Only purge rows deleted more than this many days ago
    #[arg(long = "age_in_days", default_value_t = 30)]
    age_in_days: u32,
    /// Stop after this many rows; -1 for no limit
    #[arg(long = "max_rows", default_value_t = 100, allow_negative_numbers = true)]
    max_rows: i64,
}

#[derive(Args)]
struct ServerArgs {
    /// Server host
    #[arg(long, global = true, default_value = "localhost")]
    host: String,
    /// Server port
    #[arg(long, global = true, env = "SERVER_PORT", default_value_t = 9292)]
    port: u16,
    /// Use https and accept any server certificate
    #[arg(long, global = true, default_value_t = false)]
    insecure: bool,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached images
    ListCached,
    /// List images queued for caching
    ListQueued,
    /// Queue an image for caching
    QueueImage { image_id: Uuid },
    /// Remove an image from the cache
    DeleteCachedImage { image_id: Uuid },
    /// Remove every image from the cache
    DeleteAllCachedImages {
        /// Do not ask for confirmation
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Remove an image from the queue
    DeleteQueuedImage { image_id: Uuid },
    /// Remove every image from the queue
    DeleteAllQueuedImages {
        /// Do not ask for confirmation
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "image_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Db { command } => db(command),
        Commands::Cache { command, server } => cache(command, server).await,
        Commands::CachePrune => {
            let config = load_config()?;
            let cache = ImageCache::open(&config).context("failed to open image cache")?;
            let report = Pruner::new(&cache).run().context("pruner failed")?;
            println!(
                "Pruned {} images, freed {} bytes ({} -> {} bytes)",
                report.entries_removed, report.bytes_freed, report.total_before, report.total_after
            );
            Ok(())
        }
        Commands::CacheClean => {
            let config = load_config()?;
            let cache = ImageCache::open(&config).context("failed to open image cache")?;
            let report = Cleaner::new(&cache).run().context("cleaner failed")?;
            println!(
                "Removed {} stalled, {} invalid and {} orphaned files",
                report.stalled_removed, report.invalid_removed, report.orphans_removed
            );
            Ok(())
        }
        Commands::CachePrefetch => {
            let config = load_config()?;
            let prefetcher = open_prefetcher(&config).await?;
            let report = prefetcher.run().await.context("prefetch failed")?;
            println!("Cached {} images, {} failed", report.cached, report.failed);
            Ok(())
        }
    }
}

fn load_config() -> Result<Config> {
    Config::from_env().context("invalid configuration")
}

async fn open_prefetcher(config: &Config) -> Result<Prefetcher> {
    let cache = Arc::new(ImageCache::open(config).context("failed to open image cache")?);
    let registry = Arc::new(open_registry(config)?);
    Migrator::new(&registry)
        .check_ready()
        .context("registry schema is not ready")?;
    let stores = StoreRegistry::from_config(config)
        .await
        .context("failed to open backing stores")?;
    Ok(Prefetcher::new(
        cache,
        registry,
        stores,
        config.cache_prefetcher_concurrency,
    ))
}

fn open_registry(config: &Config) -> Result<Registry> {
    Registry::open(&config.database_path).with_context(|| {
        format!(
            "failed to open registry database {}",
            config.database_path.display()
        )
    })
}

// == Server ==
/// # Startup Sequence
/// 1. Load configuration from environment variables
/// 2. Open registry, cache, stores and staging area
/// 3. Refuse to start unless the schema is expanded and migrated
/// 4. Start background prefetch and maintenance tasks
/// 5. Serve HTTP until SIGINT/SIGTERM
async fn serve() -> Result<()> {
    info!("Starting Image Service");

    let config = load_config()?;
    info!(
        port = config.server_port,
        cache_dir = %config.image_cache_dir.display(),
        max_size = config.image_cache_max_size,
        executor = ?config.task_executor,
        "configuration loaded"
    );

    let state = AppState::from_config(&config)
        .await
        .context("failed to initialise service state")?;
    Migrator::new(&state.registry)
        .check_ready()
        .context("registry schema is not ready")?;
    if config.recover_imports_on_start {
        state
            .importer
            .recover_interrupted(state.task_ttl())
            .context("failed to release interrupted imports")?;
    }

    let mut workers = vec![spawn_maintenance_task(
        state.registry.clone(),
        state.cache.clone(),
        config.maintenance_interval,
        config.cache_inline_maintenance,
    )];
    if config.cache_prefetcher_interval > 0 {
        let prefetcher = Prefetcher::new(
            state.cache.clone(),
            state.registry.clone(),
            state.stores.clone(),
            config.cache_prefetcher_concurrency,
        );
        workers.push(spawn_prefetch_task(
            prefetcher,
            config.cache_prefetcher_interval,
        ));
    }
    info!(count = workers.len(), "background workers started");

    let executor = state.executor.clone();
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(workers, executor))
        .await
        .context("server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM), then closes the task
/// executor and aborts the background workers.
async fn shutdown_signal(workers: Vec<JoinHandle<()>>, executor: Arc<TaskExecutor>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    executor.shutdown();
    for worker in &workers {
        worker.abort();
    }
    warn!(count = workers.len(), "background workers aborted");
}

// == Database Commands ==
fn db(command: DbCommands) -> Result<()> {
    let config = load_config()?;
    let registry = open_registry(&config)?;
    let migrator = Migrator::new(&registry);

    match command {
        DbCommands::Version => {
            let version = migrator.version()?;
            println!("{version}");
            if !version.is_latest() {
                println!("Latest: {}", image_service::migration::SchemaVersion::latest());
            }
        }
        DbCommands::Sync => println!("Database is now at {}", migrator.sync()?),
        DbCommands::Upgrade => println!("Database is now at {}", migrator.upgrade()?),
        DbCommands::Expand => {
            let version = migrator.expand()?;
            println!("Database expanded to {version}");
            let pending = migrator.pending()?;
            if pending > 0 {
                println!("{pending} rows need migrating; run `db migrate`");
            }
        }
        DbCommands::Migrate => println!("Migrated {} rows", migrator.migrate()?),
        DbCommands::Contract => println!("Database contracted to {}", migrator.contract()?),
        DbCommands::Purge(args) => {
            let report = registry.purge(args.age_in_days, max_rows(args.max_rows)?)?;
            println!(
                "Purged {} image locations, {} tasks and {} task info rows",
                report.image_locations, report.tasks, report.task_info
            );
        }
        DbCommands::PurgeImagesTable(args) => {
            let report = registry.purge_images_table(args.age_in_days, max_rows(args.max_rows)?)?;
            println!("Purged {} images", report.images);
        }
    }
    Ok(())
}

/// Maps the `--max_rows` flag: -1 means no limit.
fn max_rows(raw: i64) -> Result<Option<u64>> {
    match raw {
        -1 => Ok(None),
        n if n < -1 => bail!("max_rows must be a positive number or -1 for no limit"),
        n => Ok(Some(n as u64)),
    }
}

// == Cache Commands ==
async fn cache(command: CacheCommands, server: ServerArgs) -> Result<()> {
    let client = CacheClient::new(&server.host, server.port, server.insecure)?;

    match command {
        CacheCommands::ListCached => {
            let listing = client.list().await?;
            if listing.cached_images.is_empty() {
                println!("No cached images");
            }
            for image in listing.cached_images {
                println!(
                    "{}  {:>12} bytes  {:>6} hits  last accessed {}",
                    image.image_id,
                    image.size,
                    image.hits,
                    image.last_accessed.to_rfc3339()
                );
            }
        }
        CacheCommands::ListQueued => {
            let listing = client.list().await?;
            if listing.queued_images.is_empty() {
                println!("No queued images");
            }
            for id in listing.queued_images {
                println!("{id}");
            }
        }
        CacheCommands::QueueImage { image_id } => {
            client.queue_image(image_id).await?;
            println!("Queued image {image_id}");
        }
        CacheCommands::DeleteCachedImage { image_id }
        | CacheCommands::DeleteQueuedImage { image_id } => {
            client.delete_image(image_id).await?;
            println!("Deleted image {image_id} from the cache");
        }
        CacheCommands::DeleteAllCachedImages { force } => {
            if force || confirm("Delete all cached images?")? {
                let report = client.clear(ClearTarget::Cache).await?;
                println!("Deleted {} cached images", report.cached_removed);
            }
        }
        CacheCommands::DeleteAllQueuedImages { force } => {
            if force || confirm("Delete all queued images?")? {
                let report = client.clear(ClearTarget::Queue).await?;
                println!("Deleted {} queued images", report.queued_removed);
            }
        }
    }
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
