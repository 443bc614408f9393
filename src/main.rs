use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use appshelf::attachment::FsBlobStore;
use appshelf::config::{AppConfig, CONFIG_FILE};
use appshelf::indexer::{HttpFetcher, Indexer};
use appshelf::release::{LoggingOrchestrator, Reconciler};
use appshelf::server::{AppState, create_router};
use appshelf::store::{SqliteStore, Store};

/// Pending orchestrator reports buffered before drivers are made to wait.
const REPORT_BUFFER: usize = 64;

#[derive(Parser)]
#[command(name = "appshelf")]
#[command(about = "An application catalog server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, database and a default config file
    Init {
        /// Data directory for the database, blobs and config
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },

    /// Start the server
    Serve {
        /// Data directory for the database, blobs and config
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (overrides the config file)
        #[arg(long, short)]
        port: Option<u16>,

        /// Name this process uses when holding index leases
        #[arg(long)]
        instance_id: Option<String>,
    },

    /// Index one repository and print the report
    Index {
        /// Data directory for the database, blobs and config
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Repository id
        repository: String,
    },
}

fn run_init(data_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;

    let config = AppConfig::load(data_dir)?;
    let db_path = config.server.db_path();
    if db_path.exists() {
        bail!("Already initialized: {} exists", db_path.display());
    }

    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;
    fs::create_dir_all(config.server.blob_dir())?;

    let config_path = data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        fs::write(&config_path, toml::to_string_pretty(&AppConfig::default())?)?;
    }

    println!("Initialized {}", data_dir.display());
    println!("  database: {}", db_path.display());
    println!("  config:   {}", config_path.display());
    Ok(())
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    let db_path = config.server.db_path();
    if !db_path.exists() {
        bail!("Server not initialized. Run 'appshelf init' first to create the database.");
    }
    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;
    Ok(Arc::new(store))
}

fn http_fetcher(config: &AppConfig) -> anyhow::Result<HttpFetcher> {
    let mut fetcher = HttpFetcher::new()?;
    for (credential_ref, token) in &config.indexer.credentials {
        fetcher = fetcher.with_credential(credential_ref, token);
    }
    Ok(fetcher)
}

async fn run_serve(config: AppConfig) -> anyhow::Result<()> {
    config.validate()?;
    let store = open_store(&config)?;
    let blobs = Arc::new(FsBlobStore::new(&config.server.blob_dir()));
    let fetcher = Arc::new(http_fetcher(&config)?);

    let state = Arc::new(AppState::new(
        store,
        blobs,
        fetcher,
        Arc::new(LoggingOrchestrator),
        config.indexer.clone(),
        config.server.instance_id(),
    ));

    let shutdown = CancellationToken::new();
    let sync_task = state.indexer.spawn_periodic_sync(shutdown.clone());
    // The sender stays alive for the lifetime of the server so the
    // reconciler keeps polling.
    let (reconciler, _reports) = Reconciler::new(
        state.releases.clone(),
        config.release.reconcile_interval(),
        REPORT_BUFFER,
    );
    let reconcile_task = reconciler.spawn(shutdown.clone());

    let app = create_router(state);
    let addr = config.server.socket_addr()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(sync_task, reconcile_task);
    Ok(())
}

async fn run_index(config: AppConfig, repository: &str) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let fetcher = Arc::new(http_fetcher(&config)?);
    let indexer = Indexer::new(
        store,
        fetcher,
        config.indexer.clone(),
        format!("cli-{}", std::process::id()),
    );

    let report = indexer.trigger_index(repository)?.wait().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("appshelf=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { data_dir } => run_init(&data_dir)?,
        Commands::Serve {
            data_dir,
            host,
            port,
            instance_id,
        } => {
            let mut config = AppConfig::load(&data_dir)?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if instance_id.is_some() {
                config.server.instance_id = instance_id;
            }
            run_serve(config).await?;
        }
        Commands::Index {
            data_dir,
            repository,
        } => {
            let config = AppConfig::load(&data_dir)?;
            run_index(config, &repository).await?;
        }
    }

    Ok(())
}
