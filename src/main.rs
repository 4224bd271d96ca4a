//! tabsync-db - administrative tool for the TabSync storage layer
//!
//! `init` applies the schema to the structured store and verifies it;
//! `health` selects a backend the way the server does and probes it.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tabsync_store::{ConnectionMode, LibsqlStorage, StorageBackend, StoreConfig, StoreProvider};
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tabsync-db")]
#[command(about = "Schema setup and health checks for the TabSync store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (environment variables take precedence)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Set log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the schema to the structured store and print table counts
    Init {
        /// Database URL (overrides DATABASE_URL)
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Select the configured backend and run its health check
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Keep HTTP and libSQL internals quiet unless asked
    let filter = EnvFilter::new(format!(
        "tabsync_store={level},tabsync_db={level},libsql=warn,hyper=warn,reqwest=warn",
        level = level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("tabsync-db v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = StoreConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Init { database_url } => init(config, database_url).await,
        Commands::Health => health(config).await,
    }
}

async fn init(config: StoreConfig, database_url: Option<String>) -> anyhow::Result<()> {
    let Some(url) = database_url.or(config.database_url.clone()) else {
        bail!("no database configured: pass --database-url or set DATABASE_URL");
    };

    let mode = ConnectionMode::from_dsn(&url, config.database_auth_token.as_deref())?;
    info!("Initializing schema on {:?}", mode);
    let storage = LibsqlStorage::new(mode, &config.pool)
        .await
        .context("failed to open database")?;

    let counts = storage.table_counts().await.context("schema verification failed")?;

    println!();
    println!("Schema ready (connection strategy: {})", storage.strategy());
    println!();
    for (table, count) in &counts {
        println!("   {:<28} {:>8} rows", table, count);
    }
    println!();

    storage.close().await?;
    Ok(())
}

async fn health(config: StoreConfig) -> anyhow::Result<()> {
    let provider = StoreProvider::from_config(config);
    let result = async {
        let backend = provider.backend().await?;
        backend.health_check().await?;
        Ok::<_, tabsync_store::StoreError>(backend.backend_kind())
    }
    .await;

    let stats = provider.stats().await;
    provider.shutdown().await;

    let kind = result.context("health check failed")?;
    println!();
    println!("Backend:    {}", kind);
    println!("Deployment: {}", stats.mode);
    if let Some(fingerprint) = stats.pool.fingerprint {
        println!("Config:     {}", fingerprint);
    }
    for entry in &stats.cache.entries {
        println!("Cached:     {} ({})", entry.fingerprint, entry.backend);
    }
    println!("Status:     healthy");
    println!();
    Ok(())
}
