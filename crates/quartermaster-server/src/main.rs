#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use quartermaster::{Allocator, store::DocumentStore};
use server::config::{CliArgs, ServerConfig, StoreConfig};
use server::routes::{AppState, router};
use server::telemetry::init_telemetry;
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_telemetry()?;

    match &config.store {
        StoreConfig::Memory => {
            tracing::warn!("no MONGO_URL set; pools live in process memory only");
            serve(quartermaster::store::MemoryStore::new(), config).await
        }
        #[cfg(feature = "mongodb")]
        StoreConfig::Mongo { url, database } => {
            let store = quartermaster::store::connect_with_retry(config.connect, || {
                quartermaster::store::MongoStore::connect(url, database)
            })
            .await?;
            serve(store, config).await
        }
        #[cfg(not(feature = "mongodb"))]
        StoreConfig::Mongo { .. } => {
            anyhow::bail!("MongoDB support requires the `mongodb` feature")
        }
    }
}

async fn serve<S>(store: S, config: ServerConfig) -> anyhow::Result<()>
where
    S: DocumentStore + 'static,
{
    let allocator = Allocator::with_config(store, config.allocator);
    for (name, pool) in &config.pools {
        allocator.initialize(name, pool).await?;
        tracing::info!(
            pool = %name,
            strategy = pool.strategy.kind(),
            min = pool.min,
            max = pool.max,
            "pool ready"
        );
    }

    let app = router(AppState::new(allocator, config.max_bulk));
    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config.server_addr, &config);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(addr: &str, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting allocation service on {addr} with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting allocation service on {addr} with {} startup pools",
            config.pools.len()
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                core::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {err}");
            core::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
