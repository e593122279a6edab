//! wasmgate server - serves project subdomains and the management API

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wasmgate::config::{load_config, validate_config, LogConfig, LogFormat, StorageBackendType};
use wasmgate::repository::{
    init_pool, migrations, ActionRepository, InMemoryRepository, PgRepository, ProjectRepository,
};
use wasmgate::sandbox::WasmtimeRuntime;
use wasmgate::server::{build_router, AppState};
use wasmgate::storage::{FsStorage, MemoryStorage, ModuleStorage};

// ---- CLI ----

#[derive(Parser)]
#[command(name = "wasmgate", version, about = "Run WebAssembly modules as HTTP-triggered functions")]
struct Args {
    /// Config file (TOML or JSON5)
    #[arg(long, short, env = "WASMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Port
    #[arg(long, short)]
    port: Option<u16>,
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| "info".into());
    match log.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ---- Main ----

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_tracing(&config.log);
    info!(version = wasmgate::VERSION, "Starting wasmgate");

    let report = validate_config(&config);
    for issue in &report.warnings {
        warn!("{}", issue);
    }
    if !report.valid {
        for issue in &report.errors {
            error!("{}", issue);
        }
        anyhow::bail!("invalid configuration ({} errors)", report.errors.len());
    }

    // Metadata
    let (projects, actions): (Arc<dyn ProjectRepository>, Arc<dyn ActionRepository>) =
        match config.database {
            Some(ref db) => {
                let pool = init_pool(db).await?;
                info!("Database connected");
                migrations::run(&pool).await?;
                info!("Migrations complete");
                let repo = Arc::new(PgRepository::new(pool));
                (repo.clone() as Arc<dyn ProjectRepository>, repo as Arc<dyn ActionRepository>)
            }
            None => {
                info!("Using in-memory repositories");
                let repo = Arc::new(InMemoryRepository::new());
                (repo.clone() as Arc<dyn ProjectRepository>, repo as Arc<dyn ActionRepository>)
            }
        };

    // Module blobs
    let storage: Arc<dyn ModuleStorage> = match config.storage.backend {
        StorageBackendType::Fs => {
            info!(root = %config.storage.root.display(), "Using filesystem module storage");
            Arc::new(FsStorage::new(config.storage.root.clone()))
        }
        StorageBackendType::Memory => Arc::new(MemoryStorage::new()),
    };

    let runtime = Arc::new(WasmtimeRuntime::new(&config.sandbox)?);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let state = AppState::new(&config, projects, actions, storage, runtime)?.with_shutdown(cancel_rx);
    let app = build_router(state, config.server.max_module_bytes);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("wasmgate listening on http://{}", addr);

    let grace = config.server.shutdown_timeout;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!(grace = ?grace, "Shutdown requested, draining requests");
            // Guests still running after the grace period are cancelled
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = cancel_tx.send(true);
            });
        })
        .await?;

    info!("wasmgate shutdown complete");
    Ok(())
}
