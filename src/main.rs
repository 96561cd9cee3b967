//! pairgate - Multi-tenant session gateway for QR-paired messaging transports
//!
//! Keeps one long-lived transport session per tenant, serves the pairing QR
//! code while a device is being linked, and reconnects after transient drops.

use anyhow::Result;
use clap::Parser;
use pairgate_core::Config;
use pairgate_server::{create_router, AppState};
use pairgate_session::{
    CredentialStore, FileCredentialStore, LifecycleController, MemoryCredentialStore,
    ScriptedTransport,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// Interval of the expired-artifact sweep
const ARTIFACT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// pairgate - Per-tenant session lifecycle over HTTP
#[derive(Parser, Debug)]
#[command(name = "pairgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Server port
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Extra allowed CORS origins, comma separated (`*.example.com` matches subdomains)
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Directory holding per-tenant credentials
    #[arg(long, env = "PAIRGATE_AUTH_DIR")]
    auth_dir: Option<PathBuf>,

    /// Keep credentials in memory only (lost on exit)
    #[arg(long)]
    ephemeral: bool,

    /// Pairing QR validity in seconds
    #[arg(long, default_value = "60")]
    qr_ttl: u64,

    /// Delay before reconnecting after a transient close, in milliseconds
    #[arg(long, default_value = "1500")]
    reconnect_ms: u64,

    /// Transport connect timeout in seconds
    #[arg(long, default_value = "20")]
    connect_timeout: u64,

    /// Demo transport: seconds until a pending pairing is reported as scanned
    #[arg(long, default_value = "30")]
    scan_delay: u64,

    /// Demo transport: seconds between fresh QR payloads
    #[arg(long, default_value = "20")]
    qr_refresh: u64,

    /// Service name reported by the status endpoint
    #[arg(long, default_value = "pairgate")]
    service_name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(log_level.into())
                .add_directive("hyper=warn".parse()?),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("pairgate v{}", env!("CARGO_PKG_VERSION"));

    // Create configuration
    let mut config = Config::new()
        .with_port(args.port)
        .with_artifact_ttl(Duration::from_secs(args.qr_ttl))
        .with_reconnect_backoff(Duration::from_millis(args.reconnect_ms))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_allowed_origins(args.allowed_origins.iter().cloned());
    if let Some(dir) = &args.auth_dir {
        config = config.with_credentials_dir(dir.clone());
    }
    config.validate()?;
    debug!("Configuration: {:?}", config);

    // Credential storage
    let store: Arc<dyn CredentialStore> = if args.ephemeral {
        info!("Credentials: in memory (ephemeral)");
        Arc::new(MemoryCredentialStore::new())
    } else {
        let store = FileCredentialStore::new(config.credentials_dir.clone())?;
        info!("Credentials: {}", store.dir().display());
        Arc::new(store)
    };

    let transport = Arc::new(ScriptedTransport::demo(
        Duration::from_secs(args.scan_delay),
        Duration::from_secs(args.qr_refresh.max(1)),
    ));
    info!(
        "Transport: demo (pairing completes {}s after the first QR)",
        args.scan_delay
    );

    let controller = LifecycleController::new(config.clone(), transport, store);
    let state = Arc::new(AppState::new(controller.clone()).with_service(args.service_name));
    let router = create_router(state);

    let sweeper = {
        let controller = controller.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ARTIFACT_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                controller.purge_expired_artifacts();
            }
        })
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting server on port {}...", config.port);
    info!("  Allowed origins: {}", config.allowed_origins.join(", "));
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    // Cleanup
    sweeper.abort();
    controller.shutdown().await;

    info!("Goodbye!");
    Ok(())
}
