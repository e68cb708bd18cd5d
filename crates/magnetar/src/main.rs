use clap::Parser;
use magnetar_server::{ApiServer, Config as ApiConfig};
use magnetar_store::{Config as StoreConfig, ImageStore};
use magnetar_zfs::ZfsProvider;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "magnetar", about = "Magnetar guest disk image agent")]
struct Cli {
    /// Listen port for the JSON-RPC and download endpoints
    #[arg(short, long, default_value_t = 19999)]
    port: u16,

    /// Pool holding the image and guest datasets
    #[arg(short, long, default_value = "magnetar")]
    zpool: String,

    /// host:port of the image service
    #[arg(short, long, default_value = "image.services.local:80")]
    image_service: String,

    /// Log level: trace/debug/info/warn/error
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Override the directory holding the catalog file and download
    /// scratch space (default: /<zpool>/images)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Fetch worker count (default: max(5, CPU count))
    #[arg(long, default_value_t = 0)]
    num_fetchers: usize,

    /// Bound on queued fetch requests (default: minimal buffering)
    #[arg(long, default_value_t = 0)]
    max_pending: usize,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    info!("Starting magnetar agent for pool '{}'", cli.zpool);

    let mut store_config = StoreConfig::new(&cli.image_service, &cli.zpool);
    store_config.num_fetchers = cli.num_fetchers;
    store_config.max_pending = cli.max_pending;
    store_config.image_dir = cli.data_dir;

    let provider = Arc::new(ZfsProvider::new());
    let store = Arc::new(
        ImageStore::create(store_config, provider)
            .await
            .map_err(|e| miette::miette!("Failed to create image store: {}", e))?,
    );

    let api_config = ApiConfig {
        listen_addr: format!("0.0.0.0:{}", cli.port)
            .parse()
            .map_err(|e| miette::miette!("Invalid listen port {}: {}", cli.port, e))?,
    };

    let token = CancellationToken::new();

    let store_token = token.clone();
    let engine = store.clone();
    let engine_handle = tokio::spawn(async move {
        if let Err(e) = engine.run(store_token).await {
            error!("Image store error: {}", e);
        }
    });

    let server = ApiServer::new(api_config, store);
    let server_token = token.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(server_token).await {
            error!("API server error: {}", e);
        }
    });

    let sig = shutdown_signal().await;
    info!("Received {}, shutting down gracefully...", sig);
    token.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(engine_handle, server_handle);
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for either SIGINT (ctrl-c) or SIGTERM, returning which one fired.
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}
