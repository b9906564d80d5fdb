use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use litevec_core::blob::redis::RedisBlobStore;
use litevec_core::blob::BlobStore;
use litevec_core::config;
use litevec_server::api::create_router;
use litevec_server::cluster::kv::{EtcdKv, KvStore};
use litevec_server::cluster::registry::RegistryAgent;
use litevec_server::controller::{Controller, ServerConfig};

#[derive(Parser)]
#[command(name = "litevec-server", about = "Sharded in-memory vector index cluster node")]
struct Args {
    /// HTTP listen address; doubles as this node's cluster identity
    #[arg(long, default_value = config::DEFAULT_LISTEN_ADDR)]
    listen_addr: String,

    /// Vector dimensionality
    #[arg(long, default_value_t = config::DEFAULT_DIM)]
    dim: usize,

    /// Minimum inner-product score for a search hit
    #[arg(long, default_value_t = config::DEFAULT_DIST_THRESHOLD)]
    distance_threshold: f32,

    /// Per-shard capacity; insertion beyond it evicts the oldest entry
    #[arg(long, default_value_t = config::DEFAULT_SIZE_LIMIT)]
    size_limit: usize,

    /// Seconds between leader rebalance passes
    #[arg(long, default_value_t = config::DEFAULT_BALANCE_INTERVAL_SECS)]
    balance_interval: u64,

    /// etcd endpoint (host:port)
    #[arg(long, default_value = config::DEFAULT_KV_ADDR)]
    kv_addr: String,

    /// redis endpoint (host:port)
    #[arg(long, default_value = config::DEFAULT_BLOB_ADDR)]
    blob_addr: String,

    /// Service registry endpoint
    #[arg(long, default_value = config::DEFAULT_REGISTRY_ADDR)]
    registry_addr: String,

    /// Application name; used as KV prefix and registry app id
    #[arg(long, default_value = config::DEFAULT_APP_NAME)]
    app_name: String,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if args.dim == 0 || args.dim > config::MAX_DIMENSION {
        eprintln!("Error: dim must be 1-{}", config::MAX_DIMENSION);
        std::process::exit(1);
    }
    if args.size_limit == 0 {
        eprintln!("Error: size-limit must be > 0");
        std::process::exit(1);
    }
    if args.balance_interval == 0 {
        eprintln!("Error: balance-interval must be > 0");
        std::process::exit(1);
    }
    if !args.distance_threshold.is_finite() {
        eprintln!("Error: distance-threshold must be finite");
        std::process::exit(1);
    }

    let kv: Arc<dyn KvStore> = match EtcdKv::connect(&args.kv_addr).await {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            eprintln!("Error: cannot reach etcd at {}: {}", args.kv_addr, e);
            std::process::exit(1);
        }
    };
    let blob: Arc<dyn BlobStore> = match RedisBlobStore::connect(&args.blob_addr).await {
        Ok(blob) => Arc::new(blob),
        Err(e) => {
            eprintln!("Error: cannot reach redis at {}: {}", args.blob_addr, e);
            std::process::exit(1);
        }
    };

    let prometheus_handle =
        metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config::ACQUIRE_TIMEOUT_SECS))
        .build()?;

    let cfg = ServerConfig {
        listen_addr: args.listen_addr.clone(),
        dim: args.dim,
        dist_threshold: args.distance_threshold,
        size_limit: args.size_limit,
        balance_interval: Duration::from_secs(args.balance_interval),
        app_name: args.app_name.clone(),
    };

    let root = CancellationToken::new();
    let ctl = Controller::new(cfg, kv, blob, http.clone(), prometheus_handle, root.clone());
    ctl.start().await?;

    RegistryAgent::new(http, &args.registry_addr, &args.app_name, &args.listen_addr)
        .spawn(root.child_token());

    let app = create_router(ctl.clone());
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %args.listen_addr,
        dim = args.dim,
        distance_threshold = args.distance_threshold,
        size_limit = args.size_limit,
        balance_interval_secs = args.balance_interval,
        app = %args.app_name,
        "litevec node ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await?;

    // Cancels every scope: lease keep-alive, election, balancer, registry.
    root.cancel();
    // Let the registry deregistration go out before the runtime drops.
    tokio::time::sleep(Duration::from_millis(500)).await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    tracing::info!("Shutting down gracefully, draining in-flight requests...");
}
