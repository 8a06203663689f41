use axum::{extract::State, http::StatusCode, routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use task_queue_broker::{metrics::BrokerMetrics, Broker, BrokerConfig};
use task_queue_core::store::{RedisStore, StoreConfig};
use task_queue_core::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tq-broker")]
#[command(about = "Priority task queue broker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "broker.yaml")]
    config: String,

    /// Queue identifier
    #[arg(long)]
    queue: Option<String>,

    /// Prometheus metrics port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = if config_found {
        BrokerConfig::from_file(&args.config)?
    } else {
        BrokerConfig {
            store: StoreConfig::from_env(),
            ..BrokerConfig::default()
        }
    };

    // Override with CLI args
    if let Some(queue) = args.queue {
        config.queue_id = queue;
    }
    if let Some(port) = args.metrics_port {
        config.monitoring.prometheus_port = port;
    }
    if let Some(level) = args.log_level {
        config.monitoring.log_level = level;
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.monitoring.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if !config_found {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }
    tracing::info!("Starting broker with config: {:?}", config);

    let store = RedisStore::connect(&config.store).await?;
    let broker = Broker::new(config.clone(), Arc::new(store))?;

    // Start metrics server
    let metrics = broker.metrics();
    let metrics_port = config.monitoring.prometheus_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt");
        }
        on_signal.cancel();
    });

    // Run broker
    broker.run(cancel).await?;

    Ok(())
}

async fn start_metrics_server(metrics: Arc<BrokerMetrics>, port: u16) -> anyhow::Result<()> {
    async fn metrics_handler(
        State(metrics): State<Arc<BrokerMetrics>>,
    ) -> Result<String, (StatusCode, String)> {
        metrics
            .render()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
