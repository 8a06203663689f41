use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use task_queue_client::TaskHandler;
use task_queue_core::store::{RedisStore, StoreConfig};
use task_queue_core::CancellationToken;
use task_queue_worker::{HandlerKind, LogHandler, SleepHandler, Worker, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tq-worker")]
#[command(about = "Priority task queue worker", long_about = None)]
struct Args {
    /// Queue identifier
    #[arg(short, long)]
    queue: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Task handler to run
    #[arg(long, value_enum)]
    handler: Option<Handler>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Handler {
    Log,
    Sleep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig {
            store: StoreConfig::from_env(),
            ..WorkerConfig::default()
        }
    };

    // Override with CLI args
    if let Some(queue) = args.queue {
        config.queue_id = queue;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }
    match args.handler {
        Some(Handler::Log) => config.handler = HandlerKind::Log,
        Some(Handler::Sleep) => config.handler = HandlerKind::Sleep,
        None => {}
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let handler: Arc<dyn TaskHandler> = match config.handler {
        HandlerKind::Log => Arc::new(LogHandler),
        HandlerKind::Sleep => Arc::new(SleepHandler::new(Duration::from_millis(config.sleep_ms))),
    };

    let store = RedisStore::connect(&config.store).await?;
    let worker = Arc::new(Worker::new(&config, Arc::new(store), handler));

    let cancel = CancellationToken::new();
    let mut running = tokio::spawn({
        let worker = worker.clone();
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    // Handle shutdown signals
    tokio::select! {
        joined = &mut running => return joined?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }
    cancel.cancel();

    let grace = config.graceful_shutdown_timeout();
    match tokio::time::timeout(grace, running).await {
        Ok(joined) => joined?,
        Err(_) => {
            tracing::warn!(
                "Worker {} did not stop within {:?}, abandoning running handlers",
                worker.worker_id(),
                grace
            );
            Ok(())
        }
    }
}
