use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use std::sync::Arc;
use task_queue_admin::{peek, queue_stats};
use task_queue_client::QueueClient;
use task_queue_core::store::{RedisStore, StoreConfig};
use task_queue_core::{CancellationToken, Payload, QueueKeys, Task};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "tq-admin")]
#[command(about = "Priority task queue admin CLI", long_about = None)]
struct Args {
    /// Queue identifier
    #[arg(short, long, default_value = "default")]
    queue: String,

    /// Redis host (defaults to REDIS_IP)
    #[arg(long)]
    host: Option<String>,

    /// Redis port (defaults to REDIS_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Output format (json, table, yaml)
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push a new task
    Push {
        /// Task ID (random if not provided)
        #[arg(long)]
        id: Option<String>,

        /// Priority, lower runs first
        #[arg(short = 'P', long, default_value = "0")]
        priority: f64,

        /// Hold the task back for this many seconds
        #[arg(long)]
        delay_secs: Option<i64>,

        /// JSON payload
        #[arg(short, long, default_value = "null")]
        data: String,
    },

    /// Show set and log sizes
    Stats,

    /// Show the tasks that will run next
    Peek {
        /// Number of tasks to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Show the delayed set instead of the ready set
        #[arg(long)]
        delayed: bool,
    },

    /// Acknowledge log entries so no consumer handles them again
    Ack {
        /// Log entry IDs
        #[arg(required = true)]
        entries: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut store_config = StoreConfig::from_env();
    if let Some(host) = args.host {
        store_config.host = host;
    }
    if let Some(port) = args.port {
        store_config.port = port;
    }
    let store = Arc::new(RedisStore::connect(&store_config).await?);
    let keys = QueueKeys::new(args.queue.as_str());

    match args.command {
        Commands::Push { id, priority, delay_secs, data } => {
            let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut task = Task::new(id, priority, Payload::from_json(data)?);
            if let Some(secs) = delay_secs {
                task = task.execute_after(Utc::now() + ChronoDuration::seconds(secs));
            }

            let client = QueueClient::new(store, &args.queue, "tq-admin");
            client.push_task(&task, &CancellationToken::new()).await?;

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&task)?),
                "yaml" => println!("{}", serde_yaml::to_string(&task)?),
                _ => println!("Task pushed: {}", task.id),
            }
        }

        Commands::Stats => {
            let stats = queue_stats(store.as_ref(), &keys).await?;

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&stats)?),
                "yaml" => println!("{}", serde_yaml::to_string(&stats)?),
                _ => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Key", "Size"]);
                    table.add_row(vec![keys.ready.clone(), stats.ready.to_string()]);
                    table.add_row(vec![keys.delayed.clone(), stats.delayed.to_string()]);
                    table.add_row(vec![keys.log.clone(), stats.log.to_string()]);
                    println!("{table}");
                }
            }
        }

        Commands::Ack { entries } => {
            let client = QueueClient::new(store, &args.queue, "tq-admin");
            let ids: Vec<&str> = entries.iter().map(String::as_str).collect();
            let acked = client.acknowledge(&ids).await?;
            println!("Acknowledged {} of {} entries", acked, ids.len());
        }

        Commands::Peek { limit, delayed } => {
            let peeked = peek(store.as_ref(), &keys, delayed, limit).await?;

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&peeked)?),
                "yaml" => println!("{}", serde_yaml::to_string(&peeked)?),
                _ => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["ID", "Priority", "Due", "Data"]);
                    for entry in peeked {
                        let due = entry.due.map(|d| d.to_rfc3339()).unwrap_or_default();
                        match entry.task {
                            Some(task) => table.add_row(vec![
                                task.id,
                                task.priority.to_string(),
                                due,
                                task.data.to_string(),
                            ]),
                            None => table.add_row(vec![
                                "<malformed>".to_string(),
                                entry.score.to_string(),
                                due,
                                entry.raw,
                            ]),
                        };
                    }
                    println!("{table}");
                }
            }
        }
    }

    Ok(())
}
