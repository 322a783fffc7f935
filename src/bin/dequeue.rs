//! dequeue CLI: operator interface to a Postgres-backed queue.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dequeue::Queue;
use dequeue::config::Config;
use dequeue::config::secrets::ExposeSecret;
use dequeue::model::{ItemId, LeaseTimeout, PopOptions, PushOptions};
use dequeue::store::PgStore;
use dequeue::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "dequeue", about = "Persistent priority work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push a work item
    Push {
        /// JSON body; anything that is not valid JSON is pushed as a string
        body: String,
        /// Priority (higher = served first)
        #[arg(long)]
        priority: Option<i32>,
        /// Merge key; defaults to a hash of the body
        #[arg(long)]
        duplicate_key: Option<String>,
    },
    /// Lease the next item
    Pop {
        /// Lease duration in seconds, or "disabled"
        #[arg(long)]
        timeout: Option<String>,
    },
    /// Show the next eligible items without leasing them
    Peek {
        #[arg(long)]
        timeout: Option<String>,
    },
    /// Mark an item complete
    Complete { id: ItemId },
    /// Release a lease
    Unlock { id: ItemId },
    /// Extend a lease by SECONDS from now
    LockUntil { id: ItemId, seconds: u64 },
    /// Change an item's priority
    Priority {
        id: ItemId,
        #[command(subcommand)]
        change: PriorityChange,
    },
    /// Show one item
    Show { id: ItemId },
    /// Aggregate queue counts
    Stats,
    /// Delete completed items
    Cleanup,
    /// Delete every item
    Flush {
        /// Required; flushing cannot be undone
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum PriorityChange {
    /// Set to VALUE
    Set { value: i32 },
    /// Raise by STEP
    Raise {
        #[arg(default_value_t = 1)]
        step: i32,
    },
    /// Lower by STEP
    Lower {
        #[arg(default_value_t = 1)]
        step: i32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "dequeue".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let store = PgStore::connect(config.database_url.expose_secret(), config.max_connections).await?;
    store.migrate().await?;
    let queue = Queue::new(Arc::new(store), config.queue);

    match cli.command {
        Command::Push {
            body,
            priority,
            duplicate_key,
        } => cmd_push(&queue, body, priority, duplicate_key).await,
        Command::Pop { timeout } => cmd_pop(&queue, timeout).await,
        Command::Peek { timeout } => cmd_peek(&queue, timeout).await,
        Command::Complete { id } => {
            report(id, queue.complete(id).await?.map(|i| i.completecount), "completecount")
        }
        Command::Unlock { id } => report(id, queue.unlock(id).await?.map(|_| "unlocked"), "state"),
        Command::LockUntil { id, seconds } => {
            let item = queue.lock_until(id, Duration::from_secs(seconds)).await?;
            report(id, item.and_then(|i| i.locked_till), "locked till")
        }
        Command::Priority { id, change } => {
            let item = match change {
                PriorityChange::Set { value } => queue.change_item_priority(id, value).await?,
                PriorityChange::Raise { step } => queue.increase_item_priority_by(id, step).await?,
                PriorityChange::Lower { step } => queue.decrease_item_priority_by(id, step).await?,
            };
            report(id, item.map(|i| i.priority), "priority")
        }
        Command::Show { id } => {
            let item = queue.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&item)?);
            Ok(())
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&queue.stats().await?)?);
            Ok(())
        }
        Command::Cleanup => {
            println!("Removed {} completed item(s)", queue.cleanup().await?);
            Ok(())
        }
        Command::Flush { yes } => {
            if !yes {
                anyhow::bail!("refusing to flush without --yes");
            }
            queue.flush().await?;
            println!("Queue flushed");
            Ok(())
        }
    }
}

async fn cmd_push(
    queue: &Queue,
    body: String,
    priority: Option<i32>,
    duplicate_key: Option<String>,
) -> anyhow::Result<()> {
    let body: serde_json::Value =
        serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));

    let mut opts = PushOptions::new();
    if let Some(p) = priority {
        opts = opts.priority(p);
    }
    if let Some(key) = duplicate_key {
        opts = opts.duplicate_key(key);
    }

    let item = queue.push(&body, opts).await?;
    if item.count > 1 {
        println!("Merged: {} (count: {})", item.id, item.count);
    } else {
        println!("Inserted: {} (priority: {})", item.id, item.priority);
    }
    Ok(())
}

async fn cmd_pop(queue: &Queue, timeout: Option<String>) -> anyhow::Result<()> {
    match queue.pop(pop_options(timeout)?).await? {
        Some(popped) => println!(
            "{}\n{}",
            popped.id,
            serde_json::to_string_pretty(&popped.body)?
        ),
        None => println!("Queue is empty."),
    }
    Ok(())
}

async fn cmd_peek(queue: &Queue, timeout: Option<String>) -> anyhow::Result<()> {
    let items = queue.peek(pop_options(timeout)?).await?;
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{:<8}  {:<4}  {:<5}  {:<16}  BODY", "ID", "PRI", "COUNT", "INSERTED");
    println!("{}", "-".repeat(80));
    for item in &items {
        let body = item.body.to_string();
        let body_display = if body.len() > 40 {
            format!("{}…", body.chars().take(40).collect::<String>())
        } else {
            body
        };
        println!(
            "{:<8}  {:<4}  {:<5}  {:<16}  {}",
            item.id.short(),
            item.priority,
            item.count,
            item.inserted_at.format("%Y-%m-%d %H:%M"),
            body_display
        );
    }
    println!("\n{} item(s)", items.len());
    Ok(())
}

fn pop_options(timeout: Option<String>) -> anyhow::Result<PopOptions> {
    let mut opts = PopOptions::new();
    if let Some(raw) = timeout {
        opts = opts.timeout(LeaseTimeout::parse(&raw)?);
    }
    Ok(opts)
}

fn report<T: std::fmt::Display>(id: ItemId, value: Option<T>, label: &str) -> anyhow::Result<()> {
    match value {
        Some(v) => println!("{id}: {label} {v}"),
        None => println!("{id}: no matching item"),
    }
    Ok(())
}
