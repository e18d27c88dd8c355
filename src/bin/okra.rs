//! okra CLI: operator interface to a Postgres-backed queue.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use okra::config::Config;
use okra::config::secrets::ExposeSecret;
use okra::db::{Db, PgStore};
use okra::model::{Attributes, Item, ItemId, Status};
use okra::scheduler::{Scheduler, SchedulerBuilder};
use okra::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "okra", about = "Lease-based work queue")]
struct Cli {
    /// TOML file with a [scheduler] table. Environment variables win over it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the schema and table for the configured collection
    Init,
    /// Schedule a new item
    Schedule {
        /// Seconds from now until the item is due
        #[arg(long, default_value_t = 0)]
        delay: u64,
        /// JSON object of attributes
        #[arg(long)]
        attrs: Option<String>,
    },
    /// Claim one due item and print it
    Peek,
    /// Claim one due item, delete it and print it
    Poll,
    /// Move an item back to pending
    Reschedule {
        /// Item ID
        id: String,
        /// Seconds from now until the item is due again
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },
    /// Delete an item
    Delete {
        /// Item ID
        id: String,
    },
    /// Count items by status
    Count {
        /// Only this status (pending | processing)
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let _guard = init_telemetry(
        TelemetryConfig::new("okra").endpoint(config.otel_endpoint.clone()),
        &config.log_level,
    )?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    let okra = SchedulerBuilder::new()
        .backend(db)
        .settings(&config.scheduler)
        .build()
        .await?;

    match cli.command {
        Command::Init => {
            println!("Collection ready: {}", okra.collection());
            Ok(())
        }
        Command::Schedule { delay, attrs } => cmd_schedule(&okra, delay, attrs).await,
        Command::Peek => print_claimed(okra.peek().await?),
        Command::Poll => print_claimed(okra.poll().await?),
        Command::Reschedule { id, delay } => cmd_reschedule(&okra, &id, delay).await,
        Command::Delete { id } => {
            let item = Item {
                id: Some(id.parse::<ItemId>()?),
                ..Item::default()
            };
            okra.delete(&item).await?;
            println!("Deleted: {id}");
            Ok(())
        }
        Command::Count { status } => cmd_count(&okra, status).await,
    }
}

async fn cmd_schedule(
    okra: &Scheduler<PgStore>,
    delay: u64,
    attrs: Option<String>,
) -> anyhow::Result<()> {
    let attributes: Attributes = match attrs {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| anyhow::anyhow!("--attrs must be a JSON object: {e}"))?,
        None => Attributes::new(),
    };

    let mut item = Item::due_in(Duration::from_secs(delay))?;
    item.attributes = attributes;
    okra.schedule(&mut item).await?;

    let id = item.id.map(|id| id.to_string()).unwrap_or_default();
    let run_date = item.run_date.map(|d| d.to_rfc3339()).unwrap_or_default();
    println!("Scheduled: {id} (due {run_date})");
    Ok(())
}

async fn cmd_reschedule(okra: &Scheduler<PgStore>, id: &str, delay: u64) -> anyhow::Result<()> {
    let mut item = Item::due_in(Duration::from_secs(delay))?;
    item.id = Some(id.parse()?);

    match okra.reschedule(&item).await? {
        Some(item) => print_item(&item),
        None => anyhow::bail!("no item with id {id}"),
    }
}

async fn cmd_count(okra: &Scheduler<PgStore>, status: Option<String>) -> anyhow::Result<()> {
    let statuses = match status {
        Some(s) => vec![s.parse::<Status>()?],
        None => Status::ALL.to_vec(),
    };

    for status in statuses {
        println!("{:<12}{}", status, okra.count_by_status(status).await?);
    }
    Ok(())
}

fn print_claimed(item: Option<Item>) -> anyhow::Result<()> {
    match item {
        Some(item) => print_item(&item),
        None => {
            println!("No item due.");
            Ok(())
        }
    }
}

fn print_item(item: &Item) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}
