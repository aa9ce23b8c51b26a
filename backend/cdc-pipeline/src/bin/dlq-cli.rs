use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cdc_pipeline::dlq::{DeadLetterReplayer, DeadLetterStore};
use cdc_pipeline::models::FailedEvent;
use cdc_pipeline::stores::Stores;
use sqlx::PgPool;
use uuid::Uuid;

const DEFAULT_LIMIT: usize = 50;

fn usage() -> ! {
    eprintln!("Usage (DATABASE_URL must be set):");
    eprintln!("  dlq-cli stats");
    eprintln!("  dlq-cli list [limit]");
    eprintln!("  dlq-cli list-source <source_id> [limit]");
    eprintln!("  dlq-cli list-table <table_name> [limit]");
    eprintln!("  dlq-cli show <id>");
    eprintln!("  dlq-cli replay <id>");
    eprintln!("  dlq-cli replay-source <source_id> [limit]");
    eprintln!("  dlq-cli delete <id>");
    eprintln!("  dlq-cli cleanup");
    std::process::exit(1);
}

fn limit_arg(arg: Option<&String>) -> Result<usize> {
    match arg {
        Some(raw) => raw.parse().with_context(|| format!("invalid limit: {}", raw)),
        None => Ok(DEFAULT_LIMIT),
    }
}

fn print_entries(entries: &[FailedEvent]) {
    if entries.is_empty() {
        println!("No dead letters");
        return;
    }
    for entry in entries {
        println!(
            "{}  {}  {}  {:<10} retries={}  {}  {}",
            entry.id,
            entry.created_at.to_rfc3339(),
            entry.source_id,
            entry.error_class.as_str(),
            entry.retry_count,
            entry.table_name,
            entry.error_message
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
    }

    let db_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&db_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let stores = Stores::postgres(pool);
    let dead_letters: Arc<dyn DeadLetterStore> = stores.dead_letters.clone();

    match (args[1].as_str(), args.len()) {
        ("stats", 2) => {
            let stats = dead_letters.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        ("list", 2 | 3) => {
            let entries = dead_letters.read(limit_arg(args.get(2))?).await?;
            print_entries(&entries);
        }
        ("list-source", 3 | 4) => {
            let entries = dead_letters
                .read_by_source(&args[2], limit_arg(args.get(3))?)
                .await?;
            print_entries(&entries);
        }
        ("list-table", 3 | 4) => {
            let entries = dead_letters
                .read_by_table(&args[2], limit_arg(args.get(3))?)
                .await?;
            print_entries(&entries);
        }
        ("show", 3) => {
            let id = Uuid::parse_str(&args[2])?;
            match dead_letters.get(id).await? {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => bail!("dead letter {} not found", id),
            }
        }
        ("replay", 3) => {
            let id = Uuid::parse_str(&args[2])?;
            let replayer = DeadLetterReplayer::new(dead_letters, stores.buffer.clone());
            let sequence_id = replayer.replay(id).await?;
            println!("Replayed {} into buffer as sequence {}", id, sequence_id);
        }
        ("replay-source", 3 | 4) => {
            let replayer = DeadLetterReplayer::new(dead_letters, stores.buffer.clone());
            let count = replayer
                .replay_source(&args[2], limit_arg(args.get(3))?)
                .await?;
            println!("Replayed {} dead letters of {}", count, args[2]);
        }
        ("delete", 3) => {
            let id = Uuid::parse_str(&args[2])?;
            if dead_letters.delete(id).await? {
                println!("Deleted {}", id);
            } else {
                bail!("dead letter {} not found", id);
            }
        }
        ("cleanup", 2) => {
            let removed = dead_letters.cleanup().await?;
            println!("Removed {} expired dead letters", removed);
        }
        _ => {
            eprintln!("Invalid arguments");
            usage();
        }
    }

    Ok(())
}
