use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use novel_store::sdk::{BackendState, Store, StoreConfig};
use novel_store::snapshot::Snapshot;
use novel_store::Collection;
use serde_json::Value;

#[derive(Parser)]
#[command(author, version, about = "Inspect and maintain a novel workspace", long_about = None)]
struct Cli {
    /// Overrides NOVEL_DATA_DIR.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Serve everything from the fallback store.
    #[arg(long)]
    no_primary: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Print every record of a collection
    List { collection: Collection },
    Get { collection: Collection, key: String },
    /// Add a record given as a JSON object
    Add { collection: Collection, record: String },
    /// Insert or replace a record given as a JSON object
    Update { collection: Collection, record: String },
    Del { collection: Collection, key: String },
    GetSetting { key: String },
    /// Store a setting; the value is parsed as JSON when possible
    SetSetting { key: String, value: String },
    /// Write the whole workspace as JSON to a file or stdout
    Export { out: Option<PathBuf> },
    /// Replace the collections present in an exported document
    Import { file: PathBuf },
    RestoreBackup,
    Search { query: String },
    /// Record a writing session for today
    RecordSession { words: u64, minutes: u64 },
    /// Daily stats for the last N days
    Stats {
        #[arg(default_value_t = 30)]
        days: i64,
    },
    /// Chapters with their scenes, in order
    Outline,
}

fn parse_record(raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw).context("record is not valid JSON")?;
    anyhow::ensure!(value.is_object(), "record must be a JSON object");
    Ok(value)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = StoreConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    config.disable_primary |= cli.no_primary;

    let store = Store::open(config)?;
    if let BackendState::Degraded { reason } = store.ready().await {
        eprintln!("warning: primary storage unavailable ({}), using fallback", reason);
    }

    match cli.command {
        Commands::List { collection } => {
            print_json(&store.get_all(collection).await?)?;
        }
        Commands::Get { collection, key } => {
            match store.get(collection, &collection.parse_key(&key)?).await? {
                Some(record) => print_json(&record)?,
                None => anyhow::bail!("no {} record with key {}", collection, key),
            }
        }
        Commands::Add { collection, record } => {
            print_json(&store.add(collection, parse_record(&record)?).await?)?;
        }
        Commands::Update { collection, record } => {
            print_json(&store.update(collection, parse_record(&record)?).await?)?;
        }
        Commands::Del { collection, key } => {
            store.delete(collection, &collection.parse_key(&key)?).await?;
            println!("OK");
        }
        Commands::GetSetting { key } => {
            print_json(&store.get_setting(&key, Value::Null).await?)?;
        }
        Commands::SetSetting { key, value } => {
            let val: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            store.set_setting(&key, val).await?;
            println!("OK");
        }
        Commands::Export { out } => {
            let snapshot = store.export_data().await?;
            let json = serde_json::to_string_pretty(&snapshot)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported {} records to {}", snapshot.record_count(), path.display());
                }
                None => println!("{}", json),
            }
        }
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let snapshot = Snapshot::from_json(&raw)?;
            store.import_data(&snapshot).await?;
            println!("Imported {} records", snapshot.record_count());
        }
        Commands::RestoreBackup => {
            if store.restore_from_backup().await? {
                println!("OK");
            } else {
                anyhow::bail!("no backup found");
            }
        }
        Commands::Search { query } => {
            for hit in store.search(&query).await? {
                println!("[{} {}] {} ({}): {}", hit.collection, hit.key, hit.title, hit.field, hit.snippet);
            }
        }
        Commands::RecordSession { words, minutes } => {
            print_json(&store.record_writing_session(words, minutes * 60).await?)?;
        }
        Commands::Stats { days } => {
            let stats = store.stats_for_period(days).await?;
            let words: u64 = stats.iter().map(|s| s.word_count).sum();
            for day in &stats {
                println!("{}  {:>6} words  {:>3} sessions", day.date, day.word_count, day.session_count);
            }
            println!("{} words over {} active days", words, stats.len());
        }
        Commands::Outline => {
            for chapter in store.chapters().await? {
                println!("{}. {}", chapter.order + 1, chapter.title);
                let Some(id) = chapter.id else { continue };
                for scene in store.scenes_by_chapter(id).await? {
                    println!("   - {}", scene.title);
                }
            }
        }
    }

    Ok(())
}
