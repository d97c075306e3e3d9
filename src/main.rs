use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use weft_config::EngineConfig;
use weft_history::{EventLog, InstanceId, SqliteEventLog};

mod demo;

/// Weft - a durable workflow engine
#[derive(Parser)]
#[command(name = "weft")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the SQLite history database (default: ~/.weft/weft.db)
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  /// Log filter used when RUST_LOG is not set
  #[arg(long, global = true, default_value = "info")]
  log_level: String,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the recorded history of a workflow run as JSON
  History {
    workflow_id: String,
    run_id: String,
  },

  /// Run the built-in order workflow end to end
  Demo {
    /// Engine configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.as_str().into()),
    )
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();

  let db = match cli.db {
    Some(db) => db,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".weft")
      .join("weft.db"),
  };

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Some(Commands::History {
      workflow_id,
      run_id,
    }) => rt.block_on(print_history(db, InstanceId::new(workflow_id, run_id))),
    Some(Commands::Demo { config }) => rt.block_on(run_demo(db, config)),
    None => {
      println!("weft - use --help to see available commands");
      Ok(())
    }
  }
}

async fn open_log(db: &Path) -> Result<SqliteEventLog> {
  if let Some(dir) = db.parent() {
    tokio::fs::create_dir_all(dir)
      .await
      .with_context(|| format!("failed to create directory: {}", dir.display()))?;
  }
  SqliteEventLog::open(db)
    .await
    .with_context(|| format!("failed to open history database: {}", db.display()))
}

async fn print_history(db: PathBuf, id: InstanceId) -> Result<()> {
  let log = open_log(&db).await?;
  let events = log
    .read_all(&id)
    .await
    .with_context(|| format!("failed to read history of {id}"))?;
  if events.is_empty() {
    anyhow::bail!("no history recorded for {id}");
  }

  println!("{}", serde_json::to_string_pretty(&events)?);
  Ok(())
}

async fn run_demo(db: PathBuf, config: Option<PathBuf>) -> Result<()> {
  let config = match config {
    Some(path) => {
      let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
      EngineConfig::from_json(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?
    }
    None => EngineConfig::default(),
  };

  let log = Arc::new(open_log(&db).await?);
  let events = demo::run(log, config).await?;

  println!("{}", serde_json::to_string_pretty(&events)?);
  Ok(())
}
