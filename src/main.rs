use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use duratask::blob_store::{BlobStore, FsBlobStore};
use duratask::config::AppConfig;
use duratask::providers::sqlite::SqliteProvider;
use duratask::providers::Provider;
use duratask::range_files::{self, DURABLE_EXAMPLE};
use duratask::{ActivityRegistry, Client, OrchestrationRegistry, OrchestrationStatus, Runtime, WaitError};

#[derive(Parser)]
#[command(name = "duratask")]
#[command(version, about = "Durable range-file orchestrations backed by SQLite", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file
    #[arg(short, long, default_value = "duratask.toml")]
    config: PathBuf,

    /// Override the SQLite database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Override the blob store root directory
    #[arg(long)]
    blob_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a DurableExample instance, run it to completion and print the blob names
    Run {
        /// Comma-separated ranges, e.g. "1-10,1-100"
        #[arg(short, long, default_value = "")]
        input: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Enqueue a DurableExample instance and print its id without running it
    Start {
        #[arg(short, long, default_value = "")]
        input: String,
    },
    /// Run dispatchers until Ctrl-C, processing any pending instances
    Serve,
    /// Print the status of an instance
    Status { instance: String },
    /// Print the recorded history of an instance as JSON lines
    History { instance: String },
    /// List known instance ids
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    duratask::logging::init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.storage.database = db;
    }
    if let Some(root) = cli.blob_root {
        config.blob_store.root = root;
    }

    let store = open_store(&config).await?;
    let client = Client::new(store.clone());

    match cli.command {
        Commands::Run { input, timeout_secs } => {
            let runtime = start_runtime(&config, store).await?;
            let instance = client.start_orchestration(DURABLE_EXAMPLE, input).await?;
            println!("instance: {instance}");
            let result = client
                .wait_for_orchestration(&instance, Duration::from_secs(timeout_secs))
                .await;
            runtime.shutdown(None).await;
            match result {
                Ok(status) => print_status(&status)?,
                Err(WaitError::Timeout) => bail!("instance {instance} did not finish within {timeout_secs}s"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Start { input } => {
            let instance = client.start_orchestration(DURABLE_EXAMPLE, input).await?;
            println!("{instance}");
        }
        Commands::Serve => {
            let runtime = start_runtime(&config, store).await?;
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            runtime.shutdown(Some(5000)).await;
        }
        Commands::Status { instance } => {
            let status = client.get_orchestration_status(&instance).await?;
            print_status(&status)?;
        }
        Commands::History { instance } => {
            for event in client.read_history(&instance).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::List => {
            for instance in client.list_instances().await? {
                println!("{instance}");
            }
        }
    }
    Ok(())
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Provider>> {
    if let Some(parent) = config.storage.database.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let url = config.storage.database_url();
    let store = SqliteProvider::new(&url)
        .await
        .with_context(|| format!("opening {url}"))?;
    Ok(Arc::new(store))
}

async fn start_runtime(config: &AppConfig, store: Arc<dyn Provider>) -> anyhow::Result<Arc<Runtime>> {
    let fs = FsBlobStore::new(&config.blob_store);
    tracing::info!(target: "duratask::cli", blob_dir = %fs.dir().display(), "Blob store ready");
    let blobs: Arc<dyn BlobStore> = Arc::new(fs);
    let activities = range_files::register_activities(ActivityRegistry::builder(), blobs).build();
    let orchestrations = range_files::register_orchestrations(OrchestrationRegistry::builder()).build();
    let runtime = Runtime::start_with_options(store, activities, orchestrations, config.runtime_options()?).await?;
    Ok(runtime)
}

fn print_status(status: &OrchestrationStatus) -> anyhow::Result<()> {
    match status {
        OrchestrationStatus::NotFound => bail!("instance not found"),
        OrchestrationStatus::Running => println!("status: running"),
        OrchestrationStatus::Completed { output } => {
            println!("status: completed");
            println!("{output}");
        }
        OrchestrationStatus::Failed { details } => bail!("orchestration failed: {details}"),
        OrchestrationStatus::Terminated { reason } => println!("status: terminated ({reason})"),
    }
    Ok(())
}
