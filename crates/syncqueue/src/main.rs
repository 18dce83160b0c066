//! `syncq` - CLI for syncqueue
//!
//! This binary queues writes, reports queue status and drains the queue
//! into a local document store.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::{Map, Value};

use syncqueue::cli::{Cli, Command, ConfigCommand, EnqueueCommand, ProgressCommand};
use syncqueue::progress::validate_entity_id;
use syncqueue::{
    init_logging, Config, ConnectivityHandle, DurableQueue, Error, FileDocumentStore,
    OnboardingProgress, OperationKind, ProgressStore, QueueStatus, SqliteStore,
};

/// Everything a queue-backed command needs.
#[derive(Debug)]
struct App {
    storage: Arc<SqliteStore>,
    documents: FileDocumentStore,
    queue: DurableQueue,
    online: bool,
}

impl App {
    async fn open(config: &Config, online: bool) -> anyhow::Result<Self> {
        let storage = Arc::new(
            SqliteStore::open(config.database_path()).context("failed to open queue database")?,
        );
        let documents = FileDocumentStore::new(config.documents_dir());
        let queue = DurableQueue::open(
            storage.clone(),
            Arc::new(ConnectivityHandle::new(online)),
            Arc::new(documents.clone()),
            config.queue_settings(),
        )
        .await;

        Ok(Self {
            storage,
            documents,
            queue,
            online,
        })
    }

    /// Run a pass now when online and wait for it, so a short-lived process
    /// does not exit mid-dispatch.
    async fn drain_if_online(&self) {
        if self.online {
            self.queue.process_queue().await;
            self.queue.wait_idle().await;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    let config = Config::load_from(cli.config.clone())?;
    let online = !cli.offline;

    match cli.command {
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
        Command::Enqueue(cmd) => {
            let app = App::open(&config, online).await?;
            handle_enqueue(&app, cmd).await
        }
        Command::Status(status_cmd) => {
            let app = App::open(&config, online).await?;
            print_status(&app.queue.status().await, status_cmd.json)
        }
        Command::Sync => {
            let app = App::open(&config, online).await?;
            handle_sync(&app).await
        }
        Command::Clear(clear_cmd) => {
            if !clear_cmd.yes {
                println!("This will drop every pending write.");
                println!("Use --yes to confirm.");
                return Ok(());
            }
            let app = App::open(&config, online).await?;
            let count = app.queue.status().await.item_count;
            app.queue.clear().await;
            println!("Cleared {count} pending writes.");
            Ok(())
        }
        Command::Progress(progress_cmd) => {
            let app = App::open(&config, online).await?;
            handle_progress(&app, progress_cmd).await
        }
    }
}

async fn handle_enqueue(app: &App, cmd: EnqueueCommand) -> anyhow::Result<()> {
    validate_entity_id(&cmd.entity)?;
    let kind = OperationKind::from(cmd.kind);

    let payload = match (kind, cmd.payload) {
        (OperationKind::ClearProgress, Some(_)) => bail!("clear writes take no payload"),
        (_, Some(text)) => {
            Some(serde_json::from_str::<Value>(&text).context("payload is not valid JSON")?)
        }
        (_, None) => None,
    };

    let id = app
        .queue
        .add_to_queue(kind, payload, cmd.entity.as_str(), cmd.max_retries)
        .await;
    println!("Queued {kind} for {} ({id})", cmd.entity);

    app.drain_if_online().await;
    print_status(&app.queue.status().await, false)
}

async fn handle_sync(app: &App) -> anyhow::Result<()> {
    match app.queue.force_sync().await {
        Ok(()) => {
            app.queue.wait_idle().await;
            print_status(&app.queue.status().await, false)
        }
        Err(Error::NoConnectivity) => {
            let status = app.queue.status().await;
            println!(
                "Offline: {} pending writes will sync when the network returns.",
                status.item_count
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn handle_progress(app: &App, cmd: ProgressCommand) -> anyhow::Result<()> {
    let store = ProgressStore::new(app.storage.clone(), app.queue.clone());

    match cmd {
        ProgressCommand::Save {
            entity,
            step,
            completed,
            profile,
        } => {
            let profile = match profile {
                Some(text) => serde_json::from_str::<Map<String, Value>>(&text)
                    .context("profile must be a JSON object")?,
                None => Map::new(),
            };
            let mut progress = OnboardingProgress {
                profile,
                current_step: step,
                completed_steps: Vec::new(),
            };
            for name in completed {
                progress.complete(name);
            }

            match store.save(&entity, &progress).await? {
                Some(id) => println!("Saved progress for {entity} ({id})"),
                None => println!("Identical progress for {entity} is already queued."),
            }
            app.drain_if_online().await;
        }
        ProgressCommand::Show { entity, remote } => {
            match store.load(&entity).await? {
                Some(progress) => println!("{}", serde_json::to_string_pretty(&progress)?),
                None => println!("No saved progress for {entity}."),
            }
            if remote {
                println!();
                println!("Remote document:");
                match app.documents.read(&entity).await? {
                    Some(document) => println!("{}", serde_json::to_string_pretty(&document)?),
                    None => println!("  (none)"),
                }
            }
        }
        ProgressCommand::Clear { entity } => {
            let id = store.clear(&entity).await?;
            println!("Cleared progress for {entity} ({id})");
            app.drain_if_online().await;
        }
    }
    Ok(())
}

fn print_status(status: &QueueStatus, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    println!("syncq status");
    println!("------------");
    println!("Pending writes:  {}", status.item_count);
    println!("Processing:      {}", status.is_processing);
    println!("Pending retries: {}", status.pending_retries);
    if let Some(oldest) = &status.oldest_item {
        println!(
            "Oldest:          {} {} (enqueued {}, {} failed attempts)",
            oldest.operation_kind,
            oldest.target_entity_id,
            oldest.enqueued_at.to_rfc3339(),
            oldest.retry_count
        );
    }
    if let Some(newest) = &status.newest_item {
        println!(
            "Newest:          {} {} (enqueued {})",
            newest.operation_kind,
            newest.target_entity_id,
            newest.enqueued_at.to_rfc3339()
        );
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Queue]");
                println!("  Max queue size:     {}", config.queue.max_queue_size);
                println!("  Default retries:    {}", config.queue.default_max_retries);
                println!(
                    "  Retry intervals:    {:?} ms",
                    config.queue.retry_intervals_ms
                );
                println!("  Storage key:        {}", config.queue.storage_key);
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!();
                println!("[Remote]");
                println!("  Documents dir:      {}", config.documents_dir().display());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
