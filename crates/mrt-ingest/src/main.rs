//! Merritt Ingest - operator CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mrt_common::logging::{init_logging, LogConfig, LogLevel};
use mrt_common::types::{BatchId, Identifier, JobId};
use mrt_ingest::config::IngestConfig;
use mrt_ingest::handler::Handlers;
use mrt_ingest::manager::IngestManager;
use mrt_ingest::queue::ItemStatus;
use mrt_ingest::state::{Digest, IngestRequest, JobState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mrt-ingest")]
#[command(author, version, about = "Merritt ingest queue and batch tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to ./mrt-ingest.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a batch described by a JSON list of jobs
    Submit {
        /// Profile ID
        #[arg(short, long)]
        profile: String,

        /// JSON file holding an array of job descriptions
        #[arg(short, long)]
        jobs: PathBuf,

        #[arg(short, long)]
        label: Option<String>,

        #[arg(long)]
        submitter: Option<String>,

        /// Queue priority (0 is most urgent); defaults to the profile's
        #[arg(long)]
        priority: Option<u8>,
    },

    /// Claim and process queued jobs
    Consume {
        /// Stop after this many items
        #[arg(short, long)]
        max: Option<usize>,
    },

    /// Inspect or manage queue items
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Freeze the ingest queue, or one collection
    Freeze {
        #[arg(long)]
        collection: Option<String>,
    },

    /// Thaw the ingest queue, or one collection
    Thaw {
        #[arg(long)]
        collection: Option<String>,
    },

    /// Show a batch, or queue and freeze state when no batch is given
    Status { batch: Option<String> },

    /// Mark a failed job resolved
    Resolve {
        batch: String,
        job: String,
        #[arg(short, long)]
        note: String,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// List items in queue order
    List,
    Hold { item: String },
    Release { item: String },
    /// Move an item back to pending
    Requeue {
        #[arg(long, value_enum)]
        from: RequeueFrom,
        item: String,
    },
    /// Delete an item, naming the state it is expected to be in
    Delete {
        #[arg(long, value_enum)]
        from: DeleteFrom,
        item: String,
    },
    /// Remove all completed or deleted items
    Cleanup {
        #[arg(long, value_enum, default_value = "completed")]
        status: CleanupStatus,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RequeueFrom {
    Fail,
    Consume,
    Complete,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DeleteFrom {
    Fail,
    Consume,
    Complete,
    Pending,
    Held,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CleanupStatus {
    Completed,
    Deleted,
}

/// One entry of the `submit --jobs` file
#[derive(Deserialize, Debug)]
struct JobEntry {
    package_name: String,
    package_size: Option<u64>,
    digest: Option<Digest>,
    primary_id: Option<String>,
    local_id: Option<String>,
    title: Option<String>,
    creator: Option<String>,
    date: Option<String>,
    note: Option<String>,
}

impl JobEntry {
    fn into_job(self, profile_id: &str) -> JobState {
        let mut job = JobState::new(JobId::generate(), profile_id);
        job.package_name = Some(self.package_name);
        job.package_size = self.package_size;
        job.digest = self.digest;
        job.primary_id = self.primary_id.map(Identifier::global);
        job.local_ids = self.local_id.map(Identifier::local).into_iter().collect();
        job.dublin_core.title = self.title;
        job.dublin_core.creator = self.creator;
        job.dublin_core.date = self.date;
        job.dublin_core.note = self.note;
        job
    }
}

#[derive(Serialize)]
struct ItemRow {
    id: String,
    priority: u8,
    status: ItemStatus,
    prior_status: Option<ItemStatus>,
    bytes: usize,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("mrt-ingest".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().context("Invalid logging environment")?;
    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::load_from(cli.config.as_deref())?;
    let manager = IngestManager::from_config(&config, Handlers::with_builtins())?;

    if let Err(e) = run(cli.command, &manager).await {
        error!(error = %format!("{:#}", e), "Command failed");
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, manager: &IngestManager) -> Result<()> {
    match command {
        Command::Submit {
            profile,
            jobs,
            label,
            submitter,
            priority,
        } => {
            let content = std::fs::read_to_string(&jobs)
                .with_context(|| format!("Failed to read job list {}", jobs.display()))?;
            let entries: Vec<JobEntry> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse job list {}", jobs.display()))?;
            let jobs = entries.into_iter().map(|e| e.into_job(&profile)).collect();

            let mut request = IngestRequest::new(profile, PathBuf::new());
            request.label = label;
            request.submitter = submitter;
            request.priority = priority;

            let submission = manager.submit_batch(request, jobs).await?;
            info!(batch_id = %submission.batch_id, jobs = submission.jobs, "Batch submitted");
            print_json(&submission)?;
        },

        Command::Consume { max } => {
            let mut processed = 0usize;
            while max.is_none_or(|m| processed < m) {
                match manager.process_next().await {
                    Ok(Some(item)) => {
                        processed += 1;
                        println!("{} {} {}", item.item_id, item.job.job_id, item.job.status());
                        if let Some(batch) = item.concluded {
                            println!(
                                "batch {} {} {}",
                                batch.batch_id,
                                batch.status(),
                                batch.status_message().unwrap_or("")
                            );
                        }
                    },
                    Ok(None) => break,
                    Err(e) if e.is_retryable() => return Err(e.into()),
                    Err(e) => {
                        processed += 1;
                        error!(error = %e, "Item failed");
                    },
                }
            }
            info!(processed, "Consumer finished");
        },

        Command::Queue { action } => queue_action(action, manager).await?,

        Command::Freeze { collection } => {
            let changed = match collection.as_deref() {
                Some(name) => manager.locks().freeze_collection(name).await?,
                None => manager.locks().freeze().await?,
            };
            println!("{}", if changed { "frozen" } else { "already frozen" });
        },

        Command::Thaw { collection } => {
            let changed = match collection.as_deref() {
                Some(name) => manager.locks().thaw_collection(name).await?,
                None => manager.locks().thaw().await?,
            };
            println!("{}", if changed { "thawed" } else { "not frozen" });
        },

        Command::Status { batch: Some(batch) } => {
            let batch_id: BatchId = batch.parse()?;
            print_json(&manager.batch_status(&batch_id).await?)?;
        },

        Command::Status { batch: None } => {
            let summary = manager.queue().summary().await?;
            print_json(&serde_json::json!({
                "queue": manager.queue().path(),
                "items": summary,
                "frozen": manager.locks().is_frozen().await?,
                "frozen_collections": manager.locks().frozen_collections().await?,
            }))?;
        },

        Command::Resolve { batch, job, note } => {
            let batch_id: BatchId = batch.parse()?;
            let job_id: JobId = job.parse()?;
            let job = manager.resolve_job(&batch_id, &job_id, &note).await?;
            println!("{} {}", job.job_id, job.status());
        },
    }
    Ok(())
}

async fn queue_action(action: QueueAction, manager: &IngestManager) -> Result<()> {
    let queue = manager.queue();
    match action {
        QueueAction::List => {
            let rows: Vec<ItemRow> = queue
                .list_ordered()
                .await?
                .into_iter()
                .map(|item| ItemRow {
                    bytes: item.payload.len(),
                    id: item.id,
                    priority: item.priority,
                    status: item.status,
                    prior_status: item.prior_status,
                })
                .collect();
            print_json(&rows)?;
        },
        QueueAction::Hold { item } => {
            queue.hold(&item).await?;
            println!("{} held", item);
        },
        QueueAction::Release { item } => {
            queue.release(&item).await?;
            println!("{} released", item);
        },
        QueueAction::Requeue { from, item } => {
            match from {
                RequeueFrom::Fail => queue.requeue_from_fail(&item).await?,
                RequeueFrom::Consume => queue.requeue_from_consume(&item).await?,
                RequeueFrom::Complete => queue.requeue_from_complete(&item).await?,
            };
            println!("{} requeued", item);
        },
        QueueAction::Delete { from, item } => {
            let record = match from {
                DeleteFrom::Fail => queue.delete_from_fail(&item).await?,
                DeleteFrom::Consume => queue.delete_from_consume(&item).await?,
                DeleteFrom::Complete => queue.delete_from_complete(&item).await?,
                DeleteFrom::Pending => queue.delete_from_pending(&item).await?,
                DeleteFrom::Held => queue.delete_from_held(&item).await?,
            };
            print_json(&record)?;
        },
        QueueAction::Cleanup { status } => {
            let status = match status {
                CleanupStatus::Completed => ItemStatus::Completed,
                CleanupStatus::Deleted => ItemStatus::Deleted,
            };
            let removed = queue.cleanup(status).await?;
            println!("removed {} {} item(s)", removed, status);
        },
    }
    Ok(())
}
