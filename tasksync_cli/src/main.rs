use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tasksync::timestamp::{parse_iso, to_iso};
use tasksync::{
    HttpRemote, HttpRemoteConfig, InMemoryRemote, RemoteClient, SyncOutcome, SyncTrigger,
    TaskPatch, TaskRecord, TaskSyncBuilder,
};

#[derive(Parser)]
#[command(name = "tasksync", version, about = "Offline-first task list with remote sync", long_about = None)]
struct Cli {
    /// Local replica location
    #[arg(long, env = "TASKSYNC_DATABASE_URL", default_value = "sqlite://tasks.db?mode=rwc")]
    database_url: String,

    /// User whose tasks are synced
    #[arg(long, env = "TASKSYNC_OWNER")]
    owner: String,

    /// Row API endpoint, e.g. https://cloud.appwrite.io/v1. Without it nothing is synced.
    #[arg(long, env = "TASKSYNC_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "TASKSYNC_PROJECT", default_value = "")]
    project: String,

    #[arg(long, env = "TASKSYNC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "TASKSYNC_DATABASE", default_value = "tasks")]
    database: String,

    #[arg(long, env = "TASKSYNC_TABLE", default_value = "tasks")]
    table: String,

    /// Remote request timeout in seconds
    #[arg(long, env = "TASKSYNC_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Keep edits local until `sync` is run
    #[arg(long)]
    no_sync: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task
    Add {
        title: String,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        priority: Option<String>,
        /// May be repeated
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// RFC 3339 due date
        #[arg(long)]
        due: Option<String>,
    },
    /// List active tasks
    List,
    /// Change fields of a task
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        priority: Option<String>,
    },
    /// Mark a task done
    Done { id: String },
    /// Delete a task
    Delete { id: String },
    /// Reconcile with the remote now
    Sync,
    /// Count edits not yet confirmed by the remote
    Pending,
}

fn build_remote(cli: &Cli) -> Result<(Arc<dyn RemoteClient>, bool), Box<dyn Error>> {
    let Some(endpoint) = &cli.endpoint else {
        log::warn!("TASKSYNC_ENDPOINT not set, working offline");
        return Ok((Arc::new(InMemoryRemote::new(&cli.owner)), false));
    };

    let mut config = HttpRemoteConfig::new(
        endpoint.clone(),
        cli.project.clone(),
        cli.database.clone(),
        cli.table.clone(),
        cli.owner.clone(),
    )
    .with_timeout(Duration::from_secs(cli.timeout));
    if let Some(key) = &cli.api_key {
        config = config.with_api_key(key.clone());
    }
    Ok((Arc::new(HttpRemote::new(config)?), true))
}

fn print_task(task: &TaskRecord) {
    let due = task
        .due_date
        .as_ref()
        .map(|at| format!(" due {}", to_iso(at)))
        .unwrap_or_default();
    let tags = if task.tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", task.tags.join(", "))
    };
    println!(
        "{}  {:<11} {:<6} {}{}{}",
        task.id, task.status, task.priority, task.title, tags, due
    );
}

fn print_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(report) => {
            println!(
                "synced: {} purged, {} pushed, {} created, {} pulled, {} conflicts",
                report.purged, report.pushed, report.created, report.pulled, report.conflicts
            );
            for failure in &report.failures {
                println!("  failed {} during {}: {}", failure.id, failure.phase, failure.message);
            }
        }
        SyncOutcome::Skipped => println!("a sync is already running"),
        SyncOutcome::Failed { error, .. } => println!("sync failed: {error}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let (remote, online) = build_remote(&cli)?;
    let trigger = if online && !cli.no_sync {
        SyncTrigger::Inline
    } else {
        SyncTrigger::Manual
    };

    let tasks = TaskSyncBuilder::new(&cli.database_url, &cli.owner)
        .sync_trigger(trigger)
        .build(remote)
        .await?;

    match cli.command {
        Commands::Add {
            title,
            description,
            priority,
            tags,
            due,
        } => {
            let mut patch = TaskPatch::new().title(title).tags(tags);
            if description.is_some() {
                patch = patch.description(description);
            }
            if let Some(priority) = priority {
                patch = patch.priority(priority);
            }
            if let Some(due) = due {
                patch = patch.due_date(Some(parse_iso(&due)?));
            }
            let task = tasks.save_task(patch).await?;
            print_task(&task);
        }
        Commands::List => {
            for task in tasks.fetch_tasks().await? {
                print_task(&task);
            }
        }
        Commands::Edit {
            id,
            title,
            description,
            status,
            priority,
        } => {
            if tasks.get_task(&id).await?.is_none() {
                return Err(format!("no task with id {id}").into());
            }
            let mut patch = TaskPatch::for_id(id);
            if let Some(title) = title {
                patch = patch.title(title);
            }
            if let Some(description) = description {
                // An empty value clears the description
                patch = patch.description(Some(description).filter(|d| !d.is_empty()));
            }
            if let Some(status) = status {
                patch = patch.status(status);
            }
            if let Some(priority) = priority {
                patch = patch.priority(priority);
            }
            let task = tasks.save_task(patch).await?;
            print_task(&task);
        }
        Commands::Done { id } => {
            if tasks.get_task(&id).await?.is_none() {
                return Err(format!("no task with id {id}").into());
            }
            let task = tasks.save_task(TaskPatch::for_id(id).status("done")).await?;
            print_task(&task);
        }
        Commands::Delete { id } => {
            if !tasks.delete_task(&id).await? {
                return Err(format!("no task with id {id}").into());
            }
            println!("deleted {id}");
        }
        Commands::Sync => {
            if !online {
                return Err("cannot sync without TASKSYNC_ENDPOINT".into());
            }
            print_outcome(&tasks.sync().await);
        }
        Commands::Pending => {
            println!("{}", tasks.pending_count().await?);
        }
    }

    tasks.shutdown().await?;
    Ok(())
}
