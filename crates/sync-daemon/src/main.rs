//! taskflow-sync: headless host for the taskflow sync core.
//!
//! Keeps projects in a local data directory and syncs them with a shared
//! directory that plays the part of the remote repository.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use taskflow_sync_core::{
    LocalStore, Mutation, RemoteRepository, SyncCoordinator, SyncDirection, SyncEvent, Task,
};
use taskflow_sync_daemon::config::CONFIG_FILE;
use taskflow_sync_daemon::{DaemonConfig, DirectoryRemote, FileLocalStore, RemoteChange, RemoteWatcher};

#[derive(Parser, Debug)]
#[command(name = "taskflow-sync")]
#[command(about = "Offline-first taskflow sync host")]
struct Args {
    /// JSON config file (defaults to <data-dir>/daemon.json)
    #[arg(long, env = "TASKFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Local data directory
    #[arg(long, env = "TASKFLOW_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Shared directory used as the remote repository
    #[arg(long, env = "TASKFLOW_REMOTE_DIR", global = true)]
    remote_dir: Option<PathBuf>,

    /// Signed-in user; without one, changes stay local
    #[arg(short, long, env = "TASKFLOW_USER", global = true)]
    user: Option<String>,

    /// Active project
    #[arg(short, long, env = "TASKFLOW_PROJECT", global = true)]
    project: Option<String>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show local projects, pending changes and the action queue
    Status,
    /// Reconcile offline work with the remote once, then exit
    Sync {
        #[arg(long, value_enum, default_value_t = Direction::Both)]
        direction: Direction,
    },
    /// Stay running: follow remote changes and autosave until Ctrl+C
    Watch,
    /// Create a project and make it active
    Create { name: String },
    /// Add a task to the active project
    AddTask { title: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Direction {
    Upload,
    Download,
    Both,
}

impl From<Direction> for SyncDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Upload => SyncDirection::Upload,
            Direction::Download => SyncDirection::Download,
            Direction::Both => SyncDirection::Both,
        }
    }
}

/// Daemon state holding all components.
struct Daemon {
    config: DaemonConfig,
    coordinator: Arc<SyncCoordinator>,
    remote: Arc<DirectoryRemote>,
}

impl Daemon {
    async fn open(config: DaemonConfig) -> Result<Self> {
        let remote = Arc::new(DirectoryRemote::new(config.remote_dir.clone()));
        let local = Arc::new(FileLocalStore::new(config.data_dir.clone()));
        let coordinator = SyncCoordinator::new(
            config.sync.clone(),
            Arc::clone(&remote) as Arc<dyn RemoteRepository>,
            local as Arc<dyn LocalStore>,
        )?;

        coordinator.set_user(config.user_id.clone());
        let loaded = coordinator
            .load_from_local()
            .await
            .with_context(|| format!("loading {}", config.data_dir.display()))?;
        debug!("Restored {} project(s)", loaded);

        if let Some(project_id) = &config.active_project {
            coordinator.set_active_project(Some(project_id.clone()));
        }

        Ok(Self {
            config,
            coordinator,
            remote,
        })
    }

    fn require_user(&self) -> Result<String> {
        match &self.config.user_id {
            Some(user) => Ok(user.clone()),
            None => bail!("no user configured (use --user or TASKFLOW_USER)"),
        }
    }

    fn print_status(&self) {
        let projects = self.coordinator.snapshot();
        let active = self.coordinator.active_project_id();
        println!("{} project(s)", projects.len());
        for project in &projects {
            let marker = if active.as_deref() == Some(project.id.as_str()) { "*" } else { " " };
            println!(
                "{} {} \"{}\" tasks={} connections={} v{} {:?}{}",
                marker,
                project.id,
                project.name,
                project.live_task_count(),
                project.connections.len(),
                project.version,
                project.sync_source,
                if project.pending_sync { " (pending)" } else { "" },
            );
            let conflicts = self.coordinator.conflicts(&project.id);
            if !conflicts.is_empty() {
                println!("    {} unresolved conflict(s)", conflicts.len());
            }
        }

        let queue = self.coordinator.queue();
        println!(
            "queue: {} pending, {} dead-lettered{}",
            queue.queue_size(),
            queue.dead_letters().len(),
            if queue.is_frozen() { ", frozen" } else { "" }
        );
        for entry in queue.entries() {
            println!(
                "  {:?} {:?} {} (project {}, attempt {})",
                entry.action, entry.entity_type, entry.entity_id, entry.project_id, entry.retry_count
            );
        }
    }

    /// One reconnect pass: merge offline work into the cloud copies, then
    /// replay the queue and pull anything newer.
    async fn sync_once(&self, direction: SyncDirection) -> Result<()> {
        let user = self.require_user()?;

        let cloud = self.remote.load_projects_from_cloud(&user, true).await?;
        let offline = self.coordinator.snapshot();
        let reconnect = self
            .coordinator
            .merge_offline_data_on_reconnect(cloud, offline, &user)
            .await?;
        info!(
            "Reconnect: {} uploaded, {} merged, {} conflict(s), {} failed",
            reconnect.synced_count,
            reconnect.merged_count,
            reconnect.conflict_count,
            reconnect.failed.len()
        );

        let manual = self.coordinator.trigger_manual_sync(direction).await?;
        info!("Manual sync: {} uploaded", manual.uploaded);
        if let Some(download) = &manual.download {
            info!(
                "Downloaded {} project(s), merged {}, kept {} local-only",
                download.downloaded,
                download.merged,
                download.kept_local.len()
            );
        }

        self.coordinator.autosave_tick().await;
        Ok(())
    }

    async fn on_remote_change(&self, user: &str, change: RemoteChange) {
        let active = self.coordinator.active_project_id();
        let result = match change {
            RemoteChange::Project { project_id, removed: false }
                if active.as_deref() == Some(project_id.as_str()) =>
            {
                self.coordinator.perform_delta_sync(&project_id).await.map(|outcome| {
                    debug!(
                        "Delta sync on {}: {} task and {} connection change(s)",
                        project_id, outcome.task_changes, outcome.connection_changes
                    );
                })
            }
            change => {
                debug!("Remote change {:?}; refreshing project list", change);
                self.coordinator.download_and_merge(user).await.map(|_| ())
            }
        };
        if let Err(e) = result {
            warn!("Failed to apply remote change: {}", e);
        }
    }

    async fn watch(&self) -> Result<()> {
        let user = self.require_user()?;

        let report = self
            .coordinator
            .start_background_sync(&user, self.config.active_project.as_deref())
            .await?;
        if report.active_project_lost {
            warn!("Active project is gone from the remote");
        }

        let autosave = self.coordinator.spawn_autosave(self.config.sync.autosave_interval);
        let mut watcher = RemoteWatcher::new(
            self.config.remote_dir.clone(),
            Duration::from_millis(self.config.watch_debounce_ms),
        )?;
        info!("Watching {}", watcher.root().display());
        info!("Daemon running. Press Ctrl+C to stop.");

        loop {
            tokio::select! {
                Some(change) = watcher.event_rx().recv() => {
                    self.on_remote_change(&user, change).await;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        autosave.abort();
        let state = self.coordinator.persist_active_project().await;
        self.coordinator.autosave_tick().await;
        info!("Shutting down (last persist: {:?})", state);
        Ok(())
    }

    async fn create_project(&self, name: String) -> Result<()> {
        let project_id = uuid::Uuid::new_v4().to_string();
        self.coordinator.set_active_project(Some(project_id.clone()));
        self.coordinator.submit_mutation(Mutation::CreateProject {
            project_id: project_id.clone(),
            name,
        })?;
        let state = self.coordinator.persist_active_project().await;
        info!("Created {} ({:?})", project_id, state);
        println!("{project_id}");
        Ok(())
    }

    async fn add_task(&self, title: String) -> Result<()> {
        let Some(project_id) = self.coordinator.active_project_id() else {
            bail!("no active project (use --project)");
        };
        let task = Task::new(uuid::Uuid::new_v4().to_string(), title, Utc::now());
        let task_id = task.id.clone();
        self.coordinator
            .submit_mutation(Mutation::CreateTask { project_id, task })?;
        let state = self.coordinator.persist_active_project().await;
        info!("Added task {} ({:?})", task_id, state);
        println!("{task_id}");
        Ok(())
    }
}

fn resolve_config(args: &Args) -> Result<DaemonConfig> {
    let path = match (&args.config, &args.data_dir) {
        (Some(path), _) => path.clone(),
        (None, Some(data_dir)) => data_dir.join(CONFIG_FILE),
        (None, None) => DaemonConfig::default().data_dir.join(CONFIG_FILE),
    };
    let mut config = DaemonConfig::load(&path)?;

    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(remote_dir) = &args.remote_dir {
        config.remote_dir = remote_dir.clone();
    }
    if args.user.is_some() {
        config.user_id = args.user.clone();
    }
    if args.project.is_some() {
        config.active_project = args.project.clone();
    }
    Ok(config)
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::ConflictDetected(conflict) => {
            warn!(
                "Conflict on {}: {}",
                conflict.project_id,
                conflict.conflicted_fields.join(", ")
            );
        }
        SyncEvent::ActionFailed { entity_id, error, .. } => {
            error!("Queued action for {} failed permanently: {}", entity_id, error);
        }
        SyncEvent::QueuePressure { queue_size, dead_letters, frozen } => {
            warn!(
                "Action queue under pressure: {} pending, {} dead-lettered, frozen={}",
                queue_size, dead_letters, frozen
            );
        }
        SyncEvent::LocalOnlyProjectRetained { project_id, task_count } => {
            warn!("Kept local-only project {} ({} tasks)", project_id, task_count);
        }
        SyncEvent::Notification { level, message } => {
            info!("[{:?}] {}", level, message);
        }
        other => debug!("{:?}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,taskflow_sync_core=debug,taskflow_sync_daemon=debug"
    } else {
        "info,taskflow_sync_core=info,taskflow_sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = resolve_config(&args)?;
    debug!("Data dir: {:?}, remote dir: {:?}", config.data_dir, config.remote_dir);

    let daemon = Daemon::open(config).await?;
    let _events = daemon.coordinator.subscribe(log_event);

    match args.command {
        Command::Status => daemon.print_status(),
        Command::Sync { direction } => daemon.sync_once(direction.into()).await?,
        Command::Watch => daemon.watch().await?,
        Command::Create { name } => daemon.create_project(name).await?,
        Command::AddTask { title } => daemon.add_task(title).await?,
    }
    Ok(())
}
