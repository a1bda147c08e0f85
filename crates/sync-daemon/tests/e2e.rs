//! End-to-end tests for taskflow-sync-daemon.
//!
//! Two devices share one `DirectoryRemote` folder, each with its own
//! `FileLocalStore` data directory, and run the real coordinator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use taskflow_sync_core::{
    LocalStore, Mutation, PersistState, RemoteRepository, RetryPolicy, SyncConfig, SyncCoordinator,
    SyncDirection, SyncSource, Task, TaskPatch,
};
use taskflow_sync_daemon::{DirectoryRemote, FileLocalStore, RemoteChange, RemoteWatcher};
use tempfile::TempDir;
use tokio::time::timeout;

const USER: &str = "alice";

/// Long debounce so tests persist explicitly; retries without delay.
fn test_config() -> SyncConfig {
    SyncConfig {
        persist_debounce: Duration::from_secs(3600),
        retry: RetryPolicy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Open a device against the shared folder, restoring its data directory.
async fn open_device(shared: &Path, data: &Path) -> Arc<SyncCoordinator> {
    let remote = Arc::new(DirectoryRemote::new(shared.to_path_buf()));
    let local = Arc::new(FileLocalStore::new(data.to_path_buf()));
    let coordinator = SyncCoordinator::new(
        test_config(),
        remote as Arc<dyn RemoteRepository>,
        local as Arc<dyn LocalStore>,
    )
    .unwrap();
    coordinator.set_user(Some(USER.to_string()));
    coordinator.load_from_local().await.unwrap();
    coordinator
}

/// Create `project_id` with the given tasks on `device` and upload it.
async fn create_project(device: &SyncCoordinator, project_id: &str, tasks: &[&str]) {
    device.set_active_project(Some(project_id.to_string()));
    device
        .submit_mutation(Mutation::CreateProject {
            project_id: project_id.to_string(),
            name: "Launch".into(),
        })
        .unwrap();
    for id in tasks {
        device
            .submit_mutation(Mutation::CreateTask {
                project_id: project_id.to_string(),
                task: Task::new(*id, format!("Task {id}"), chrono::Utc::now()),
            })
            .unwrap();
    }
    assert_eq!(device.persist_active_project().await, PersistState::Confirmed);
}

fn rename_task(project_id: &str, task_id: &str, title: &str) -> Mutation {
    Mutation::UpdateTask {
        project_id: project_id.into(),
        task_id: task_id.into(),
        patch: TaskPatch {
            title: Some(title.into()),
            ..Default::default()
        },
    }
}

fn title_of(device: &SyncCoordinator, project_id: &str, task_id: &str) -> String {
    device
        .project(project_id)
        .and_then(|p| p.task(task_id).map(|t| t.title.clone()))
        .unwrap_or_default()
}

// ==================== Upload and download ====================

#[tokio::test]
async fn test_project_created_on_one_device_reaches_the_other() {
    let shared = TempDir::new().unwrap();
    let a_data = TempDir::new().unwrap();
    let b_data = TempDir::new().unwrap();

    let a = open_device(shared.path(), a_data.path()).await;
    create_project(&a, "p1", &["t1", "t2"]).await;
    assert!(!a.has_pending_local_changes());

    let b = open_device(shared.path(), b_data.path()).await;
    let report = b.download_and_merge(USER).await.unwrap();
    assert_eq!(report.downloaded, 1);

    let project = b.project("p1").unwrap();
    assert_eq!(project.live_task_count(), 2);
    assert_eq!(project.version, a.project("p1").unwrap().version);
    assert_eq!(project.sync_source, SyncSource::Synced);
}

#[tokio::test]
async fn test_other_users_projects_stay_private() {
    let shared = TempDir::new().unwrap();
    let a_data = TempDir::new().unwrap();
    let b_data = TempDir::new().unwrap();

    let a = open_device(shared.path(), a_data.path()).await;
    create_project(&a, "p1", &["t1"]).await;

    let b = open_device(shared.path(), b_data.path()).await;
    b.set_user(Some("bob".into()));
    let report = b.download_and_merge("bob").await.unwrap();
    assert_eq!(report.downloaded, 0);
    assert!(b.project("p1").is_none());
}

// ==================== Offline and reconnect ====================

#[tokio::test]
async fn test_offline_edit_converges_after_reconnect() {
    let shared = TempDir::new().unwrap();
    let a_data = TempDir::new().unwrap();
    let b_data = TempDir::new().unwrap();

    let a = open_device(shared.path(), a_data.path()).await;
    create_project(&a, "p1", &["t1", "t2"]).await;

    let b = open_device(shared.path(), b_data.path()).await;
    b.download_and_merge(USER).await.unwrap();
    b.set_active_project(Some("p1".into()));

    // A edits t1 without a connection
    a.set_online(false);
    a.submit_mutation(rename_task("p1", "t1", "Written on the train")).unwrap();
    assert_eq!(a.persist_active_project().await, PersistState::Failed);
    assert!(a.queue().queue_size() > 0);

    // Meanwhile B edits t2 and uploads
    b.submit_mutation(rename_task("p1", "t2", "Edited at the desk")).unwrap();
    assert_eq!(b.persist_active_project().await, PersistState::Confirmed);

    a.set_online(true);
    a.trigger_manual_sync(SyncDirection::Both).await.unwrap();
    assert!(!a.has_pending_local_changes());
    assert_eq!(title_of(&a, "p1", "t1"), "Written on the train");
    assert_eq!(title_of(&a, "p1", "t2"), "Edited at the desk");

    b.download_and_merge(USER).await.unwrap();
    assert_eq!(title_of(&b, "p1", "t1"), "Written on the train");
    assert_eq!(title_of(&b, "p1", "t2"), "Edited at the desk");
}

#[tokio::test]
async fn test_restart_restores_queue_and_replays() {
    let shared = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();

    {
        let device = open_device(shared.path(), data.path()).await;
        create_project(&device, "p1", &["t1"]).await;
        device.set_online(false);
        device.submit_mutation(rename_task("p1", "t1", "Queued")).unwrap();
        assert_eq!(device.persist_active_project().await, PersistState::Failed);
    }

    let device = open_device(shared.path(), data.path()).await;
    assert!(device.queue().queue_size() > 0);
    assert!(device.project("p1").unwrap().pending_sync);

    let report = device.replay_queue().await;
    assert!(report.processed > 0);
    assert_eq!(device.queue().queue_size(), 0);

    let remote = DirectoryRemote::new(shared.path().to_path_buf());
    let stored = remote.load_single_project("p1", USER).await.unwrap().unwrap();
    assert_eq!(stored.task("t1").unwrap().title, "Queued");
}

#[tokio::test]
async fn test_reconnect_uploads_project_created_offline() {
    let shared = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();

    let device = open_device(shared.path(), data.path()).await;
    device.set_online(false);
    device.set_active_project(Some("p1".into()));
    device
        .submit_mutation(Mutation::CreateProject {
            project_id: "p1".into(),
            name: "Offline plans".into(),
        })
        .unwrap();
    device.persist_active_project().await;
    device.set_online(true);

    let remote = DirectoryRemote::new(shared.path().to_path_buf());
    let cloud = remote.load_projects_from_cloud(USER, true).await.unwrap();
    assert!(cloud.is_empty());

    let report = device
        .merge_offline_data_on_reconnect(cloud, device.snapshot(), USER)
        .await
        .unwrap();
    assert_eq!(report.synced_count, 1);
    assert!(report.failed.is_empty());
    assert!(remote.load_single_project("p1", USER).await.unwrap().is_some());
}

// ==================== Deletion ====================

#[tokio::test]
async fn test_remote_delete_keeps_substantial_local_copy() {
    let shared = TempDir::new().unwrap();
    let a_data = TempDir::new().unwrap();
    let b_data = TempDir::new().unwrap();

    let a = open_device(shared.path(), a_data.path()).await;
    create_project(&a, "full", &["t1"]).await;
    create_project(&a, "empty", &[]).await;

    let b = open_device(shared.path(), b_data.path()).await;
    b.download_and_merge(USER).await.unwrap();
    assert!(b.project("full").is_some() && b.project("empty").is_some());

    assert!(a.delete_project("full").await.unwrap());
    assert!(a.delete_project("empty").await.unwrap());

    let report = b.download_and_merge(USER).await.unwrap();
    assert_eq!(report.kept_local, vec!["full".to_string()]);
    assert_eq!(report.removed, vec!["empty".to_string()]);
    assert_eq!(b.project("full").unwrap().sync_source, SyncSource::LocalOnly);
    assert!(b.project("empty").is_none());
}

// ==================== Watcher ====================

#[tokio::test]
async fn test_watcher_sees_upload_from_another_device() {
    let shared = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::create_dir_all(shared.path().join("projects")).unwrap();
    let mut watcher =
        RemoteWatcher::new(shared.path().to_path_buf(), Duration::from_millis(50)).unwrap();

    let device = open_device(shared.path(), data.path()).await;
    create_project(&device, "p1", &["t1"]).await;

    let seen = timeout(Duration::from_secs(5), async {
        while let Some(change) = watcher.event_rx().recv().await {
            if change
                == (RemoteChange::Project {
                    project_id: "p1".into(),
                    removed: false,
                })
            {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(seen, Ok(true));
}
