//! Remote repository kept in a shared directory.
//!
//! Every device points at the same folder (a network mount, a synced
//! folder, a USB stick). Layout:
//! - `projects/<project id>.json` - one [`RemoteProjectRecord`] per project
//! - `meta.json` - the project list watermark
//!
//! Writes are serialized within one process; across processes the last
//! rename wins, which the version check in `apply_save` turns into an
//! ordinary version conflict on the next save.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use taskflow_sync_core::model::{Project, TaskId};
use taskflow_sync_core::remote::{
    Drift, PurgeOutcome, RemoteError, RemoteProjectRecord, RemoteRepository, Result, ResumeProbe,
    SaveOutcome,
};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

const PROJECTS_DIR: &str = "projects";
const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteMeta {
    list_seq: u64,
}

fn io_error(e: std::io::Error) -> RemoteError {
    RemoteError::Network(format!("shared directory unavailable: {e}"))
}

fn decode_error(e: serde_json::Error) -> RemoteError {
    RemoteError::Other(format!("corrupt remote record: {e}"))
}

pub struct DirectoryRemote {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirectoryRemote {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join(PROJECTS_DIR)
    }

    fn record_path(&self, project_id: &str) -> Result<PathBuf> {
        let valid = !project_id.is_empty()
            && project_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(RemoteError::Other(format!(
                "project id {project_id:?} cannot be stored in a shared directory"
            )));
        }
        Ok(self.projects_dir().join(format!("{project_id}.json")))
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let contents = serde_json::to_vec_pretty(value).map_err(decode_error)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).await.map_err(io_error)?;
        fs::rename(&tmp, path).await.map_err(io_error)
    }

    async fn read_record(&self, project_id: &str) -> Result<Option<RemoteProjectRecord>> {
        match fs::read(self.record_path(project_id)?).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(decode_error)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn write_record(&self, record: &RemoteProjectRecord) -> Result<()> {
        let path = self.record_path(&record.project.id)?;
        self.write_json(&path, record).await
    }

    /// Record for `project_id` if it exists and belongs to `user_id`.
    async fn owned_record(&self, project_id: &str, user_id: &str) -> Result<Option<RemoteProjectRecord>> {
        Ok(self
            .read_record(project_id)
            .await?
            .filter(|r| r.owner == user_id))
    }

    async fn read_meta(&self) -> Result<RemoteMeta> {
        match fs::read(self.root.join(META_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(decode_error),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RemoteMeta::default()),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn bump_list_seq(&self) -> Result<u64> {
        let mut meta = self.read_meta().await?;
        meta.list_seq += 1;
        self.write_json(&self.root.join(META_FILE), &meta).await?;
        Ok(meta.list_seq)
    }

    async fn all_records(&self) -> Result<Vec<RemoteProjectRecord>> {
        let mut records = Vec::new();
        let mut dir = match fs::read_dir(self.projects_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(io_error(e)),
        };
        while let Some(entry) = dir.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await.map_err(io_error)?;
            records.push(serde_json::from_slice(&bytes).map_err(decode_error)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl RemoteRepository for DirectoryRemote {
    async fn save_project_smart(&self, project: &Project, user_id: &str) -> Result<SaveOutcome> {
        project.validate().map_err(RemoteError::Validation)?;
        let _guard = self.write_lock.lock().await;

        match self.read_record(&project.id).await? {
            Some(mut record) => {
                if record.owner != user_id {
                    return Err(RemoteError::Permission(format!(
                        "{} is owned by another user",
                        project.id
                    )));
                }
                let outcome = record.apply_save(project, &HashSet::new());
                if outcome.success {
                    self.write_record(&record).await?;
                }
                Ok(outcome)
            }
            None => {
                let (record, outcome) = RemoteProjectRecord::create(user_id, project, &HashSet::new());
                self.write_record(&record).await?;
                self.bump_list_seq().await?;
                info!("Created {} in shared directory", project.id);
                Ok(outcome)
            }
        }
    }

    async fn load_projects_from_cloud(&self, user_id: &str, silent: bool) -> Result<Vec<Project>> {
        let projects: Vec<Project> = self
            .all_records()
            .await?
            .into_iter()
            .filter(|r| r.owner == user_id)
            .map(|r| r.project)
            .collect();
        if !silent {
            info!("Loaded {} project(s) from {}", projects.len(), self.root.display());
        }
        Ok(projects)
    }

    async fn load_single_project(&self, project_id: &str, user_id: &str) -> Result<Option<Project>> {
        Ok(self
            .owned_record(project_id, user_id)
            .await?
            .map(|r| r.project))
    }

    async fn get_tombstone_ids(&self, project_id: &str) -> Result<HashSet<String>> {
        Ok(self
            .read_record(project_id)
            .await?
            .map(|r| r.tombstones.into_iter().collect())
            .unwrap_or_default())
    }

    async fn delete_project_from_cloud(&self, project_id: &str, user_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.owned_record(project_id, user_id).await?.is_none() {
            return Ok(false);
        }
        fs::remove_file(self.record_path(project_id)?)
            .await
            .map_err(io_error)?;
        self.bump_list_seq().await?;
        info!("Deleted {} from shared directory", project_id);
        Ok(true)
    }

    async fn check_for_drift(&self, project_id: &str, watermark: u64) -> Result<Drift> {
        self.read_record(project_id)
            .await?
            .map(|r| r.drift_since(watermark))
            .ok_or_else(|| RemoteError::NotFound(project_id.to_string()))
    }

    async fn purge_tasks(&self, project_id: &str, task_ids: &[TaskId]) -> Result<PurgeOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .read_record(project_id)
            .await?
            .ok_or_else(|| RemoteError::NotFound(project_id.to_string()))?;
        let purged = record.purge(task_ids);
        self.write_record(&record).await?;
        debug!("Purged {} task(s) from {} at {}", purged, project_id, Utc::now());
        Ok(PurgeOutcome::Purged(purged))
    }

    async fn project_watermark(&self, project_id: &str, user_id: &str) -> Result<Option<u64>> {
        Ok(self
            .owned_record(project_id, user_id)
            .await?
            .map(|r| r.seq))
    }

    async fn project_list_watermark(&self, _user_id: &str) -> Result<u64> {
        Ok(self.read_meta().await?.list_seq)
    }

    async fn resume_probe(&self, user_id: &str, active_project_id: Option<&str>) -> Result<ResumeProbe> {
        let active_project_watermark = match active_project_id {
            Some(id) => self.project_watermark(id, user_id).await?,
            None => None,
        };
        Ok(ResumeProbe {
            active_project_watermark,
            project_list_watermark: self.read_meta().await?.list_seq,
            auxiliary_watermark: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_sync_core::model::{Entity, Field, Task};
    use tempfile::TempDir;

    const USER: &str = "user-1";

    fn project() -> Project {
        let mut project = Project::new("p1", "Plans", Utc::now());
        project.tasks.push(Task::new("t1", "One", Utc::now()));
        project.tasks.push(Task::new("t2", "Two", Utc::now()));
        project
    }

    #[tokio::test]
    async fn test_save_then_load_from_fresh_instance() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path().to_path_buf());
        let outcome = remote.save_project_smart(&project(), USER).await.unwrap();
        assert_eq!(outcome.new_version, Some(1));

        let other = DirectoryRemote::new(dir.path().to_path_buf());
        let loaded = other.load_projects_from_cloud(USER, true).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].tasks.len(), 2);
        assert_eq!(other.project_list_watermark(USER).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_save_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path().to_path_buf());
        let mut p = project();
        remote.save_project_smart(&p, USER).await.unwrap();
        p.version = 1;
        p.name = "Renamed".into();
        let second = remote.save_project_smart(&p, USER).await.unwrap();
        assert_eq!(second.new_version, Some(2));

        p.version = 1;
        let stale = remote.save_project_smart(&p, USER).await.unwrap();
        assert!(stale.conflict);
        assert_eq!(stale.remote_data.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_deleted_task_drifts_and_tombstones() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path().to_path_buf());
        let mut p = project();
        remote.save_project_smart(&p, USER).await.unwrap();
        let mark = remote.project_watermark("p1", USER).await.unwrap().unwrap();

        p.version = 1;
        let now = Utc::now();
        p.tasks[0].deleted_at = Some(now);
        p.tasks[0].touch(&[Field::DeletedAt], now);
        remote.save_project_smart(&p, USER).await.unwrap();

        let drift = remote.check_for_drift("p1", mark).await.unwrap();
        assert_eq!(drift.removed_task_ids, vec!["t1".to_string()]);
        assert!(remote.get_tombstone_ids("p1").await.unwrap().contains("t1"));
    }

    #[tokio::test]
    async fn test_other_users_projects_are_invisible() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path().to_path_buf());
        remote.save_project_smart(&project(), USER).await.unwrap();

        assert!(remote.load_projects_from_cloud("someone-else", true).await.unwrap().is_empty());
        assert_eq!(remote.project_watermark("p1", "someone-else").await.unwrap(), None);
        let denied = remote.save_project_smart(&project(), "someone-else").await;
        assert!(matches!(denied, Err(RemoteError::Permission(_))));
    }

    #[tokio::test]
    async fn test_unsafe_project_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path().to_path_buf());
        let mut p = project();
        p.id = "../escape".into();
        let result = remote.save_project_smart(&p, USER).await;
        assert!(matches!(result, Err(RemoteError::Other(_))));
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(dir.path().to_path_buf());
        remote.save_project_smart(&project(), USER).await.unwrap();

        let purged = remote.purge_tasks("p1", &["t2".to_string()]).await.unwrap();
        assert_eq!(purged, PurgeOutcome::Purged(1));

        assert!(remote.delete_project_from_cloud("p1", USER).await.unwrap());
        assert!(!remote.delete_project_from_cloud("p1", USER).await.unwrap());
        assert_eq!(remote.project_list_watermark(USER).await.unwrap(), 2);
    }
}
