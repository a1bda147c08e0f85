//! Local store backed by JSON files under a data directory, using tokio::fs.
//!
//! Layout:
//! - `projects.json` - the full project list
//! - `queue.json` - pending and dead-lettered actions
//! - `watermarks.json` - remote cursors and merge bases
//!
//! Each write goes to a temporary file first and is renamed into place, so a
//! crash mid-write leaves the previous copy intact.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use taskflow_sync_core::action_queue::QueueSnapshot;
use taskflow_sync_core::local_store::{LocalStore, Result, Watermarks};
use taskflow_sync_core::model::Project;
use tokio::fs;
use tracing::debug;

const PROJECTS_FILE: &str = "projects.json";
const QUEUE_FILE: &str = "queue.json";
const WATERMARKS_FILE: &str = "watermarks.json";

/// File-backed local store for the daemon
pub struct FileLocalStore {
    base_path: PathBuf,
}

impl FileLocalStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    async fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        let contents = serde_json::to_vec_pretty(value)?;

        let target = self.full_path(name);
        let tmp = self.full_path(&format!(".{name}.tmp"));
        fs::write(&tmp, &contents).await?;
        fs::rename(&tmp, &target).await?;
        debug!("Wrote {} ({} bytes)", target.display(), contents.len());
        Ok(())
    }

    /// Read a JSON file, or the default when it does not exist yet.
    async fn read_json<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        match fs::read(self.full_path(name)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn save_projects(&self, projects: &[Project]) -> Result<()> {
        self.write_json(PROJECTS_FILE, projects).await
    }

    async fn load_projects(&self) -> Result<Vec<Project>> {
        self.read_json(PROJECTS_FILE).await
    }

    async fn save_queue(&self, queue: &QueueSnapshot) -> Result<()> {
        self.write_json(QUEUE_FILE, queue).await
    }

    async fn load_queue(&self) -> Result<QueueSnapshot> {
        self.read_json(QUEUE_FILE).await
    }

    async fn save_watermarks(&self, watermarks: &Watermarks) -> Result<()> {
        self.write_json(WATERMARKS_FILE, watermarks).await
    }

    async fn load_watermarks(&self) -> Result<Watermarks> {
        self.read_json(WATERMARKS_FILE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use taskflow_sync_core::action_queue::{ActionQueueEntry, ActionType, EntityType};
    use taskflow_sync_core::local_store::StoreError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_files_load_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileLocalStore::new(dir.path().join("data"));

        assert!(store.load_projects().await.unwrap().is_empty());
        assert!(store.load_queue().await.unwrap().entries.is_empty());
        assert_eq!(store.load_watermarks().await.unwrap(), Watermarks::default());
    }

    #[tokio::test]
    async fn test_state_survives_new_instance() {
        let dir = TempDir::new().unwrap();
        let project = Project::new("p1", "Plans", Utc::now());
        let entry = ActionQueueEntry::new(
            ActionType::Update,
            EntityType::Task,
            "t1",
            "p1",
            json!({ "title": "x" }),
        );

        {
            let store = FileLocalStore::new(dir.path().to_path_buf());
            store.save_projects(std::slice::from_ref(&project)).await.unwrap();
            store
                .save_queue(&QueueSnapshot {
                    entries: vec![entry.clone()],
                    dead_letters: Vec::new(),
                })
                .await
                .unwrap();
        }

        let store = FileLocalStore::new(dir.path().to_path_buf());
        assert_eq!(store.load_projects().await.unwrap(), vec![project]);
        let queue = store.load_queue().await.unwrap();
        assert_eq!(queue.entries.len(), 1);
        assert_eq!(queue.entries[0].id, entry.id);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = FileLocalStore::new(dir.path().to_path_buf());
        store.save_projects(&[]).await.unwrap();

        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec![PROJECTS_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_serialization_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PROJECTS_FILE), b"{not json").unwrap();
        let store = FileLocalStore::new(dir.path().to_path_buf());

        let result = store.load_projects().await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
