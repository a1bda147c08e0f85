//! Remote repository boundary.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing, with failure injection
//! - `DirectoryRemote` (in sync-daemon) - JSON files in a shared directory
//!
//! Both keep per-project state in a [`RemoteProjectRecord`], which owns the
//! server-side rules: version checks, upsert-only writes, tombstones and the
//! change log behind watermarks.

use crate::action_queue::EntityType;
use crate::model::{
    Connection, ConnectionId, Entity, Field, Project, ProjectId, SyncSource, Task, TaskId,
    ValidationError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("Rejected invalid project: {0}")]
    Validation(ValidationError),

    #[error("Remote error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Result of a whole-project save. Partial failures are reported per entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOutcome {
    pub success: bool,
    pub new_version: Option<u64>,
    /// The remote holds a newer version than the one saved against.
    pub conflict: bool,
    /// Current remote copy, returned on conflict.
    pub remote_data: Option<Project>,
    pub failed_task_ids: Vec<TaskId>,
    pub failed_connection_ids: Vec<ConnectionId>,
}

impl SaveOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed_task_ids.is_empty() || !self.failed_connection_ids.is_empty()
    }
}

/// Task/connection changes since a watermark.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drift {
    pub tasks: Vec<Task>,
    pub connections: Vec<Connection>,
    /// Entities removed (tombstoned or purged) since the watermark.
    pub removed_task_ids: Vec<TaskId>,
    pub removed_connection_ids: Vec<ConnectionId>,
    pub watermark: u64,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
            && self.connections.is_empty()
            && self.removed_task_ids.is_empty()
            && self.removed_connection_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged(usize),
    /// Hard purge unavailable; the tasks were tombstoned instead.
    SoftDeleted(usize),
}

/// Everything a session start needs, in one round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeProbe {
    /// `None` when the active project is missing or not accessible.
    pub active_project_watermark: Option<u64>,
    pub project_list_watermark: u64,
    pub auxiliary_watermark: Option<u64>,
}

/// Network/storage boundary consumed by the coordinator.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    async fn save_project_smart(&self, project: &Project, user_id: &str) -> Result<SaveOutcome>;

    /// `silent` suppresses per-call logging for background refreshes.
    async fn load_projects_from_cloud(&self, user_id: &str, silent: bool) -> Result<Vec<Project>>;

    async fn load_single_project(&self, project_id: &str, user_id: &str)
    -> Result<Option<Project>>;

    async fn get_tombstone_ids(&self, project_id: &str) -> Result<HashSet<String>>;

    async fn delete_project_from_cloud(&self, project_id: &str, user_id: &str) -> Result<bool>;

    async fn check_for_drift(&self, project_id: &str, watermark: u64) -> Result<Drift>;

    async fn purge_tasks(&self, project_id: &str, task_ids: &[TaskId]) -> Result<PurgeOutcome>;

    /// `None` when the project is missing or not accessible to the user.
    async fn project_watermark(&self, project_id: &str, user_id: &str) -> Result<Option<u64>>;

    async fn project_list_watermark(&self, user_id: &str) -> Result<u64>;

    /// Composite session-start probe. Callers fall back to the individual
    /// watermark calls on `Unsupported`.
    async fn resume_probe(
        &self,
        _user_id: &str,
        _active_project_id: Option<&str>,
    ) -> Result<ResumeProbe> {
        Err(RemoteError::Unsupported("resume_probe"))
    }
}

/// One entry of the per-project change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub seq: u64,
    pub entity_type: EntityType,
    pub entity_id: String,
}

/// Server-side state of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProjectRecord {
    pub owner: String,
    pub project: Project,
    #[serde(default)]
    pub tombstones: BTreeSet<String>,
    #[serde(default)]
    pub changes: Vec<ChangeLogEntry>,
    /// Watermark: sequence number of the latest change.
    #[serde(default)]
    pub seq: u64,
}

impl RemoteProjectRecord {
    /// First upload of a project.
    pub fn create(
        owner: &str,
        incoming: &Project,
        rejected: &HashSet<String>,
    ) -> (Self, SaveOutcome) {
        let mut empty = incoming.clone();
        empty.tasks.clear();
        empty.connections.clear();
        empty.version = 0;
        let mut record = Self {
            owner: owner.to_string(),
            project: empty,
            tombstones: BTreeSet::new(),
            changes: Vec::new(),
            seq: 0,
        };
        let outcome = record.apply_save(incoming, rejected);
        (record, outcome)
    }

    fn log(&mut self, entity_type: EntityType, entity_id: &str) {
        self.seq += 1;
        self.changes.push(ChangeLogEntry {
            seq: self.seq,
            entity_type,
            entity_id: entity_id.to_string(),
        });
    }

    /// Apply a save of a project or of some of its entities.
    ///
    /// Writes are upserts keyed by entity id; entities absent from the
    /// incoming project are left alone, so replaying a save is a no-op.
    /// Entities saved with `deleted_at` move to the tombstone set.
    pub fn apply_save(&mut self, incoming: &Project, rejected: &HashSet<String>) -> SaveOutcome {
        if incoming.version < self.project.version {
            debug!(
                "Rejecting save of {} at v{} (remote v{})",
                incoming.id, incoming.version, self.project.version
            );
            return SaveOutcome {
                success: false,
                conflict: true,
                remote_data: Some(self.project.clone()),
                new_version: Some(self.project.version),
                ..Default::default()
            };
        }

        let mut outcome = SaveOutcome::default();
        let mut changed = false;

        for task in &incoming.tasks {
            if rejected.contains(&task.id) {
                outcome.failed_task_ids.push(task.id.clone());
                continue;
            }
            if self.tombstones.contains(&task.id) {
                continue;
            }
            if task.is_tombstone() {
                self.project.tasks.retain(|t| t.id != task.id);
                self.tombstones.insert(task.id.clone());
                self.log(EntityType::Task, &task.id);
                changed = true;
            } else if upsert(&mut self.project.tasks, task) {
                self.log(EntityType::Task, &task.id);
                changed = true;
            }
        }

        for conn in &incoming.connections {
            if rejected.contains(&conn.id) {
                outcome.failed_connection_ids.push(conn.id.clone());
                continue;
            }
            if self.tombstones.contains(&conn.id) {
                continue;
            }
            let endpoint_dead =
                self.tombstones.contains(&conn.source) || self.tombstones.contains(&conn.target);
            if conn.is_tombstone() || endpoint_dead {
                self.project.connections.retain(|c| c.id != conn.id);
                self.tombstones.insert(conn.id.clone());
                self.log(EntityType::Connection, &conn.id);
                changed = true;
            } else if upsert(&mut self.project.connections, conn) {
                self.log(EntityType::Connection, &conn.id);
                changed = true;
            }
        }

        if self.project.name != incoming.name {
            self.project.name = incoming.name.clone();
            changed = true;
        }

        if changed || self.project.version == 0 {
            self.project.version += 1;
        }
        self.project.updated_at = self.project.updated_at.max(incoming.updated_at);
        self.project.sync_source = SyncSource::Synced;
        self.project.pending_sync = false;

        outcome.success = true;
        outcome.new_version = Some(self.project.version);
        outcome
    }

    /// Changes with a sequence number above `watermark`.
    pub fn drift_since(&self, watermark: u64) -> Drift {
        let mut drift = Drift {
            watermark: self.seq,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for change in self.changes.iter().filter(|c| c.seq > watermark) {
            if !seen.insert((change.entity_type, change.entity_id.clone())) {
                continue;
            }
            match change.entity_type {
                EntityType::Task => match self.project.task(&change.entity_id) {
                    Some(task) => drift.tasks.push(task.clone()),
                    None => drift.removed_task_ids.push(change.entity_id.clone()),
                },
                EntityType::Connection => match self.project.connection(&change.entity_id) {
                    Some(conn) => drift.connections.push(conn.clone()),
                    None => drift.removed_connection_ids.push(change.entity_id.clone()),
                },
                EntityType::Project => {}
            }
        }
        drift
    }

    /// Hard-delete tasks and their connections. Purged ids stay tombstoned.
    pub fn purge(&mut self, task_ids: &[TaskId]) -> usize {
        let ids: HashSet<&str> = task_ids.iter().map(String::as_str).collect();
        let before = self.project.tasks.len();
        self.project.tasks.retain(|t| !ids.contains(t.id.as_str()));
        let purged = before - self.project.tasks.len();

        let dropped: Vec<ConnectionId> = self
            .project
            .connections
            .iter()
            .filter(|c| ids.contains(c.source.as_str()) || ids.contains(c.target.as_str()))
            .map(|c| c.id.clone())
            .collect();
        self.project
            .connections
            .retain(|c| !dropped.contains(&c.id));

        for id in task_ids {
            self.tombstones.insert(id.clone());
            self.log(EntityType::Task, id);
        }
        for id in &dropped {
            self.tombstones.insert(id.clone());
            self.log(EntityType::Connection, id);
        }
        if purged > 0 {
            self.project.version += 1;
        }
        purged
    }

    /// Soft-delete fallback: tombstone the tasks without a hard purge.
    pub fn soft_delete(&mut self, task_ids: &[TaskId], at: DateTime<Utc>) -> usize {
        let mut incoming = self.project.clone();
        let mut count = 0;
        for task in incoming.tasks.iter_mut().filter(|t| task_ids.contains(&t.id)) {
            task.deleted_at = Some(at);
            task.touch(&[Field::DeletedAt], at);
            count += 1;
        }
        self.apply_save(&incoming, &HashSet::new());
        count
    }
}

/// Insert or replace by id. Returns true if anything changed.
fn upsert<E: Entity + PartialEq>(entities: &mut Vec<E>, incoming: &E) -> bool {
    match entities.iter_mut().find(|e| e.id() == incoming.id()) {
        Some(existing) if existing == incoming => false,
        Some(existing) => {
            *existing = incoming.clone();
            true
        }
        None => {
            entities.push(incoming.clone());
            true
        }
    }
}

#[derive(Default)]
struct InMemoryRemoteState {
    records: HashMap<ProjectId, RemoteProjectRecord>,
    list_seq: u64,
    offline: bool,
    fail_next_saves: usize,
    rejected: HashSet<String>,
    inaccessible: HashSet<ProjectId>,
    deny_purge: bool,
    resume_probe: bool,
    save_calls: usize,
    last_saved: Option<Project>,
}

/// In-memory remote for testing.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<InMemoryRemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, InMemoryRemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every call fails with a network error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Fail the next `count` saves with a network error.
    pub fn fail_next_saves(&self, count: usize) {
        self.state().fail_next_saves = count;
    }

    /// Reject this task/connection id on every save (partial failure).
    pub fn reject_entity(&self, id: &str) {
        self.state().rejected.insert(id.to_string());
    }

    pub fn set_inaccessible(&self, project_id: &str, inaccessible: bool) {
        let mut state = self.state();
        if inaccessible {
            state.inaccessible.insert(project_id.to_string());
        } else {
            state.inaccessible.remove(project_id);
        }
    }

    pub fn deny_purge(&self, deny: bool) {
        self.state().deny_purge = deny;
    }

    pub fn enable_resume_probe(&self, enabled: bool) {
        self.state().resume_probe = enabled;
    }

    /// Seed a project as if another device had uploaded it.
    pub fn insert_project(&self, owner: &str, project: &Project) -> u64 {
        let mut state = self.state();
        let (record, outcome) = RemoteProjectRecord::create(owner, project, &HashSet::new());
        state.records.insert(project.id.clone(), record);
        state.list_seq += 1;
        outcome.new_version.unwrap_or(0)
    }

    /// Apply a save as if from another device, bypassing failure injection.
    pub fn apply_external_save(&self, project: &Project) -> Option<SaveOutcome> {
        let mut state = self.state();
        let record = state.records.get_mut(&project.id)?;
        Some(record.apply_save(project, &HashSet::new()))
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        self.state()
            .records
            .get(project_id)
            .map(|r| r.project.clone())
    }

    pub fn tombstones(&self, project_id: &str) -> HashSet<String> {
        self.state()
            .records
            .get(project_id)
            .map(|r| r.tombstones.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn save_calls(&self) -> usize {
        self.state().save_calls
    }

    /// The project as sent by the most recent save call.
    pub fn last_saved(&self) -> Option<Project> {
        self.state().last_saved.clone()
    }

    fn check_online(state: &InMemoryRemoteState) -> Result<()> {
        if state.offline {
            return Err(RemoteError::Network("remote unreachable".into()));
        }
        Ok(())
    }

    fn accessible<'a>(
        state: &'a InMemoryRemoteState,
        project_id: &str,
        user_id: &str,
    ) -> Option<&'a RemoteProjectRecord> {
        if state.inaccessible.contains(project_id) {
            return None;
        }
        state.records.get(project_id).filter(|r| r.owner == user_id)
    }
}

#[async_trait]
impl RemoteRepository for InMemoryRemote {
    async fn save_project_smart(&self, project: &Project, user_id: &str) -> Result<SaveOutcome> {
        let mut state = self.state();
        Self::check_online(&state)?;
        state.save_calls += 1;
        state.last_saved = Some(project.clone());
        if state.fail_next_saves > 0 {
            state.fail_next_saves -= 1;
            return Err(RemoteError::Network("connection reset".into()));
        }
        if state.inaccessible.contains(&project.id) {
            return Err(RemoteError::Permission(format!(
                "no write access to {}",
                project.id
            )));
        }
        project.validate().map_err(RemoteError::Validation)?;

        let rejected = state.rejected.clone();
        match state.records.get_mut(&project.id) {
            Some(record) => {
                if record.owner != user_id {
                    return Err(RemoteError::Permission(format!(
                        "{} is owned by another user",
                        project.id
                    )));
                }
                Ok(record.apply_save(project, &rejected))
            }
            None => {
                let (record, outcome) = RemoteProjectRecord::create(user_id, project, &rejected);
                state.records.insert(project.id.clone(), record);
                state.list_seq += 1;
                Ok(outcome)
            }
        }
    }

    async fn load_projects_from_cloud(&self, user_id: &str, silent: bool) -> Result<Vec<Project>> {
        let state = self.state();
        Self::check_online(&state)?;
        let projects: Vec<Project> = state
            .records
            .values()
            .filter(|r| r.owner == user_id && !state.inaccessible.contains(&r.project.id))
            .map(|r| r.project.clone())
            .collect();
        if !silent {
            debug!("Loaded {} project(s) for {}", projects.len(), user_id);
        }
        Ok(projects)
    }

    async fn load_single_project(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<Option<Project>> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(Self::accessible(&state, project_id, user_id).map(|r| r.project.clone()))
    }

    async fn get_tombstone_ids(&self, project_id: &str) -> Result<HashSet<String>> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(state
            .records
            .get(project_id)
            .map(|r| r.tombstones.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_project_from_cloud(&self, project_id: &str, user_id: &str) -> Result<bool> {
        let mut state = self.state();
        Self::check_online(&state)?;
        let owned = state
            .records
            .get(project_id)
            .is_some_and(|r| r.owner == user_id);
        if owned {
            state.records.remove(project_id);
            state.list_seq += 1;
        }
        Ok(owned)
    }

    async fn check_for_drift(&self, project_id: &str, watermark: u64) -> Result<Drift> {
        let state = self.state();
        Self::check_online(&state)?;
        state
            .records
            .get(project_id)
            .map(|r| r.drift_since(watermark))
            .ok_or_else(|| RemoteError::NotFound(project_id.to_string()))
    }

    async fn purge_tasks(&self, project_id: &str, task_ids: &[TaskId]) -> Result<PurgeOutcome> {
        let mut state = self.state();
        Self::check_online(&state)?;
        let deny = state.deny_purge;
        let record = state
            .records
            .get_mut(project_id)
            .ok_or_else(|| RemoteError::NotFound(project_id.to_string()))?;
        if deny {
            return Ok(PurgeOutcome::SoftDeleted(
                record.soft_delete(task_ids, Utc::now()),
            ));
        }
        Ok(PurgeOutcome::Purged(record.purge(task_ids)))
    }

    async fn project_watermark(&self, project_id: &str, user_id: &str) -> Result<Option<u64>> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(Self::accessible(&state, project_id, user_id).map(|r| r.seq))
    }

    async fn project_list_watermark(&self, _user_id: &str) -> Result<u64> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(state.list_seq)
    }

    async fn resume_probe(
        &self,
        user_id: &str,
        active_project_id: Option<&str>,
    ) -> Result<ResumeProbe> {
        let state = self.state();
        Self::check_online(&state)?;
        if !state.resume_probe {
            return Err(RemoteError::Unsupported("resume_probe"));
        }
        Ok(ResumeProbe {
            active_project_watermark: active_project_id
                .and_then(|id| Self::accessible(&state, id, user_id))
                .map(|r| r.seq),
            project_list_watermark: state.list_seq,
            auxiliary_watermark: None,
        })
    }
}
