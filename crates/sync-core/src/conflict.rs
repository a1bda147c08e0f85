//! Deterministic three-way merge of local and remote project state.
//!
//! Fields merge one at a time by last-writer-wins on their per-field
//! timestamps. Two rules override LWW:
//!
//! - An id in the tombstone set is dropped from the result outright, along
//!   with any connection touching a dropped task.
//! - A field locked by an in-progress local edit keeps its local value, and
//!   the divergence is recorded as a conflict.
//!
//! Conflicts are handed back as data for silent storage in a
//! [`ConflictStore`]; nothing here prompts the user.

use crate::events::ConflictEvent;
use crate::model::{Entity, Field, Project, ProjectId, SyncSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Local state the merge must respect.
#[derive(Debug, Clone, Default)]
pub struct MergeContext {
    /// entity id -> fields currently locked by an in-progress edit
    pub locked_fields: HashMap<String, BTreeSet<Field>>,
    /// Entities with tracked, unsynced local changes.
    pub pending_entities: HashSet<String>,
    /// When local and remote last agreed. Used to tell a local edit that
    /// simply has not been uploaded yet from a concurrent edit.
    pub base_synced_at: Option<DateTime<Utc>>,
}

impl MergeContext {
    fn is_locked(&self, entity_id: &str, field: Field) -> bool {
        self.locked_fields
            .get(entity_id)
            .is_some_and(|fields| fields.contains(&field))
    }

    fn has_local_claim(&self, entity_id: &str) -> bool {
        self.pending_entities.contains(entity_id)
            || self
                .locked_fields
                .get(entity_id)
                .is_some_and(|fields| !fields.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    /// Id was in the tombstone set.
    TombstoneDropped,
    /// Connection referenced a task that did not survive the merge.
    ConnectionDropped,
    /// Local-only entity kept because it has unsynced local work.
    LocalOnlyKept,
    /// Local-only entity removed; the remote deleted it.
    LocalOnlyRemoved,
    /// Locked field kept its local value over a different remote value.
    LockedFieldKept,
    /// An explicit restore cleared a tombstone.
    RestoreApplied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeIssue {
    pub kind: IssueKind,
    pub entity_id: String,
    #[serde(default)]
    pub field: Option<Field>,
}

impl MergeIssue {
    fn new(kind: IssueKind, entity_id: &str) -> Self {
        Self {
            kind,
            entity_id: entity_id.to_string(),
            field: None,
        }
    }
}

/// One field that both sides changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub entity_id: String,
    pub field: Field,
    pub local_value: Value,
    pub remote_value: Value,
    pub local_updated_at: DateTime<Utc>,
    pub remote_updated_at: DateTime<Utc>,
    /// Local value was kept because the field was locked.
    pub locked: bool,
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub project: Project,
    pub conflict_count: usize,
    pub issues: Vec<MergeIssue>,
    pub conflicts: Vec<FieldConflict>,
}

impl MergeResult {
    pub fn has_conflicts(&self) -> bool {
        self.conflict_count > 0
    }

    /// Distinct conflicted field names, sorted.
    pub fn conflicted_fields(&self) -> Vec<String> {
        conflicted_field_names(&self.conflicts)
    }
}

fn conflicted_field_names(conflicts: &[FieldConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|c| c.field.as_str().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Default)]
struct MergeAccumulator {
    issues: Vec<MergeIssue>,
    conflicts: Vec<FieldConflict>,
}

/// Merge one entity present on both sides.
fn merge_entity<E: Entity>(local: &E, remote: &E, ctx: &MergeContext, acc: &mut MergeAccumulator) -> E {
    let id = local.id();
    let mut merged = local.clone();

    for &field in E::fields() {
        if field == Field::DeletedAt {
            continue;
        }

        let local_at = local.field_updated_at(field);
        let remote_at = remote.field_updated_at(field);

        if local.field_eq(remote, field) {
            if remote_at > local_at {
                merged.field_timestamps_mut().insert(field, remote_at);
            }
            continue;
        }

        if ctx.is_locked(id, field) {
            debug!("Keeping locked field {}.{} over remote value", id, field);
            acc.issues.push(MergeIssue {
                field: Some(field),
                ..MergeIssue::new(IssueKind::LockedFieldKept, id)
            });
            acc.conflicts
                .push(field_conflict(local, remote, field, local_at, remote_at, true));
            continue;
        }

        if remote_at > local_at {
            merged.copy_field_from(remote, field);
        } else if remote_at == local_at {
            // Tie: remote wins so every device converges on the same value
            merged.copy_field_from(remote, field);
            acc.conflicts
                .push(field_conflict(local, remote, field, local_at, remote_at, false));
        } else {
            let remote_changed_since_base = ctx.base_synced_at.is_none_or(|base| remote_at > base);
            if remote_changed_since_base {
                acc.conflicts
                    .push(field_conflict(local, remote, field, local_at, remote_at, false));
            }
        }
    }

    merge_tombstone(local, remote, &mut merged, acc);

    let updated_at = local.updated_at().max(remote.updated_at());
    merged.set_updated_at(updated_at);
    merged
}

/// A tombstone on either side survives unless the other side carries an
/// explicit restore newer than the deletion.
fn merge_tombstone<E: Entity>(local: &E, remote: &E, merged: &mut E, acc: &mut MergeAccumulator) {
    let restored_after = |entity: &E, deleted: DateTime<Utc>| {
        entity.restored_at().is_some_and(|restored| restored > deleted)
    };

    match (local.deleted_at(), remote.deleted_at()) {
        (None, None) => {}
        (Some(_), Some(_)) => {}
        (Some(deleted), None) => {
            if restored_after(remote, deleted) {
                merged.copy_field_from(remote, Field::DeletedAt);
                acc.issues
                    .push(MergeIssue::new(IssueKind::RestoreApplied, local.id()));
            }
        }
        (None, Some(deleted)) => {
            if !restored_after(local, deleted) {
                merged.copy_field_from(remote, Field::DeletedAt);
            }
        }
    }
}

fn field_conflict<E: Entity>(
    local: &E,
    remote: &E,
    field: Field,
    local_at: DateTime<Utc>,
    remote_at: DateTime<Utc>,
    locked: bool,
) -> FieldConflict {
    FieldConflict {
        entity_id: local.id().to_string(),
        field,
        local_value: local.field_json(field),
        remote_value: remote.field_json(field),
        local_updated_at: local_at,
        remote_updated_at: remote_at,
        locked,
    }
}

/// Merge one entity collection. Local order first, then remote-only
/// entities in remote order.
fn merge_collection<E: Entity>(
    local: &[E],
    remote: &[E],
    tombstones: &HashSet<String>,
    ctx: &MergeContext,
    acc: &mut MergeAccumulator,
) -> Vec<E> {
    let remote_by_id: HashMap<&str, &E> = remote.iter().map(|e| (e.id(), e)).collect();
    let local_ids: HashSet<&str> = local.iter().map(|e| e.id()).collect();
    let mut merged = Vec::with_capacity(local.len().max(remote.len()));

    for entity in local {
        let id = entity.id();
        if tombstones.contains(id) {
            acc.issues
                .push(MergeIssue::new(IssueKind::TombstoneDropped, id));
            continue;
        }

        match remote_by_id.get(id) {
            Some(remote_entity) => merged.push(merge_entity(entity, remote_entity, ctx, acc)),
            None => {
                let unsynced = ctx
                    .base_synced_at
                    .is_none_or(|base| entity.updated_at() > base);
                let restored = entity.restored_at().is_some();
                if ctx.has_local_claim(id) || unsynced || restored {
                    acc.issues.push(MergeIssue::new(IssueKind::LocalOnlyKept, id));
                    merged.push(entity.clone());
                } else {
                    acc.issues
                        .push(MergeIssue::new(IssueKind::LocalOnlyRemoved, id));
                }
            }
        }
    }

    for entity in remote {
        let id = entity.id();
        if local_ids.contains(id) {
            continue;
        }
        if tombstones.contains(id) {
            acc.issues
                .push(MergeIssue::new(IssueKind::TombstoneDropped, id));
            continue;
        }
        merged.push(entity.clone());
    }

    merged
}

/// Merge `local` and `remote` into one project.
pub fn smart_merge(
    local: &Project,
    remote: &Project,
    tombstones: &HashSet<String>,
    ctx: &MergeContext,
) -> MergeResult {
    let mut acc = MergeAccumulator::default();

    let tasks = merge_collection(&local.tasks, &remote.tasks, tombstones, ctx, &mut acc);
    let mut connections = merge_collection(
        &local.connections,
        &remote.connections,
        tombstones,
        ctx,
        &mut acc,
    );

    let task_ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    connections.retain(|conn| {
        let keep = task_ids.contains(conn.source.as_str()) && task_ids.contains(conn.target.as_str());
        if !keep {
            acc.issues
                .push(MergeIssue::new(IssueKind::ConnectionDropped, &conn.id));
        }
        keep
    });

    let name = if remote.updated_at > local.updated_at {
        remote.name.clone()
    } else {
        local.name.clone()
    };

    let mut project = Project {
        id: local.id.clone(),
        name,
        tasks,
        connections,
        version: local.version.max(remote.version),
        updated_at: local.updated_at.max(remote.updated_at),
        sync_source: SyncSource::Synced,
        pending_sync: false,
    };
    project.pending_sync = !project.content_eq(remote);

    let conflict_count = acc.conflicts.len();
    if conflict_count > 0 {
        info!(
            "Merge of project {} found {} conflicting field(s)",
            project.id, conflict_count
        );
    }

    MergeResult {
        project,
        conflict_count,
        issues: acc.issues,
        conflicts: acc.conflicts,
    }
}

/// Divergence stored for later resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub project_id: ProjectId,
    pub local: Project,
    pub remote: Project,
    pub conflicted_fields: Vec<FieldConflict>,
    pub reason: String,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

impl ConflictRecord {
    /// Build a record from a merge. `None` when the merge found no conflicts.
    pub fn from_merge(
        local: &Project,
        remote: &Project,
        result: &MergeResult,
        reason: impl Into<String>,
    ) -> Option<Self> {
        if !result.has_conflicts() {
            return None;
        }
        Some(Self {
            id: Uuid::new_v4().to_string(),
            project_id: local.id.clone(),
            local: local.clone(),
            remote: remote.clone(),
            conflicted_fields: result.conflicts.clone(),
            reason: reason.into(),
            acknowledged: false,
            created_at: Utc::now(),
        })
    }

    pub fn field_names(&self) -> Vec<String> {
        conflicted_field_names(&self.conflicted_fields)
    }

    pub fn to_event(&self) -> ConflictEvent {
        ConflictEvent {
            project_id: self.project_id.clone(),
            record_id: self.id.clone(),
            conflicted_fields: self.field_names(),
            conflict_count: self.conflicted_fields.len(),
            reason: self.reason.clone(),
        }
    }
}

/// Silent in-memory store of conflict records.
#[derive(Default)]
pub struct ConflictStore {
    records: Mutex<Vec<ConflictRecord>>,
}

impl ConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<ConflictRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, record: ConflictRecord) -> String {
        let id = record.id.clone();
        self.records().push(record);
        id
    }

    /// Unacknowledged records for a project, oldest first.
    pub fn pending(&self, project_id: &str) -> Vec<ConflictRecord> {
        self.records()
            .iter()
            .filter(|r| r.project_id == project_id && !r.acknowledged)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ConflictRecord> {
        self.records().iter().find(|r| r.id == id).cloned()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        match self.records().iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Acknowledge every open record for a project. Returns how many.
    pub fn acknowledge_project(&self, project_id: &str) -> usize {
        let mut count = 0;
        for record in self
            .records()
            .iter_mut()
            .filter(|r| r.project_id == project_id && !r.acknowledged)
        {
            record.acknowledged = true;
            count += 1;
        }
        count
    }

    /// Remove and return all records for a project.
    pub fn take(&self, project_id: &str) -> Vec<ConflictRecord> {
        let mut records = self.records();
        let (taken, kept): (Vec<_>, Vec<_>) = records
            .drain(..)
            .partition(|r| r.project_id == project_id);
        *records = kept;
        taken
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionChoice {
    /// Keep local entirely; it will be uploaded over the remote.
    Local,
    /// Take remote entirely.
    Remote,
    /// Re-run the merge.
    Merge,
}

#[derive(Debug, Clone)]
pub struct ResolvedConflict {
    pub project: Project,
    /// Records cleared by this resolution.
    pub acknowledged: usize,
}

/// Resolves stored conflicts on request.
#[derive(Default)]
pub struct ConflictResolver {
    store: ConflictStore,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &ConflictStore {
        &self.store
    }

    pub fn resolve_conflict(
        &self,
        project_id: &str,
        choice: ResolutionChoice,
        local: &Project,
        remote: &Project,
        tombstones: &HashSet<String>,
        ctx: &MergeContext,
    ) -> ResolvedConflict {
        let version = local.version.max(remote.version);
        let project = match choice {
            ResolutionChoice::Local => Project {
                version,
                pending_sync: true,
                ..local.clone()
            },
            ResolutionChoice::Remote => Project {
                version,
                sync_source: SyncSource::Synced,
                pending_sync: false,
                ..remote.clone()
            },
            ResolutionChoice::Merge => smart_merge(local, remote, tombstones, ctx).project,
        };

        let acknowledged = self.store.acknowledge_project(project_id);
        info!(
            "Resolved conflicts on {} with {:?} ({} record(s))",
            project_id, choice, acknowledged
        );
        ResolvedConflict {
            project,
            acknowledged,
        }
    }
}
