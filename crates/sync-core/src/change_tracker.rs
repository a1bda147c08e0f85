//! Per-entity dirty and field-lock bookkeeping.
//!
//! Field locks keep an in-progress edit from being overwritten by an incoming
//! merge. They are reference counted while the field is focused and linger
//! for `lock_ttl` after the last release. Every lock also has a hard ceiling
//! (`max_hold`) so an abandoned edit session cannot pin a field forever.
//!
//! The per-project diff records which entities and fields changed locally
//! since the last confirmed upload, so sync can send only what moved.

use crate::model::{Field, ProjectId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use web_time::Instant;

/// Default time a released lock keeps protecting its field.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);
/// Default ceiling for a lock that is never released.
pub const DEFAULT_MAX_HOLD: Duration = Duration::from_secs(300);

/// An entity inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum EntityRef {
    Task(String),
    Connection(String),
}

impl EntityRef {
    pub fn id(&self) -> &str {
        match self {
            EntityRef::Task(id) | EntityRef::Connection(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Accumulated local change to one entity.
#[derive(Debug, Clone)]
pub struct EntityChange {
    pub kind: ChangeKind,
    pub fields: BTreeSet<Field>,
    pub first_changed_at: Instant,
}

/// Local changes to one project since its last confirmed upload.
#[derive(Debug, Clone, Default)]
pub struct ProjectDiff {
    pub changes: BTreeMap<EntityRef, EntityChange>,
}

impl ProjectDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.changes.keys().any(|e| e.id() == entity_id)
    }

    pub fn entity_ids(&self) -> HashSet<String> {
        self.changes.keys().map(|e| e.id().to_string()).collect()
    }

    pub fn oldest_change(&self) -> Option<Instant> {
        self.changes.values().map(|c| c.first_changed_at).min()
    }

    /// Keep only the changes for the given entity ids.
    pub fn retain_entities(&mut self, ids: &HashSet<String>) {
        self.changes.retain(|entity, _| ids.contains(entity.id()));
    }

    fn record(&mut self, entity: EntityRef, kind: ChangeKind, fields: &[Field], at: Instant) {
        let existing_kind = self.changes.get(&entity).map(|c| c.kind);
        match (existing_kind, kind) {
            (None, _) => {
                self.changes.insert(
                    entity,
                    EntityChange {
                        kind,
                        fields: fields.iter().copied().collect(),
                        first_changed_at: at,
                    },
                );
            }
            // Never reached the remote: nothing to tell it.
            (Some(ChangeKind::Created), ChangeKind::Deleted) => {
                self.changes.remove(&entity);
            }
            (Some(ChangeKind::Deleted), ChangeKind::Updated) => {
                debug!("Ignoring update to deleted entity {}", entity.id());
            }
            (Some(previous), _) => {
                if let Some(existing) = self.changes.get_mut(&entity) {
                    existing.kind = match (previous, kind) {
                        (_, ChangeKind::Deleted) => ChangeKind::Deleted,
                        // Re-creating a deleted id is a restore.
                        (ChangeKind::Deleted, ChangeKind::Created) => ChangeKind::Updated,
                        (previous, _) => previous,
                    };
                    existing.fields.extend(fields.iter().copied());
                }
            }
        }
    }

    /// Fold another diff in, keeping the older first-change timestamps.
    fn absorb(&mut self, other: ProjectDiff) {
        for (entity, change) in other.changes {
            match self.changes.get_mut(&entity) {
                Some(existing) => {
                    existing.fields.extend(change.fields);
                    existing.first_changed_at = existing.first_changed_at.min(change.first_changed_at);
                    if change.kind == ChangeKind::Created && existing.kind == ChangeKind::Updated {
                        existing.kind = ChangeKind::Created;
                    }
                }
                None => {
                    self.changes.insert(entity, change);
                }
            }
        }
    }
}

/// A field currently protected from remote merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLock {
    pub entity_id: String,
    pub field: Field,
    pub project_id: ProjectId,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockKey {
    project_id: ProjectId,
    entity_id: String,
    field: Field,
}

#[derive(Debug, Clone)]
struct LockEntry {
    holders: u32,
    expires_at: Instant,
}

#[derive(Default)]
struct TrackerState {
    locks: HashMap<LockKey, LockEntry>,
    diffs: HashMap<ProjectId, ProjectDiff>,
}

/// Tracks dirty entities and field locks for every project.
pub struct ChangeTracker {
    state: Mutex<TrackerState>,
    lock_ttl: Duration,
    max_hold: Duration,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

impl ChangeTracker {
    pub fn new(lock_ttl: Duration) -> Self {
        Self::with_max_hold(lock_ttl, DEFAULT_MAX_HOLD)
    }

    pub fn with_max_hold(lock_ttl: Duration, max_hold: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            lock_ttl,
            max_hold: max_hold.max(lock_ttl),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Field locks ====================

    /// Protect `field` while the user edits it. Calls nest.
    pub fn lock_field(&self, entity_id: &str, project_id: &str, field: Field) {
        let key = LockKey {
            project_id: project_id.to_string(),
            entity_id: entity_id.to_string(),
            field,
        };
        let now = Instant::now();
        let mut state = self.state();
        let entry = state.locks.entry(key).or_insert(LockEntry {
            holders: 0,
            expires_at: now,
        });
        if entry.expires_at <= now {
            // Expired leftovers do not count as live holders.
            entry.holders = 0;
        }
        entry.holders += 1;
        entry.expires_at = now + self.max_hold;
    }

    /// Release one hold. The lock lingers for the TTL after the last release.
    pub fn unlock_field(&self, entity_id: &str, project_id: &str, field: Field) {
        let key = LockKey {
            project_id: project_id.to_string(),
            entity_id: entity_id.to_string(),
            field,
        };
        let mut state = self.state();
        if let Some(entry) = state.locks.get_mut(&key) {
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                entry.expires_at = Instant::now() + self.lock_ttl;
            }
        }
    }

    pub fn is_field_locked(&self, entity_id: &str, project_id: &str, field: Field) -> bool {
        let key = LockKey {
            project_id: project_id.to_string(),
            entity_id: entity_id.to_string(),
            field,
        };
        let now = Instant::now();
        self.state()
            .locks
            .get(&key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Live locks of a project, grouped by entity id.
    pub fn locked_fields(&self, project_id: &str) -> HashMap<String, BTreeSet<Field>> {
        let now = Instant::now();
        let mut locked: HashMap<String, BTreeSet<Field>> = HashMap::new();
        for (key, entry) in &self.state().locks {
            if key.project_id == project_id && entry.expires_at > now {
                locked
                    .entry(key.entity_id.clone())
                    .or_default()
                    .insert(key.field);
            }
        }
        locked
    }

    pub fn active_locks(&self) -> Vec<ChangeLock> {
        let now = Instant::now();
        self.state()
            .locks
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| ChangeLock {
                entity_id: key.entity_id.clone(),
                field: key.field,
                project_id: key.project_id.clone(),
                expires_at: entry.expires_at,
            })
            .collect()
    }

    /// Drop expired locks to prevent memory growth.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state();
        let before = state.locks.len();
        state.locks.retain(|_, entry| entry.expires_at > now);
        before - state.locks.len()
    }

    // ==================== Dirty tracking ====================

    pub fn track_create(&self, project_id: &str, entity: EntityRef, fields: &[Field]) {
        self.track(project_id, entity, ChangeKind::Created, fields);
    }

    pub fn track_update(&self, project_id: &str, entity: EntityRef, changed_fields: &[Field]) {
        if changed_fields.is_empty() {
            return;
        }
        self.track(project_id, entity, ChangeKind::Updated, changed_fields);
    }

    pub fn track_delete(&self, project_id: &str, entity: EntityRef) {
        self.track(project_id, entity, ChangeKind::Deleted, &[Field::DeletedAt]);
    }

    fn track(&self, project_id: &str, entity: EntityRef, kind: ChangeKind, fields: &[Field]) {
        let mut state = self.state();
        let diff = state.diffs.entry(project_id.to_string()).or_default();
        diff.record(entity, kind, fields, Instant::now());
        if diff.is_empty() {
            state.diffs.remove(project_id);
        }
    }

    pub fn has_pending_changes(&self, project_id: &str) -> bool {
        self.state()
            .diffs
            .get(project_id)
            .is_some_and(|d| !d.is_empty())
    }

    pub fn has_any_pending_changes(&self) -> bool {
        self.state().diffs.values().any(|d| !d.is_empty())
    }

    pub fn pending_entity_ids(&self, project_id: &str) -> HashSet<String> {
        self.state()
            .diffs
            .get(project_id)
            .map(ProjectDiff::entity_ids)
            .unwrap_or_default()
    }

    /// Copy of the current diff without clearing it.
    pub fn diff(&self, project_id: &str) -> ProjectDiff {
        self.state()
            .diffs
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove and return the diff, e.g. right before uploading it.
    pub fn take_diff(&self, project_id: &str) -> ProjectDiff {
        self.state().diffs.remove(project_id).unwrap_or_default()
    }

    /// Put back a diff whose upload did not go through.
    pub fn restore_diff(&self, project_id: &str, diff: ProjectDiff) {
        if diff.is_empty() {
            return;
        }
        let mut state = self.state();
        state
            .diffs
            .entry(project_id.to_string())
            .or_default()
            .absorb(diff);
    }

    pub fn clear_project(&self, project_id: &str) {
        self.state().diffs.remove(project_id);
    }

    /// Age of the oldest unsynced change, for one project or all of them.
    pub fn oldest_change_age(&self, project_id: Option<&str>) -> Option<Duration> {
        let state = self.state();
        let oldest = match project_id {
            Some(id) => state.diffs.get(id).and_then(ProjectDiff::oldest_change),
            None => state.diffs.values().filter_map(ProjectDiff::oldest_change).min(),
        };
        oldest.map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> EntityRef {
        EntityRef::Task(id.into())
    }

    #[test]
    fn test_lock_and_unlock_with_ttl() {
        let tracker = ChangeTracker::new(Duration::from_millis(30));

        tracker.lock_field("t1", "p1", Field::Content);
        assert!(tracker.is_field_locked("t1", "p1", Field::Content));
        assert!(!tracker.is_field_locked("t1", "p1", Field::Title));

        tracker.unlock_field("t1", "p1", Field::Content);
        // Still protected right after focus loss
        assert!(tracker.is_field_locked("t1", "p1", Field::Content));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!tracker.is_field_locked("t1", "p1", Field::Content));
    }

    #[test]
    fn test_nested_locks_need_matching_unlocks() {
        let tracker = ChangeTracker::new(Duration::from_millis(10));

        tracker.lock_field("t1", "p1", Field::Title);
        tracker.lock_field("t1", "p1", Field::Title);
        tracker.unlock_field("t1", "p1", Field::Title);

        std::thread::sleep(Duration::from_millis(30));
        assert!(tracker.is_field_locked("t1", "p1", Field::Title));

        tracker.unlock_field("t1", "p1", Field::Title);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!tracker.is_field_locked("t1", "p1", Field::Title));
    }

    #[test]
    fn test_abandoned_lock_expires_at_max_hold() {
        let tracker =
            ChangeTracker::with_max_hold(Duration::from_millis(5), Duration::from_millis(20));

        tracker.lock_field("t1", "p1", Field::Content);
        std::thread::sleep(Duration::from_millis(40));

        assert!(!tracker.is_field_locked("t1", "p1", Field::Content));
        assert_eq!(tracker.cleanup_expired(), 1);
    }

    #[test]
    fn test_locked_fields_grouped_by_entity() {
        let tracker = ChangeTracker::default();
        tracker.lock_field("t1", "p1", Field::Content);
        tracker.lock_field("t1", "p1", Field::Title);
        tracker.lock_field("t2", "p2", Field::Title);

        let locked = tracker.locked_fields("p1");
        assert_eq!(locked.len(), 1);
        assert_eq!(locked["t1"].len(), 2);
    }

    #[test]
    fn test_create_then_delete_cancels_out() {
        let tracker = ChangeTracker::default();
        tracker.track_create("p1", task("t1"), &[Field::Title]);
        assert!(tracker.has_pending_changes("p1"));

        tracker.track_delete("p1", task("t1"));
        assert!(!tracker.has_pending_changes("p1"));
    }

    #[test]
    fn test_update_after_create_stays_create() {
        let tracker = ChangeTracker::default();
        tracker.track_create("p1", task("t1"), &[Field::Title]);
        tracker.track_update("p1", task("t1"), &[Field::Content]);

        let diff = tracker.diff("p1");
        let change = &diff.changes[&task("t1")];
        assert_eq!(change.kind, ChangeKind::Created);
        assert!(change.fields.contains(&Field::Content));
    }

    #[test]
    fn test_update_with_no_fields_is_ignored() {
        let tracker = ChangeTracker::default();
        tracker.track_update("p1", task("t1"), &[]);
        assert!(!tracker.has_pending_changes("p1"));
    }

    #[test]
    fn test_take_and_restore_diff() {
        let tracker = ChangeTracker::default();
        tracker.track_update("p1", task("t1"), &[Field::Title]);

        let diff = tracker.take_diff("p1");
        assert_eq!(diff.len(), 1);
        assert!(!tracker.has_pending_changes("p1"));

        tracker.track_update("p1", task("t2"), &[Field::Stage]);
        tracker.restore_diff("p1", diff);

        let ids = tracker.pending_entity_ids("p1");
        assert!(ids.contains("t1"));
        assert!(ids.contains("t2"));
    }

    #[test]
    fn test_oldest_change_age() {
        let tracker = ChangeTracker::default();
        assert!(tracker.oldest_change_age(None).is_none());

        tracker.track_update("p1", task("t1"), &[Field::Title]);
        std::thread::sleep(Duration::from_millis(15));
        tracker.track_update("p2", task("t2"), &[Field::Title]);

        let all = tracker.oldest_change_age(None).unwrap();
        let p2 = tracker.oldest_change_age(Some("p2")).unwrap();
        assert!(all >= Duration::from_millis(15));
        assert!(p2 < all);
    }
}
