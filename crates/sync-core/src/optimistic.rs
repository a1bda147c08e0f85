//! Snapshot/commit/rollback envelope around UI-visible mutations.
//!
//! A snapshot is taken before shared state is mutated and ends in exactly
//! one of: committed, rolled back, discarded, superseded. A superseded
//! snapshot hands its pre-state to the snapshot that replaced it, so a
//! rollback still reaches the state before the first edit. Snapshots left open longer
//! than the bounded wait are committed, since the local copy is already
//! durable by then.

use crate::model::{Project, ProjectId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use web_time::Instant;

/// Default bounded wait before an open snapshot counts as committed.
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId(String);

impl SnapshotId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pre-mutation copy of a project.
#[derive(Debug, Clone)]
pub struct OptimisticSnapshot {
    pub id: SnapshotId,
    pub project_id: ProjectId,
    pub entity_id: String,
    pub label: String,
    pub state: Project,
    /// Creation order of the oldest edit this pre-state covers. Inherited
    /// on supersede; the smallest one among rolled back snapshots is the
    /// state to restore.
    pub base_seq: u64,
    pub created_at: Instant,
}

/// How a snapshot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Committed,
    RolledBack,
    Discarded,
    /// Replaced by a newer snapshot for the same operation, which took over
    /// its pre-state.
    Superseded,
    /// Open past the bounded wait; counted as committed.
    Expired,
}

/// Result of finishing an operation with stale-write protection.
#[derive(Debug, Clone)]
pub enum Resolution {
    Committed,
    /// Caller restores this state and re-renders.
    RolledBack(Project),
    /// Active project changed meanwhile; the result was thrown away.
    DiscardedStale,
    /// Snapshot was already finished (or never existed).
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub open: usize,
    pub committed: u64,
    pub rolled_back: u64,
    pub discarded: u64,
    pub superseded: u64,
    pub expired: u64,
}

#[derive(Default)]
struct ManagerState {
    open: HashMap<SnapshotId, OptimisticSnapshot>,
    /// (entity_id, label) -> open snapshot for that logical operation
    by_operation: HashMap<(String, String), SnapshotId>,
    stats: SnapshotStats,
    next_seq: u64,
}

impl ManagerState {
    fn finish(&mut self, id: &SnapshotId, outcome: SnapshotOutcome) -> Option<OptimisticSnapshot> {
        let snapshot = self.open.remove(id)?;
        let key = (snapshot.entity_id.clone(), snapshot.label.clone());
        if self.by_operation.get(&key) == Some(id) {
            self.by_operation.remove(&key);
        }
        match outcome {
            SnapshotOutcome::Committed => self.stats.committed += 1,
            SnapshotOutcome::RolledBack => self.stats.rolled_back += 1,
            SnapshotOutcome::Discarded => self.stats.discarded += 1,
            SnapshotOutcome::Superseded => self.stats.superseded += 1,
            SnapshotOutcome::Expired => self.stats.expired += 1,
        }
        Some(snapshot)
    }
}

pub struct OptimisticStateManager {
    state: Mutex<ManagerState>,
    timeout: Duration,
}

impl Default for OptimisticStateManager {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_TIMEOUT)
    }
}

impl OptimisticStateManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            timeout,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Capture `project` before it is mutated.
    ///
    /// Only one snapshot is trusted per logical operation (`entity_id` +
    /// `label`). An older open one is superseded and its pre-state carried
    /// over, since the edit it guarded is still applied.
    pub fn create_snapshot(&self, project: &Project, entity_id: &str, label: &str) -> SnapshotId {
        let id = SnapshotId::generate();
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;

        let mut snapshot = OptimisticSnapshot {
            id: id.clone(),
            project_id: project.id.clone(),
            entity_id: entity_id.to_string(),
            label: label.to_string(),
            state: project.clone(),
            base_seq: seq,
            created_at: Instant::now(),
        };

        let key = (entity_id.to_string(), label.to_string());
        if let Some(previous) = state.by_operation.insert(key, id.clone()) {
            if let Some(older) = state.finish(&previous, SnapshotOutcome::Superseded) {
                debug!("Superseded snapshot {} for {} ({})", previous, entity_id, label);
                if older.project_id == snapshot.project_id {
                    snapshot.state = older.state;
                    snapshot.base_seq = older.base_seq;
                }
            }
        }
        state.open.insert(id.clone(), snapshot);
        id
    }

    /// Mutation accepted; drop the retained pre-state.
    pub fn commit(&self, id: &SnapshotId) -> bool {
        self.state().finish(id, SnapshotOutcome::Committed).is_some()
    }

    /// Mutation rejected; returns the pre-mutation state to restore.
    pub fn rollback(&self, id: &SnapshotId) -> Option<Project> {
        self.state()
            .finish(id, SnapshotOutcome::RolledBack)
            .map(|s| s.state)
    }

    /// Mutation turned out to change nothing; no revert should be shown.
    pub fn discard(&self, id: &SnapshotId) -> bool {
        self.state().finish(id, SnapshotOutcome::Discarded).is_some()
    }

    /// Finish an operation, discarding it if the active project changed
    /// since the snapshot was taken.
    pub fn resolve(
        &self,
        id: &SnapshotId,
        success: bool,
        active_project_id: Option<&str>,
    ) -> Resolution {
        let mut state = self.state();
        let Some(project_id) = state.open.get(id).map(|s| s.project_id.clone()) else {
            return Resolution::Unknown;
        };

        if active_project_id != Some(project_id.as_str()) {
            state.finish(id, SnapshotOutcome::Discarded);
            return Resolution::DiscardedStale;
        }

        if success {
            state.finish(id, SnapshotOutcome::Committed);
            Resolution::Committed
        } else {
            match state.finish(id, SnapshotOutcome::RolledBack) {
                Some(snapshot) => Resolution::RolledBack(snapshot.state),
                None => Resolution::Unknown,
            }
        }
    }

    /// Commit snapshots open longer than the bounded wait.
    pub fn expire_stale(&self) -> Vec<SnapshotId> {
        let mut state = self.state();
        let expired: Vec<SnapshotId> = state
            .open
            .values()
            .filter(|s| s.created_at.elapsed() >= self.timeout)
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            state.finish(id, SnapshotOutcome::Expired);
        }
        expired
    }

    pub fn get(&self, id: &SnapshotId) -> Option<OptimisticSnapshot> {
        self.state().open.get(id).cloned()
    }

    pub fn is_open(&self, id: &SnapshotId) -> bool {
        self.state().open.contains_key(id)
    }

    pub fn open_count(&self) -> usize {
        self.state().open.len()
    }

    pub fn stats(&self) -> SnapshotStats {
        let state = self.state();
        SnapshotStats {
            open: state.open.len(),
            ..state.stats
        }
    }
}
