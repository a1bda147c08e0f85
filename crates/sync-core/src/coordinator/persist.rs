//! Debounced, single-flight persistence of the active project.
//!
//! Every round writes the local copy first, then pushes to the remote when
//! online. The push result decides what happens to the open snapshots:
//! success commits them, a user-visible rejection rolls them back, and a
//! network failure commits them locally and leaves the change queued.

use super::{FlagGuard, SyncCoordinator};
use crate::action_queue::{ActionQueueEntry, ActionType, EntityType};
use crate::change_tracker::{ChangeKind, EntityRef};
use crate::conflict::{ConflictRecord, smart_merge};
use crate::error::{ErrorKind, Result, SyncError};
use crate::events::{NotificationLevel, PersistState, SyncEvent, now_millis};
use crate::model::{Project, SyncSource};
use crate::optimistic::Resolution;
use crate::remote::{self, SaveOutcome};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

/// What one push of a project achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PushReport {
    /// Version confirmed by the remote.
    pub version: Option<u64>,
    /// Conflicting fields found while merging after a version conflict.
    pub conflicts: usize,
    /// Tasks and connections the remote refused.
    pub failed_ids: Vec<String>,
    /// Nothing was pending.
    pub skipped: bool,
}

impl SyncCoordinator {
    /// Persist after `persist_debounce` of quiet. Each call restarts the
    /// wait, so a burst of edits produces one persist.
    pub fn schedule_persist(&self) {
        let generation = self.persist_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime; persist left to the next explicit call");
            return;
        };

        let this = self.this.clone();
        let delay = self.config.persist_debounce;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(coordinator) = this.upgrade() else {
                return;
            };
            if coordinator.persist_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            coordinator.persist_active_project().await;
        });
    }

    /// Persist the active project now.
    ///
    /// Single-flight: a call that arrives while a round is running marks the
    /// project for one more round instead of starting a second one. Deferred
    /// entirely while the action queue is replaying.
    pub async fn persist_active_project(&self) -> PersistState {
        if self.replaying.load(Ordering::SeqCst) {
            debug!("Queue replay in progress; deferring persist");
            self.persist_requested.store(true, Ordering::SeqCst);
            return PersistState::Idle;
        }
        if self.persisting.swap(true, Ordering::SeqCst) {
            self.persist_requested.store(true, Ordering::SeqCst);
            return PersistState::Persisting;
        }
        let _guard = FlagGuard(&self.persisting);

        loop {
            self.persist_requested.store(false, Ordering::SeqCst);
            let state = match self.store.active_project_id() {
                Some(project_id) => self.persist_once(&project_id).await,
                None => {
                    self.save_local().await;
                    PersistState::Idle
                }
            };
            if !self.persist_requested.load(Ordering::SeqCst) {
                return state;
            }
        }
    }

    async fn persist_once(&self, project_id: &str) -> PersistState {
        self.save_local().await;

        if !self.project_has_pending(project_id) {
            self.commit_snapshots(project_id);
            return self.persist_state(project_id);
        }
        self.set_persist_state(project_id, PersistState::Persisting);

        let Some(user_id) = self.user_id() else {
            debug!("No session; {} stays local for now", project_id);
            self.commit_snapshots(project_id);
            self.set_persist_state(project_id, PersistState::Idle);
            return PersistState::Idle;
        };

        if !self.is_online() {
            let queued = self.enqueue_pending(project_id);
            debug!("Offline; queued {} action(s) for {}", queued, project_id);
            self.commit_snapshots(project_id);
            self.save_local().await;
            self.set_persist_state(project_id, PersistState::Failed);
            return PersistState::Failed;
        }

        let state = match self.push_project(project_id, &user_id, true).await {
            Ok(report) => {
                if !report.failed_ids.is_empty() {
                    warn!(
                        "Remote refused {} entit(ies) of {}; keeping them queued",
                        report.failed_ids.len(),
                        project_id
                    );
                    self.enqueue_pending(project_id);
                }
                self.resolve_snapshots(project_id, true);
                if report.conflicts > 0 {
                    PersistState::Conflict
                } else {
                    PersistState::Confirmed
                }
            }
            Err(SyncError::Cancelled) => {
                debug!("Persist of {} cancelled by project switch", project_id);
                self.discard_snapshots(project_id);
                self.enqueue_pending(project_id);
                PersistState::Idle
            }
            Err(e) => match e.kind() {
                ErrorKind::Network | ErrorKind::Conflict => {
                    info!("Could not reach remote for {}; queued for retry: {}", project_id, e);
                    self.enqueue_pending(project_id);
                    self.commit_snapshots(project_id);
                    PersistState::Failed
                }
                ErrorKind::Validation | ErrorKind::Quota | ErrorKind::Permission => {
                    warn!("Remote rejected {}: {}", project_id, e);
                    self.resolve_snapshots(project_id, false);
                    self.notify(NotificationLevel::Error, format!("Changes were not saved: {e}"));
                    PersistState::Failed
                }
                ErrorKind::Local | ErrorKind::Unknown => {
                    error!("Unexpected failure persisting {}: {}", project_id, e);
                    self.commit_snapshots(project_id);
                    PersistState::Failed
                }
            },
        };

        self.save_local().await;
        self.save_watermarks().await;
        self.set_persist_state(project_id, state);
        state
    }

    /// Upload one project, recovering from a version conflict (merge, retry
    /// once) and from a validation rejection (sanitize, retry once).
    ///
    /// The tracked diff is consumed on success; refused entities stay dirty.
    pub(crate) async fn push_project(
        &self,
        project_id: &str,
        user_id: &str,
        cancellable: bool,
    ) -> Result<PushReport> {
        let diff = self.tracker.take_diff(project_id);
        let changed = diff.entity_ids();
        let mut report = PushReport::default();

        match self
            .push_with_recovery(project_id, user_id, &changed, cancellable, &mut report)
            .await
        {
            Ok(()) => {
                if !report.failed_ids.is_empty() {
                    let failed: HashSet<String> = report.failed_ids.iter().cloned().collect();
                    let mut kept = diff;
                    kept.retain_entities(&failed);
                    self.tracker.restore_diff(project_id, kept);
                }
                Ok(report)
            }
            Err(e) => {
                self.tracker.restore_diff(project_id, diff);
                Err(e)
            }
        }
    }

    async fn push_with_recovery(
        &self,
        project_id: &str,
        user_id: &str,
        changed: &HashSet<String>,
        cancellable: bool,
        report: &mut PushReport,
    ) -> Result<()> {
        let mut sanitized = false;
        let mut merged = false;

        loop {
            let Some(sent) = self.store.get(project_id) else {
                report.skipped = true;
                return Ok(());
            };
            if !sent.pending_sync {
                report.skipped = !merged;
                report.version = Some(sent.version);
                return Ok(());
            }

            let scope = self.upload_scope(project_id, changed);
            let payload = match &scope {
                Some(ids) => {
                    let payload = sent.with_entities(ids);
                    debug!(
                        "Uploading {} task(s) and {} connection(s) of {}",
                        payload.tasks.len(),
                        payload.connections.len(),
                        project_id
                    );
                    payload
                }
                None => sent.clone(),
            };

            let save = match self
                .remote_call(cancellable, self.remote.save_project_smart(&payload, user_id))
                .await
            {
                Ok(save) => save,
                Err(SyncError::Validation(e)) if !sanitized => {
                    sanitized = true;
                    let repairs = self
                        .store
                        .update(project_id, Project::sanitize)
                        .unwrap_or_default();
                    if repairs.is_empty() {
                        return Err(SyncError::Validation(e));
                    }
                    warn!("Remote rejected {} ({}); retrying once sanitized: {:?}", project_id, e, repairs);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if save.conflict {
                let remote_version = save
                    .remote_data
                    .as_ref()
                    .map(|p| p.version)
                    .or(save.new_version)
                    .unwrap_or_default();
                if merged {
                    return Err(SyncError::VersionConflict {
                        project_id: project_id.to_string(),
                        local_version: sent.version,
                        remote_version,
                    });
                }
                merged = true;
                info!(
                    "Version conflict on {} (local v{}, remote v{}); merging",
                    project_id, sent.version, remote_version
                );

                let remote = match save.remote_data {
                    Some(remote) => remote,
                    None => self
                        .remote_call(cancellable, self.remote.load_single_project(project_id, user_id))
                        .await?
                        .ok_or_else(|| SyncError::NotFound(format!("project {project_id}")))?,
                };
                let tombstones = self
                    .remote_call(cancellable, self.remote.get_tombstone_ids(project_id))
                    .await?;
                let conflicts = self
                    .merge_into_store(&remote, &tombstones, "version conflict on save")
                    .unwrap_or_default();
                if conflicts > 0 {
                    self.set_persist_state(project_id, PersistState::Conflict);
                }
                report.conflicts += conflicts;
                continue;
            }

            self.apply_confirmed_save(project_id, &sent, &save);
            if scope.is_none() && !save.is_partial() {
                self.full_upload_mut().remove(project_id);
            }
            report.version = save.new_version;
            report.failed_ids = save
                .failed_task_ids
                .iter()
                .chain(save.failed_connection_ids.iter())
                .cloned()
                .collect();
            return Ok(());
        }
    }

    /// Tasks and connections to upload for `project_id`: the taken diff plus
    /// whatever is still queued. `None` means the whole project.
    fn upload_scope(&self, project_id: &str, changed: &HashSet<String>) -> Option<HashSet<String>> {
        if self.full_upload_mut().contains(project_id) {
            return None;
        }
        let mut ids = changed.clone();
        for entry in self.queue.entries() {
            if entry.project_id != project_id {
                continue;
            }
            if entry.entity_type == EntityType::Project {
                return None;
            }
            ids.insert(entry.entity_id);
        }
        (!ids.is_empty()).then_some(ids)
    }

    fn apply_confirmed_save(&self, project_id: &str, sent: &Project, save: &SaveOutcome) {
        let partial = save.is_partial();
        let sent_fingerprint = sent.fingerprint();
        self.store.update(project_id, |project| {
            let edited_meanwhile = project.fingerprint() != sent_fingerprint;
            if let Some(version) = save.new_version {
                project.version = project.version.max(version);
            }
            project.sync_source = SyncSource::Synced;
            project.pending_sync = edited_meanwhile || partial;
        });
        self.watermarks_mut()
            .last_synced
            .insert(project_id.to_string(), Utc::now());
        debug!("Remote confirmed {} at v{:?}", project_id, save.new_version);
    }

    /// Run a remote call, optionally cancelled by an active project switch.
    pub(super) async fn remote_call<T>(
        &self,
        cancellable: bool,
        call: impl Future<Output = remote::Result<T>>,
    ) -> Result<T> {
        if cancellable {
            self.store.run_cancellable(call).await?.map_err(SyncError::from)
        } else {
            call.await.map_err(SyncError::from)
        }
    }

    /// Merge `remote` into the stored copy of the same project and store any
    /// conflict silently. Returns the conflict count, or `None` when the
    /// project is not held locally.
    pub(super) fn merge_into_store(
        &self,
        remote: &Project,
        tombstones: &HashSet<String>,
        reason: &str,
    ) -> Option<usize> {
        let ctx = self.merge_context(&remote.id);
        let (record, conflicts, pending) = self.store.update(&remote.id, |local| {
            let result = smart_merge(local, remote, tombstones, &ctx);
            let record = ConflictRecord::from_merge(local, remote, &result, reason);
            let conflicts = result.conflict_count;
            for issue in &result.issues {
                debug!("Merge of {}: {:?} on {}", remote.id, issue.kind, issue.entity_id);
            }
            *local = result.project;
            (record, conflicts, local.pending_sync)
        })?;

        // Whatever the merge kept over the remote copy goes up in full.
        if pending {
            self.full_upload_mut().insert(remote.id.clone());
        }
        if let Some(record) = record {
            self.record_conflict(record);
        }
        self.events.emit(SyncEvent::ProjectChanged {
            project_id: remote.id.clone(),
            timestamp: now_millis(),
        });
        Some(conflicts)
    }

    // ==================== Queue hand-off ====================

    /// Move the tracked diff of a project onto the action queue. A project
    /// with no entity changes but `pending_sync` set gets one project entry.
    pub(super) fn enqueue_pending(&self, project_id: &str) -> usize {
        let Some(project) = self.store.get(project_id) else {
            return 0;
        };
        let diff = self.tracker.take_diff(project_id);

        let mut queued = 0;
        for (entity, change) in diff.changes {
            let action = match change.kind {
                ChangeKind::Created => ActionType::Create,
                ChangeKind::Updated => ActionType::Update,
                ChangeKind::Deleted => ActionType::Delete,
            };
            let (entity_type, payload) = match &entity {
                EntityRef::Task(id) => (EntityType::Task, to_payload(project.task(id))),
                EntityRef::Connection(id) => {
                    (EntityType::Connection, to_payload(project.connection(id)))
                }
            };
            self.queue.enqueue(ActionQueueEntry::new(
                action,
                entity_type,
                entity.id(),
                project_id,
                payload,
            ));
            queued += 1;
        }

        if queued == 0 && project.pending_sync {
            let action = if project.sync_source == SyncSource::LocalOnly && project.version == 0 {
                ActionType::Create
            } else {
                ActionType::Update
            };
            self.queue.enqueue(ActionQueueEntry::new(
                action,
                EntityType::Project,
                project_id,
                project_id,
                json!({ "name": project.name }),
            ));
            queued += 1;
        }
        queued
    }

    // ==================== Snapshots ====================

    pub(super) fn commit_snapshots(&self, project_id: &str) {
        let ids = self.pending_snapshots_mut().remove(project_id).unwrap_or_default();
        for id in &ids {
            self.snapshots.commit(id);
        }
    }

    pub(super) fn discard_snapshots(&self, project_id: &str) {
        let ids = self.pending_snapshots_mut().remove(project_id).unwrap_or_default();
        for id in &ids {
            self.snapshots.discard(id);
        }
    }

    /// Finish every open snapshot of a project. On failure the project goes
    /// back to the state before the oldest of them.
    fn resolve_snapshots(&self, project_id: &str, success: bool) {
        let ids = self.pending_snapshots_mut().remove(project_id).unwrap_or_default();
        let active = self.store.active_project_id();

        let mut restore: Option<(u64, Project)> = None;
        let mut labels = Vec::new();
        for id in &ids {
            let Some(snapshot) = self.snapshots.get(id) else {
                // Superseded; its pre-state lives on in a later snapshot
                continue;
            };
            match self.snapshots.resolve(id, success, active.as_deref()) {
                Resolution::RolledBack(state) => {
                    if restore.as_ref().is_none_or(|(seq, _)| snapshot.base_seq < *seq) {
                        restore = Some((snapshot.base_seq, state));
                    }
                    labels.push(snapshot.label);
                }
                Resolution::DiscardedStale => {
                    debug!("Dropped stale result for snapshot {}", id);
                }
                Resolution::Committed | Resolution::Unknown => {}
            }
        }

        let Some((_, state)) = restore else {
            return;
        };
        self.store.update(project_id, |project| {
            let version = project.version;
            *project = state;
            project.version = project.version.max(version);
        });
        self.tracker.clear_project(project_id);
        for label in labels {
            self.events.emit(SyncEvent::SnapshotRolledBack {
                project_id: project_id.to_string(),
                label,
            });
        }
        self.events.emit(SyncEvent::ProjectChanged {
            project_id: project_id.to_string(),
            timestamp: now_millis(),
        });
    }

    // ==================== Local writes ====================

    /// Write projects and queue to the local store. Failures are logged and
    /// surfaced; in-memory state is untouched.
    pub(super) async fn save_local(&self) -> bool {
        let projects = self.store.all();
        let queue = self.queue.snapshot();
        let fingerprint = self.dirty_fingerprint();

        let result = match self.local.save_projects(&projects).await {
            Ok(()) => self.local.save_queue(&queue).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.last_saved_fingerprint.store(fingerprint, Ordering::SeqCst);
                true
            }
            Err(e) => {
                error!("Local save failed: {}", e);
                self.notify(
                    NotificationLevel::Warning,
                    format!("Changes could not be saved on this device: {e}"),
                );
                false
            }
        }
    }

    pub(super) async fn save_watermarks(&self) {
        let watermarks = self.watermarks();
        if let Err(e) = self.local.save_watermarks(&watermarks).await {
            warn!("Could not save sync watermarks: {}", e);
        }
    }

    pub(super) fn notify(&self, level: NotificationLevel, message: String) {
        self.events.emit(SyncEvent::Notification { level, message });
    }
}

fn to_payload<T: serde::Serialize>(entity: Option<&T>) -> Value {
    entity
        .and_then(|e| serde_json::to_value(e).ok())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::events::{NotificationLevel, PersistState, SyncEvent};
    use crate::local_store::LocalStore;
    use crate::model::{Connection, Entity, Field};
    use crate::mutation::{Mutation, TaskPatch};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

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

    fn record_events(h: &Harness) -> (Arc<Mutex<Vec<SyncEvent>>>, crate::events::Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = h.coordinator.subscribe(move |e| sink.lock().unwrap().push(e));
        (events, sub)
    }

    // ==================== Success ====================

    #[tokio::test]
    async fn test_persist_confirms_and_version_never_decreases() {
        let h = harness();
        let seeded = seed_active(&h, &synced_project("p1", 2));

        h.coordinator
            .submit_mutation(rename_task("p1", "t0", "First"))
            .unwrap();
        let state = h.coordinator.persist_active_project().await;
        assert_eq!(state, PersistState::Confirmed);

        let after_first = h.coordinator.project("p1").unwrap();
        assert!(after_first.version >= seeded.version);
        assert!(!after_first.pending_sync);
        assert!(!h.coordinator.tracker().has_pending_changes("p1"));
        assert_eq!(h.coordinator.snapshots().stats().committed, 1);

        h.coordinator
            .submit_mutation(rename_task("p1", "t1", "Second"))
            .unwrap();
        h.coordinator.persist_active_project().await;
        let after_second = h.coordinator.project("p1").unwrap();
        assert!(after_second.version >= after_first.version);
        assert_eq!(h.remote.project("p1").unwrap().task("t1").unwrap().title, "Second");
        assert_eq!(h.coordinator.persist_state("p1"), PersistState::Confirmed);
    }

    #[tokio::test]
    async fn test_local_store_written_before_remote() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));
        h.remote.set_offline(true);

        h.coordinator
            .submit_mutation(rename_task("p1", "t0", "Offline edit"))
            .unwrap();
        h.coordinator.persist_active_project().await;

        let saved = h.local.load_projects().await.unwrap();
        assert_eq!(saved[0].task("t0").unwrap().title, "Offline edit");
    }

    #[tokio::test]
    async fn test_upload_sends_only_changed_entities() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 3));

        h.coordinator
            .submit_mutation(rename_task("p1", "t1", "Only this one"))
            .unwrap();
        let state = h.coordinator.persist_active_project().await;
        assert_eq!(state, PersistState::Confirmed);

        let sent = h.remote.last_saved().unwrap();
        let sent_ids: Vec<&str> = sent.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(sent_ids, vec!["t1"]);

        let remote = h.remote.project("p1").unwrap();
        assert_eq!(remote.tasks.len(), 3);
        assert_eq!(remote.task("t1").unwrap().title, "Only this one");
        assert_eq!(remote.task("t2").unwrap().title, "Task 2");
        assert!(!h.coordinator.project("p1").unwrap().pending_sync);
    }

    #[tokio::test]
    async fn test_restored_pending_project_uploads_in_full() {
        let h = harness();
        let project = synced_project("p1", 3);
        let version = h.remote.insert_project(USER, &project);

        // Edited in an earlier run; that tracker state is gone
        let mut saved = project.clone();
        saved.version = version;
        saved.tasks[0].title = "Edited before restart".into();
        saved.tasks[0].touch(&[Field::Title], at(5));
        saved.pending_sync = true;
        h.local.save_projects(&[saved]).await.unwrap();

        h.coordinator.load_from_local().await.unwrap();
        h.coordinator.set_active_project(Some("p1".into()));
        h.coordinator
            .submit_mutation(rename_task("p1", "t1", "Edited after restart"))
            .unwrap();
        let state = h.coordinator.persist_active_project().await;
        assert_eq!(state, PersistState::Confirmed);

        assert_eq!(h.remote.last_saved().unwrap().tasks.len(), 3);
        let remote = h.remote.project("p1").unwrap();
        assert_eq!(remote.task("t0").unwrap().title, "Edited before restart");
        assert_eq!(remote.task("t1").unwrap().title, "Edited after restart");

        // Back to incremental once the full copy is confirmed
        h.coordinator
            .submit_mutation(rename_task("p1", "t2", "Later"))
            .unwrap();
        h.coordinator.persist_active_project().await;
        assert_eq!(h.remote.last_saved().unwrap().tasks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_edits_persists_once_after_debounce() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));

        for title in ["a", "ab", "abc"] {
            h.coordinator
                .submit_mutation(rename_task("p1", "t0", title))
                .unwrap();
        }
        assert_eq!(h.remote.save_calls(), 0);

        tokio::time::sleep(Duration::from_secs(3700)).await;
        assert_eq!(h.remote.save_calls(), 1);
        assert_eq!(h.remote.project("p1").unwrap().task("t0").unwrap().title, "abc");
    }

    // ==================== Failures ====================

    #[tokio::test]
    async fn test_offline_persist_queues_without_notification() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));
        let (events, _sub) = record_events(&h);
        h.coordinator.set_online(false);

        h.coordinator
            .submit_mutation(rename_task("p1", "t0", "Queued"))
            .unwrap();
        let state = h.coordinator.persist_active_project().await;

        assert_eq!(state, PersistState::Failed);
        assert_eq!(h.remote.save_calls(), 0);
        assert_eq!(h.coordinator.queue().queue_size(), 1);
        assert!(h.coordinator.project("p1").unwrap().pending_sync);
        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SyncEvent::Notification { .. })));
    }

    #[tokio::test]
    async fn test_network_error_enqueues_and_keeps_edit() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));
        h.remote.fail_next_saves(1);

        h.coordinator
            .submit_mutation(rename_task("p1", "t0", "Kept"))
            .unwrap();
        let state = h.coordinator.persist_active_project().await;

        assert_eq!(state, PersistState::Failed);
        assert_eq!(h.coordinator.project("p1").unwrap().task("t0").unwrap().title, "Kept");
        assert!(h.coordinator.queue().has_entries_for("p1"));
        assert_eq!(h.coordinator.snapshots().stats().committed, 1);
    }

    #[tokio::test]
    async fn test_permission_error_rolls_back_with_notification() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));
        let (events, _sub) = record_events(&h);
        h.remote.set_inaccessible("p1", true);

        h.coordinator
            .submit_mutation(rename_task("p1", "t0", "Forbidden"))
            .unwrap();
        let state = h.coordinator.persist_active_project().await;

        assert_eq!(state, PersistState::Failed);
        assert_eq!(h.coordinator.project("p1").unwrap().task("t0").unwrap().title, "Task 0");
        assert_eq!(h.coordinator.snapshots().stats().rolled_back, 1);
        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::Notification {
                level: NotificationLevel::Error,
                ..
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::SnapshotRolledBack { .. })));
    }

    #[tokio::test]
    async fn test_rejection_after_two_edits_restores_state_before_both() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));
        h.remote.set_inaccessible("p1", true);

        h.coordinator.submit_mutation(rename_task("p1", "t0", "A")).unwrap();
        h.coordinator.submit_mutation(rename_task("p1", "t0", "B")).unwrap();
        let stats = h.coordinator.snapshots().stats();
        assert_eq!(stats.discarded, 0);
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.open, 1);

        let state = h.coordinator.persist_active_project().await;

        assert_eq!(state, PersistState::Failed);
        let project = h.coordinator.project("p1").unwrap();
        assert_eq!(project.task("t0").unwrap().title, "Task 0");
        assert!(!project.pending_sync);
        assert!(!h.coordinator.tracker().has_pending_changes("p1"));
        assert_eq!(h.coordinator.snapshots().stats().open, 0);
    }

    #[tokio::test]
    async fn test_validation_error_sanitizes_and_retries_once() {
        let h = harness();
        let mut project = seed_active(&h, &synced_project("p1", 1));
        project
            .connections
            .push(Connection::new("c-bad", "t0", "missing", at(0)));
        project.pending_sync = true;
        h.coordinator.store().insert(project);

        let state = h.coordinator.persist_active_project().await;

        assert_eq!(state, PersistState::Confirmed);
        assert_eq!(h.remote.save_calls(), 2);
        assert!(h.coordinator.project("p1").unwrap().connection("c-bad").is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_refused_entity_dirty() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 2));
        h.remote.reject_entity("t1");

        h.coordinator
            .submit_mutation(rename_task("p1", "t0", "Accepted"))
            .unwrap();
        h.coordinator
            .submit_mutation(rename_task("p1", "t1", "Refused"))
            .unwrap();
        h.coordinator.persist_active_project().await;

        assert_eq!(h.remote.project("p1").unwrap().task("t0").unwrap().title, "Accepted");
        assert!(h.coordinator.project("p1").unwrap().pending_sync);
        let queued: Vec<String> = h
            .coordinator
            .queue()
            .entries()
            .into_iter()
            .map(|e| e.entity_id)
            .collect();
        assert_eq!(queued, vec!["t1".to_string()]);
    }

    // ==================== Conflicts ====================

    #[tokio::test]
    async fn test_version_conflict_merges_and_stores_record() {
        let h = harness();
        let seeded = seed_active(&h, &synced_project("p1", 2));
        let mut conflicts = h.coordinator.conflict_stream();

        let mut external = seeded.clone();
        external.tasks[0].title = "Remote".into();
        external.tasks[0].touch(&[Field::Title], at(5));
        external.tasks[1].content = "remote notes".into();
        external.tasks[1].touch(&[Field::Content], at(5));
        h.remote.apply_external_save(&external).unwrap();

        h.coordinator
            .submit_mutation(rename_task("p1", "t0", "Local"))
            .unwrap();
        let state = h.coordinator.persist_active_project().await;

        assert_eq!(state, PersistState::Conflict);
        let merged = h.coordinator.project("p1").unwrap();
        assert_eq!(merged.task("t0").unwrap().title, "Local");
        assert_eq!(merged.task("t1").unwrap().content, "remote notes");
        assert!(!merged.pending_sync);
        assert_eq!(h.remote.project("p1").unwrap().task("t0").unwrap().title, "Local");

        let records = h.coordinator.conflicts("p1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field_names(), vec!["title".to_string()]);

        use futures::StreamExt;
        let event = conflicts.next().await.unwrap();
        assert_eq!(event.project_id, "p1");
    }

    #[tokio::test]
    async fn test_switching_project_moves_unsaved_work_to_queue() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));
        h.coordinator
            .submit_mutation(rename_task("p1", "t0", "Edit"))
            .unwrap();

        h.coordinator.set_active_project(Some("p2".into()));
        assert!(h.coordinator.queue().has_entries_for("p1"));
        assert_eq!(h.coordinator.snapshots().open_count(), 0);
        assert_eq!(
            h.coordinator.persist_active_project().await,
            PersistState::Idle
        );
        assert!(h.coordinator.project("p1").unwrap().pending_sync);
        assert_eq!(h.remote.save_calls(), 0);
    }
}
