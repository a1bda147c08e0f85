//! Reconnect merging, manual sync, project deletion and task purges.

use super::{DeltaSyncOutcome, DownloadReport, SyncCoordinator};
use crate::action_queue::{ActionQueueEntry, ActionType, EntityType, ProcessReport};
use crate::error::{ErrorKind, Result, SyncError};
use crate::events::{SyncEvent, now_millis};
use crate::model::{Project, ProjectId, SyncSource, TaskId};
use crate::mutation::Mutation;
use crate::remote::{PurgeOutcome, RemoteError};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Upload,
    Download,
    Both,
}

impl SyncDirection {
    fn uploads(self) -> bool {
        matches!(self, SyncDirection::Upload | SyncDirection::Both)
    }

    fn downloads(self) -> bool {
        matches!(self, SyncDirection::Download | SyncDirection::Both)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectReport {
    /// Projects uploaded and confirmed by the remote.
    pub synced_count: usize,
    pub merged_count: usize,
    pub conflict_count: usize,
    /// Projects whose upload failed; their changes stay queued.
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManualSyncReport {
    pub replayed: Option<ProcessReport>,
    pub uploaded: usize,
    pub download: Option<DownloadReport>,
    pub delta: Option<DeltaSyncOutcome>,
}

impl SyncCoordinator {
    /// Reconcile projects edited while offline with the cloud copies.
    ///
    /// A project with no remote counterpart, or whose local copy is strictly
    /// ahead, is uploaded as is. Otherwise the two are merged with fresh
    /// tombstones and the result is uploaded if it still differs.
    pub async fn merge_offline_data_on_reconnect(
        &self,
        cloud: Vec<Project>,
        offline: Vec<Project>,
        user_id: &str,
    ) -> Result<ReconnectReport> {
        self.set_user(Some(user_id.to_string()));
        let mut report = ReconnectReport::default();
        let cloud_by_id: HashMap<String, Project> =
            cloud.into_iter().map(|p| (p.id.clone(), p)).collect();
        let offline_ids: HashSet<String> = offline.iter().map(|p| p.id.clone()).collect();

        for offline_project in offline {
            let project_id = offline_project.id.clone();
            if !self.store.contains(&project_id) {
                self.full_upload_mut().insert(project_id.clone());
                self.store.insert(offline_project);
            }
            let Some(local) = self.store.get(&project_id) else {
                continue;
            };

            let upload = match cloud_by_id.get(&project_id) {
                None => {
                    debug!("{} has no remote copy; uploading", project_id);
                    true
                }
                Some(remote) if local.content_eq(remote) => {
                    self.store.update(&project_id, |project| {
                        project.version = project.version.max(remote.version);
                        project.sync_source = SyncSource::Synced;
                        project.pending_sync = false;
                    });
                    self.tracker.clear_project(&project_id);
                    false
                }
                Some(remote)
                    if local.version > remote.version
                        || (local.version == remote.version && local.updated_at > remote.updated_at) =>
                {
                    debug!(
                        "{} is ahead locally (v{} vs v{}); uploading",
                        project_id, local.version, remote.version
                    );
                    true
                }
                Some(remote) => {
                    let tombstones = self.remote.get_tombstone_ids(&project_id).await?;
                    let conflicts = self
                        .merge_into_store(remote, &tombstones, "offline edits merged on reconnect")
                        .unwrap_or_default();
                    report.merged_count += 1;
                    report.conflict_count += conflicts;
                    self.project_has_pending(&project_id)
                }
            };

            if upload {
                self.store.update(&project_id, |project| project.pending_sync = true);
                self.upload_on_reconnect(&project_id, user_id, &mut report)
                    .await;
            }
        }

        for (project_id, remote) in &cloud_by_id {
            if offline_ids.contains(project_id) || self.store.contains(project_id) {
                continue;
            }
            let mut project = remote.clone();
            project.sync_source = SyncSource::Synced;
            project.pending_sync = false;
            self.store.insert(project);
        }

        info!(
            "Reconnect: {} synced, {} merged, {} conflict(s), {} failed",
            report.synced_count,
            report.merged_count,
            report.conflict_count,
            report.failed.len()
        );
        self.save_local().await;
        self.save_watermarks().await;
        Ok(report)
    }

    async fn upload_on_reconnect(&self, project_id: &str, user_id: &str, report: &mut ReconnectReport) {
        match self.push_project(project_id, user_id, false).await {
            Ok(push) if push.failed_ids.is_empty() => {
                report.synced_count += 1;
                report.conflict_count += push.conflicts;
                self.commit_snapshots(project_id);
            }
            Ok(push) => {
                warn!(
                    "Remote refused {} entit(ies) of {} on reconnect",
                    push.failed_ids.len(),
                    project_id
                );
                report.conflict_count += push.conflicts;
                report.failed.push(project_id.to_string());
                self.enqueue_pending(project_id);
            }
            Err(e) => {
                warn!("Upload of {} failed on reconnect: {}", project_id, e);
                report.failed.push(project_id.to_string());
                self.enqueue_pending(project_id);
            }
        }
    }

    /// User-requested sync in one or both directions.
    pub async fn trigger_manual_sync(&self, direction: SyncDirection) -> Result<ManualSyncReport> {
        let user_id = self
            .user_id()
            .ok_or_else(|| SyncError::Permission("no active session".into()))?;
        if !self.is_online() {
            return Err(SyncError::Network("offline".into()));
        }

        let mut report = ManualSyncReport::default();
        if direction.uploads() {
            let pending: Vec<ProjectId> = self
                .store
                .ids()
                .into_iter()
                .filter(|id| self.project_has_pending(id))
                .collect();

            if self.queue.is_frozen() {
                self.queue.unfreeze();
            }
            report.replayed = Some(self.replay_queue().await);

            for project_id in &pending {
                if !self.project_has_pending(project_id) {
                    continue;
                }
                match self.push_project(project_id, &user_id, false).await {
                    Ok(_) => self.commit_snapshots(project_id),
                    Err(e) if e.kind() == ErrorKind::Network => {
                        self.enqueue_pending(project_id);
                        self.save_local().await;
                        return Err(e);
                    }
                    Err(e) => warn!("Manual upload of {} failed: {}", project_id, e),
                }
            }
            report.uploaded = pending
                .iter()
                .filter(|id| self.store.contains(id) && !self.project_has_pending(id))
                .count();
            self.save_local().await;
        }

        if direction.downloads() {
            report.download = Some(self.download_and_merge(&user_id).await?);
            if let Some(active) = self.store.active_project_id() {
                report.delta = Some(self.perform_delta_sync(&active).await?);
            }
        }
        Ok(report)
    }

    /// Remove a project locally and remotely.
    ///
    /// The local removal always happens. The remote delete is queued when it
    /// cannot be done now. Returns whether a remote copy was deleted.
    pub async fn delete_project(&self, project_id: &str) -> Result<bool> {
        let removed = {
            let _guard = self.store.begin_update()?;
            self.store
                .remove(project_id)
                .ok_or_else(|| SyncError::NotFound(format!("project {project_id}")))?
        };

        self.tracker.clear_project(project_id);
        self.queue.remove_project(project_id);
        self.resolver.store().take(project_id);
        self.discard_snapshots(project_id);
        self.watermarks_mut().forget(project_id);
        self.persist_states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(project_id);
        if self.store.active_project_id().as_deref() == Some(project_id) {
            self.store.set_active(None);
        }
        self.events.emit(SyncEvent::ProjectChanged {
            project_id: project_id.to_string(),
            timestamp: now_millis(),
        });
        info!("Deleted project {} locally", project_id);

        let never_uploaded = removed.sync_source == SyncSource::LocalOnly && removed.version == 0;
        let deleted_remotely = if never_uploaded {
            false
        } else {
            match self.user_id() {
                Some(user_id) if self.is_online() => {
                    match self.remote.delete_project_from_cloud(project_id, &user_id).await {
                        Ok(existed) => existed,
                        Err(RemoteError::Network(e)) => {
                            debug!("Queueing remote delete of {}: {}", project_id, e);
                            self.enqueue_project_delete(project_id);
                            false
                        }
                        Err(e) => {
                            self.save_local().await;
                            self.save_watermarks().await;
                            return Err(e.into());
                        }
                    }
                }
                _ => {
                    self.enqueue_project_delete(project_id);
                    false
                }
            }
        };

        self.save_local().await;
        self.save_watermarks().await;
        Ok(deleted_remotely)
    }

    fn enqueue_project_delete(&self, project_id: &str) {
        self.queue.enqueue(ActionQueueEntry::new(
            ActionType::Delete,
            EntityType::Project,
            project_id,
            project_id,
            json!({ "projectId": project_id }),
        ));
    }

    /// Hard-delete tasks remotely, falling back to tombstones.
    ///
    /// When the remote cannot purge (unsupported, denied or unreachable) the
    /// tasks are deleted locally as ordinary tombstones, which reach the
    /// remote through the normal persistence path.
    pub async fn purge_tasks(&self, project_id: &str, task_ids: &[TaskId]) -> Result<PurgeOutcome> {
        if !self.store.contains(project_id) {
            return Err(SyncError::NotFound(format!("project {project_id}")));
        }

        let remote_result = match self.user_id() {
            Some(_) if self.is_online() => Some(self.remote.purge_tasks(project_id, task_ids).await),
            _ => None,
        };

        match remote_result {
            Some(Ok(PurgeOutcome::Purged(count))) => {
                let ids: HashSet<&str> = task_ids.iter().map(String::as_str).collect();
                self.store.update(project_id, |project| {
                    project.tasks.retain(|t| !ids.contains(t.id.as_str()));
                    project
                        .connections
                        .retain(|c| !ids.contains(c.source.as_str()) && !ids.contains(c.target.as_str()));
                });
                self.events.emit(SyncEvent::ProjectChanged {
                    project_id: project_id.to_string(),
                    timestamp: now_millis(),
                });
                self.save_local().await;
                info!("Purged {} task(s) from {}", count, project_id);
                Ok(PurgeOutcome::Purged(count))
            }
            Some(Ok(PurgeOutcome::SoftDeleted(_))) => {
                debug!("Remote soft-deleted instead of purging on {}", project_id);
                self.soft_delete_locally(project_id, task_ids)
            }
            Some(Err(
                e @ (RemoteError::Unsupported(_) | RemoteError::Permission(_) | RemoteError::Network(_)),
            )) => {
                info!("Hard purge unavailable on {} ({}); tombstoning instead", project_id, e);
                self.soft_delete_locally(project_id, task_ids)
            }
            Some(Err(e)) => Err(e.into()),
            None => self.soft_delete_locally(project_id, task_ids),
        }
    }

    fn soft_delete_locally(&self, project_id: &str, task_ids: &[TaskId]) -> Result<PurgeOutcome> {
        let mut deleted = 0;
        for task_id in task_ids {
            let outcome = self.submit_mutation(Mutation::DeleteTask {
                project_id: project_id.to_string(),
                task_id: task_id.clone(),
            });
            match outcome {
                Ok(outcome) if !outcome.is_noop() => deleted += 1,
                Ok(_) => {}
                Err(SyncError::NotFound(_)) => debug!("Task {} already gone", task_id),
                Err(e) => return Err(e),
            }
        }
        Ok(PurgeOutcome::SoftDeleted(deleted))
    }
}
