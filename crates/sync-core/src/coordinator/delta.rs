//! Pulling remote state: session resume, delta sync and full download.

use super::SyncCoordinator;
use crate::conflict::{ConflictRecord, smart_merge};
use crate::error::{Result, SyncError};
use crate::events::{NotificationLevel, SyncEvent, now_millis};
use crate::model::{Entity, Project, SyncSource};
use crate::remote::{RemoteError, ResumeProbe};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Entities a delta sync changed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaSyncOutcome {
    pub task_changes: usize,
    pub connection_changes: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Projects new to this device.
    pub downloaded: usize,
    pub merged: usize,
    pub conflicts: usize,
    /// Missing remotely but kept because they hold data or pending work.
    pub kept_local: Vec<String>,
    /// Missing remotely, empty and clean; removed.
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackgroundSyncReport {
    pub used_resume_probe: bool,
    pub active_project_lost: bool,
    pub download: Option<DownloadReport>,
    pub delta: Option<DeltaSyncOutcome>,
}

impl SyncCoordinator {
    /// Catch up after a session starts or resumes.
    ///
    /// Tries the composite resume probe first and falls back to the
    /// individual watermark calls when the remote does not offer it. A
    /// previously active project that is no longer reachable is cleared,
    /// unless it only ever lived on this device.
    pub async fn start_background_sync(
        &self,
        user_id: &str,
        previous_active_project_id: Option<&str>,
    ) -> Result<BackgroundSyncReport> {
        self.set_user(Some(user_id.to_string()));
        let mut report = BackgroundSyncReport::default();

        let probe = match self
            .remote
            .resume_probe(user_id, previous_active_project_id)
            .await
        {
            Ok(probe) => {
                report.used_resume_probe = true;
                probe
            }
            Err(RemoteError::Unsupported(_)) => {
                debug!("Resume probe unsupported; using individual watermark calls");
                let active_project_watermark = match previous_active_project_id {
                    Some(id) => self.remote.project_watermark(id, user_id).await?,
                    None => None,
                };
                ResumeProbe {
                    active_project_watermark,
                    project_list_watermark: self.remote.project_list_watermark(user_id).await?,
                    auxiliary_watermark: None,
                }
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(previous) = previous_active_project_id {
            let local_only = self
                .store
                .get(previous)
                .is_some_and(|p| p.sync_source == SyncSource::LocalOnly);
            if probe.active_project_watermark.is_none() && !local_only {
                warn!("Previously active project {} is no longer accessible", previous);
                if self.store.active_project_id().as_deref() == Some(previous) {
                    self.store.set_active(None);
                }
                self.events.emit(SyncEvent::ActiveProjectLost {
                    project_id: previous.to_string(),
                });
                self.notify(
                    NotificationLevel::Warning,
                    format!("Project {previous} is no longer available"),
                );
                report.active_project_lost = true;
            } else if self.store.active_project_id().is_none() && self.store.contains(previous) {
                self.store.set_active(Some(previous.to_string()));
            }
        }

        let known_list = self.watermarks_mut().project_list;
        if known_list != Some(probe.project_list_watermark) {
            report.download = Some(self.download_and_merge(user_id).await?);
        }

        if let (Some(previous), Some(remote_mark), false) = (
            previous_active_project_id,
            probe.active_project_watermark,
            report.active_project_lost,
        ) {
            let known = self.watermarks_mut().project(previous);
            if remote_mark > known && self.store.contains(previous) {
                report.delta = Some(self.perform_delta_sync(previous).await?);
            }
        }

        {
            let mut watermarks = self.watermarks_mut();
            watermarks.project_list = Some(probe.project_list_watermark);
            if probe.auxiliary_watermark.is_some() {
                watermarks.auxiliary = probe.auxiliary_watermark;
            }
        }
        self.save_watermarks().await;
        Ok(report)
    }

    /// Apply remote task/connection changes since the project's watermark.
    ///
    /// Drifted entities merge field by field against local state, so locked
    /// fields and tombstones are respected exactly as in a full merge.
    pub async fn perform_delta_sync(&self, project_id: &str) -> Result<DeltaSyncOutcome> {
        let since = self.watermarks_mut().project(project_id);
        let cancellable = self.store.active_project_id().as_deref() == Some(project_id);
        let drift = self
            .remote_call(cancellable, self.remote.check_for_drift(project_id, since))
            .await?;

        if drift.is_empty() {
            self.watermarks_mut()
                .projects
                .insert(project_id.to_string(), drift.watermark);
            self.save_watermarks().await;
            return Ok(DeltaSyncOutcome::default());
        }
        debug!(
            "Drift on {} since {}: {} task(s), {} connection(s), {} removal(s)",
            project_id,
            since,
            drift.tasks.len(),
            drift.connections.len(),
            drift.removed_task_ids.len() + drift.removed_connection_ids.len()
        );

        let tombstones: HashSet<String> = drift
            .removed_task_ids
            .iter()
            .chain(drift.removed_connection_ids.iter())
            .cloned()
            .collect();
        let ctx = self.merge_context(project_id);

        let (outcome, record) = self
            .store
            .update(project_id, |local| {
                let mut remote_view = local.clone();
                for task in &drift.tasks {
                    upsert(&mut remote_view.tasks, task);
                }
                for conn in &drift.connections {
                    upsert(&mut remote_view.connections, conn);
                }

                let result = smart_merge(local, &remote_view, &tombstones, &ctx);
                let outcome = DeltaSyncOutcome {
                    task_changes: count_changes(&local.tasks, &result.project.tasks),
                    connection_changes: count_changes(&local.connections, &result.project.connections),
                    conflicts: result.conflict_count,
                };
                let record = ConflictRecord::from_merge(
                    local,
                    &remote_view,
                    &result,
                    "concurrent edit during delta sync",
                );

                let pending = local.pending_sync || result.project.pending_sync;
                let sync_source = local.sync_source;
                *local = result.project;
                local.pending_sync = pending;
                local.sync_source = sync_source;
                (outcome, record)
            })
            .ok_or_else(|| SyncError::NotFound(format!("project {project_id}")))?;

        if let Some(record) = record {
            self.record_conflict(record);
        }
        self.watermarks_mut()
            .projects
            .insert(project_id.to_string(), drift.watermark);

        if outcome.task_changes + outcome.connection_changes > 0 {
            self.events.emit(SyncEvent::ProjectChanged {
                project_id: project_id.to_string(),
                timestamp: now_millis(),
            });
        }
        self.save_local().await;
        self.save_watermarks().await;
        Ok(outcome)
    }

    /// Pull every remote project and merge it into the local list.
    ///
    /// A local project the remote does not know about is only removed when
    /// it is empty and has nothing pending. One holding tasks is kept as
    /// local-only, never silently dropped.
    pub async fn download_and_merge(&self, user_id: &str) -> Result<DownloadReport> {
        let cloud = self.remote.load_projects_from_cloud(user_id, true).await?;
        let cloud_ids: HashSet<String> = cloud.iter().map(|p| p.id.clone()).collect();
        let mut report = DownloadReport::default();

        for remote in &cloud {
            match self.store.get(&remote.id) {
                None => {
                    let mut project = remote.clone();
                    project.sync_source = SyncSource::Synced;
                    project.pending_sync = false;
                    self.store.insert(project);
                    self.mark_synced(&remote.id);
                    report.downloaded += 1;
                }
                Some(local) if !local.pending_sync && local.content_eq(remote) => {
                    self.store.update(&remote.id, |project| {
                        project.version = project.version.max(remote.version);
                        project.sync_source = SyncSource::Synced;
                    });
                    self.mark_synced(&remote.id);
                }
                Some(_) => {
                    let tombstones = self.remote.get_tombstone_ids(&remote.id).await?;
                    let conflicts = self
                        .merge_into_store(remote, &tombstones, "download merge")
                        .unwrap_or_default();
                    report.merged += 1;
                    report.conflicts += conflicts;
                    if self.project_has_pending(&remote.id)
                        && self.store.active_project_id().as_deref() != Some(remote.id.as_str())
                    {
                        self.enqueue_pending(&remote.id);
                    }
                }
            }
        }

        for local in self.store.all() {
            if cloud_ids.contains(&local.id) {
                continue;
            }
            self.reconcile_missing_remotely(&local, &mut report);
        }

        if self
            .store
            .active_project_id()
            .is_some_and(|id| self.project_has_pending(&id))
        {
            self.schedule_persist();
        }

        info!(
            "Download: {} new, {} merged, {} kept local, {} removed",
            report.downloaded,
            report.merged,
            report.kept_local.len(),
            report.removed.len()
        );
        self.save_local().await;
        self.save_watermarks().await;
        Ok(report)
    }

    fn reconcile_missing_remotely(&self, local: &Project, report: &mut DownloadReport) {
        let has_pending = local.pending_sync
            || self.tracker.has_pending_changes(&local.id)
            || self.queue.has_entries_for(&local.id);
        if has_pending {
            debug!("{} is not on the remote yet; keeping pending upload", local.id);
            report.kept_local.push(local.id.clone());
            return;
        }

        if local.has_substantial_data(self.config.substantial_task_threshold) {
            let task_count = local.live_task_count();
            warn!(
                "Project {} is missing remotely but holds {} task(s); keeping it local-only",
                local.id, task_count
            );
            self.store.update(&local.id, |project| {
                project.sync_source = SyncSource::LocalOnly;
            });
            self.events.emit(SyncEvent::LocalOnlyProjectRetained {
                project_id: local.id.clone(),
                task_count,
            });
            report.kept_local.push(local.id.clone());
            return;
        }

        info!("Removing empty project {} deleted remotely", local.id);
        self.store.remove(&local.id);
        self.tracker.clear_project(&local.id);
        self.watermarks_mut().forget(&local.id);
        if self.store.active_project_id().as_deref() == Some(local.id.as_str()) {
            self.store.set_active(None);
        }
        report.removed.push(local.id.clone());
    }

    fn mark_synced(&self, project_id: &str) {
        self.watermarks_mut()
            .last_synced
            .insert(project_id.to_string(), Utc::now());
    }
}

fn upsert<E: Entity>(entities: &mut Vec<E>, incoming: &E) {
    match entities.iter_mut().find(|e| e.id() == incoming.id()) {
        Some(existing) => *existing = incoming.clone(),
        None => entities.push(incoming.clone()),
    }
}

/// Entities added, removed or changed between two versions of a list.
fn count_changes<E: Entity + PartialEq>(before: &[E], after: &[E]) -> usize {
    let before: HashMap<&str, &E> = before.iter().map(|e| (e.id(), e)).collect();
    let after: HashMap<&str, &E> = after.iter().map(|e| (e.id(), e)).collect();
    let changed = after
        .iter()
        .filter(|(id, entity)| before.get(*id).is_none_or(|old| old != *entity))
        .count();
    let removed = before.keys().filter(|id| !after.contains_key(*id)).count();
    changed + removed
}
