//! SyncCoordinator: owns the project store and drives every sync path.
//!
//! Collaborators talk to the coordinator only. Local mutations go through
//! [`SyncCoordinator::submit_mutation`], which applies them optimistically
//! and schedules a debounced persist. The remote side of things is split
//! across submodules:
//!
//! - `persist` - single-flight save of the active project, result handling
//! - `delta` - resume probe, watermark-based delta sync, full download
//! - `reconnect` - merging offline data back in, manual sync, deletes, purges
//! - `processors` - action queue processors that replay queued entries
//! - `autosave` - periodic local durability snapshot
//!
//! Per-project persistence moves through
//! `Idle -> Persisting -> {Confirmed | Conflict | Failed}`; the last state
//! stays observable until the next persist starts.

mod autosave;
mod delta;
mod persist;
mod processors;
mod reconnect;

pub use autosave::AutosaveReport;
pub use delta::{BackgroundSyncReport, DeltaSyncOutcome, DownloadReport};
pub use reconnect::{ManualSyncReport, ReconnectReport, SyncDirection};

use crate::action_queue::{ActionKind, ActionQueue, ActionType, EntityType};
use crate::change_tracker::{ChangeKind, ChangeTracker};
use crate::config::SyncConfig;
use crate::conflict::{ConflictRecord, ConflictResolver, MergeContext, ResolutionChoice, ResolvedConflict};
use crate::error::{Result, SyncError};
use crate::events::{ConflictStream, EventBus, PersistState, Subscription, SyncEvent, now_millis};
use crate::local_store::{LocalStore, Watermarks};
use crate::model::{Project, ProjectId, ValidationError};
use crate::mutation::{Mutation, MutationOutcome};
use crate::optimistic::{OptimisticStateManager, SnapshotId};
use crate::remote::RemoteRepository;
use crate::store::ProjectStore;
use chrono::Utc;
use processors::{ProjectDeleteProcessor, ProjectPushProcessor};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, info};

/// Clears an atomic flag on drop.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncCoordinator {
    config: SyncConfig,
    remote: Arc<dyn RemoteRepository>,
    local: Arc<dyn LocalStore>,
    store: ProjectStore,
    tracker: ChangeTracker,
    snapshots: OptimisticStateManager,
    queue: ActionQueue,
    resolver: ConflictResolver,
    events: Arc<EventBus>,
    watermarks: Mutex<Watermarks>,
    persist_states: RwLock<HashMap<ProjectId, PersistState>>,
    /// Open snapshots per project, in creation order, awaiting the next
    /// persist result.
    pending_snapshots: Mutex<HashMap<ProjectId, Vec<SnapshotId>>>,
    /// Projects whose pending changes are not all in the tracker or the
    /// queue, so the next upload sends every entity.
    full_upload: Mutex<HashSet<ProjectId>>,
    user_id: RwLock<Option<String>>,
    online: AtomicBool,
    persisting: AtomicBool,
    /// Set when a persist is asked for while one is already running.
    persist_requested: AtomicBool,
    replaying: AtomicBool,
    persist_generation: AtomicU64,
    last_saved_fingerprint: AtomicU64,
    this: Weak<SyncCoordinator>,
}

impl SyncCoordinator {
    /// Build a coordinator and register a processor for every action kind.
    ///
    /// Fails if any kind the coordinator enqueues is left without a
    /// processor.
    pub fn new(
        config: SyncConfig,
        remote: Arc<dyn RemoteRepository>,
        local: Arc<dyn LocalStore>,
    ) -> Result<Arc<Self>> {
        let events = Arc::new(EventBus::new());
        let coordinator = Arc::new_cyclic(|this: &Weak<SyncCoordinator>| {
            let queue = ActionQueue::with_events(config.retry.clone(), Arc::clone(&events));
            for kind in ActionKind::all() {
                let registered = if kind == ActionKind::new(ActionType::Delete, EntityType::Project) {
                    queue.register_processor(kind, Arc::new(ProjectDeleteProcessor::new(this.clone())))
                } else {
                    queue.register_processor(kind, Arc::new(ProjectPushProcessor::new(this.clone())))
                };
                debug_assert!(registered);
            }

            Self {
                tracker: ChangeTracker::with_max_hold(config.lock_ttl, config.lock_max_hold),
                snapshots: OptimisticStateManager::new(config.snapshot_timeout),
                config,
                remote,
                local,
                store: ProjectStore::new(),
                queue,
                resolver: ConflictResolver::new(),
                events,
                watermarks: Mutex::new(Watermarks::default()),
                persist_states: RwLock::new(HashMap::new()),
                pending_snapshots: Mutex::new(HashMap::new()),
                full_upload: Mutex::new(HashSet::new()),
                user_id: RwLock::new(None),
                online: AtomicBool::new(true),
                persisting: AtomicBool::new(false),
                persist_requested: AtomicBool::new(false),
                replaying: AtomicBool::new(false),
                persist_generation: AtomicU64::new(0),
                last_saved_fingerprint: AtomicU64::new(0),
                this: this.clone(),
            }
        });

        coordinator.queue.ensure_processors(&ActionKind::all())?;
        Ok(coordinator)
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn snapshots(&self) -> &OptimisticStateManager {
        &self.snapshots
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks_mut().clone()
    }

    fn watermarks_mut(&self) -> MutexGuard<'_, Watermarks> {
        self.watermarks.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Session ====================

    pub fn set_user(&self, user_id: Option<String>) {
        *self.user_id.write().unwrap_or_else(|e| e.into_inner()) = user_id;
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Connectivity flag, set by the host. Going offline pauses the queue.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if online {
            self.queue.resume();
        } else {
            self.queue.pause();
        }
        if was != online {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn active_project_id(&self) -> Option<ProjectId> {
        self.store.active_project_id()
    }

    /// Switch the active project. Unsaved work on the previous one moves to
    /// the action queue, since only the active project is persisted live.
    pub fn set_active_project(&self, project_id: Option<ProjectId>) -> u64 {
        if let Some(previous) = self.store.active_project_id() {
            if project_id.as_ref() != Some(&previous) && self.project_has_pending(&previous) {
                self.enqueue_pending(&previous);
                self.commit_snapshots(&previous);
            }
        }
        self.store.set_active(project_id)
    }

    // ==================== Reads ====================

    pub fn snapshot(&self) -> Vec<Project> {
        self.store.all()
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        self.store.get(project_id)
    }

    pub fn persist_state(&self, project_id: &str) -> PersistState {
        self.persist_states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(project_id)
            .copied()
            .unwrap_or_default()
    }

    /// Anything local that the remote has not confirmed yet.
    pub fn has_pending_local_changes(&self) -> bool {
        self.tracker.has_any_pending_changes()
            || !self.queue.is_empty()
            || self.store.all().iter().any(|p| p.pending_sync)
    }

    pub fn subscribe(&self, callback: impl Fn(SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    pub fn conflict_stream(&self) -> ConflictStream {
        self.events.conflict_stream()
    }

    /// Unacknowledged conflict records for a project.
    pub fn conflicts(&self, project_id: &str) -> Vec<ConflictRecord> {
        self.resolver.store().pending(project_id)
    }

    // ==================== Mutations ====================

    /// Apply a mutation optimistically and schedule its persistence.
    ///
    /// Rejects with [`SyncError::Busy`] while another mutation is being
    /// applied. A mutation that changes nothing discards its snapshot and
    /// emits nothing.
    pub fn submit_mutation(&self, mutation: Mutation) -> Result<MutationOutcome> {
        let _guard = self.store.begin_update()?;
        let project_id = mutation.project_id().to_string();
        let now = Utc::now();

        if let Mutation::CreateProject { name, .. } = &mutation {
            if project_id.trim().is_empty() {
                return Err(ValidationError::EmptyProjectId.into());
            }
            if self.store.contains(&project_id) {
                return Err(ValidationError::Malformed(format!(
                    "project {project_id} already exists"
                ))
                .into());
            }
            self.store.insert(Project::new(project_id.clone(), name.clone(), now));
        }

        let (snapshot, changes) = self
            .store
            .update(&project_id, |project| {
                let snapshot =
                    self.snapshots
                        .create_snapshot(project, mutation.entity_id(), mutation.label());
                match mutation.apply(project, now) {
                    Ok(changes) if changes.is_empty() => {
                        self.snapshots.discard(&snapshot);
                        Ok((None, changes))
                    }
                    Ok(changes) => {
                        project.pending_sync = true;
                        Ok((Some(snapshot), changes))
                    }
                    Err(e) => {
                        self.snapshots.discard(&snapshot);
                        Err(e)
                    }
                }
            })
            .ok_or_else(|| SyncError::NotFound(format!("project {project_id}")))??;

        let Some(snapshot) = snapshot else {
            debug!("{} on {} changed nothing", mutation.label(), project_id);
            return Ok(MutationOutcome {
                project_id,
                changes,
            });
        };

        for change in &changes {
            let Some(entity) = &change.entity else {
                continue;
            };
            match change.kind {
                ChangeKind::Created => self.tracker.track_create(&project_id, entity.clone(), &change.fields),
                ChangeKind::Updated => self.tracker.track_update(&project_id, entity.clone(), &change.fields),
                ChangeKind::Deleted => self.tracker.track_delete(&project_id, entity.clone()),
            }
        }

        self.pending_snapshots_mut()
            .entry(project_id.clone())
            .or_default()
            .push(snapshot);

        self.events.emit(SyncEvent::ProjectChanged {
            project_id: project_id.clone(),
            timestamp: now_millis(),
        });

        if self.store.active_project_id().as_deref() == Some(project_id.as_str()) {
            self.schedule_persist();
        } else {
            // Only the active project persists live
            self.commit_snapshots(&project_id);
            self.enqueue_pending(&project_id);
        }

        Ok(MutationOutcome {
            project_id,
            changes,
        })
    }

    /// Settle the latest stored conflict of a project.
    pub async fn resolve_conflict(
        &self,
        project_id: &str,
        choice: ResolutionChoice,
    ) -> Result<ResolvedConflict> {
        let record = self
            .resolver
            .store()
            .pending(project_id)
            .pop()
            .ok_or_else(|| SyncError::NotFound(format!("conflict for project {project_id}")))?;

        let tombstones = if self.is_online() {
            match self.remote.get_tombstone_ids(project_id).await {
                Ok(ids) => ids,
                Err(e) => {
                    debug!("Resolving {} without fresh tombstones: {}", project_id, e);
                    Default::default()
                }
            }
        } else {
            Default::default()
        };

        let ctx = self.merge_context(project_id);
        let local = self
            .store
            .get(project_id)
            .ok_or_else(|| SyncError::NotFound(format!("project {project_id}")))?;
        let resolved =
            self.resolver
                .resolve_conflict(project_id, choice, &local, &record.remote, &tombstones, &ctx);

        let pending = resolved.project.pending_sync;
        self.store.update(project_id, |project| {
            let version = project.version;
            *project = resolved.project.clone();
            project.version = project.version.max(version);
        });
        self.events.emit(SyncEvent::ProjectChanged {
            project_id: project_id.to_string(),
            timestamp: now_millis(),
        });

        if pending {
            if self.store.active_project_id().as_deref() == Some(project_id) {
                self.schedule_persist();
            } else {
                self.enqueue_pending(project_id);
            }
        }
        Ok(resolved)
    }

    // ==================== Local persistence ====================

    /// Restore projects, queue and watermarks from the local store.
    pub async fn load_from_local(&self) -> Result<usize> {
        let projects = self.local.load_projects().await?;
        let queue = self.local.load_queue().await?;
        let watermarks = self.local.load_watermarks().await?;

        let count = projects.len();
        let queued = queue.entries.len();
        *self.full_upload_mut() = projects
            .iter()
            .filter(|p| p.pending_sync)
            .map(|p| p.id.clone())
            .collect();
        self.store.replace_all(projects);
        self.queue.restore(queue);
        *self.watermarks_mut() = watermarks;
        self.last_saved_fingerprint
            .store(self.dirty_fingerprint(), Ordering::SeqCst);

        info!("Loaded {} project(s) and {} queued action(s) from local store", count, queued);
        Ok(count)
    }

    // ==================== Internals ====================

    fn pending_snapshots_mut(&self) -> MutexGuard<'_, HashMap<ProjectId, Vec<SnapshotId>>> {
        self.pending_snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn full_upload_mut(&self) -> MutexGuard<'_, HashSet<ProjectId>> {
        self.full_upload.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_persist_state(&self, project_id: &str, state: PersistState) {
        let previous = self
            .persist_states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project_id.to_string(), state);
        if previous != Some(state) {
            self.events.emit(SyncEvent::PersistStateChanged {
                project_id: project_id.to_string(),
                state,
            });
        }
    }

    fn project_has_pending(&self, project_id: &str) -> bool {
        self.tracker.has_pending_changes(project_id)
            || self.store.get(project_id).is_some_and(|p| p.pending_sync)
    }

    /// Locks, pending entity ids and the last agreed point for a project.
    fn merge_context(&self, project_id: &str) -> MergeContext {
        let mut pending_entities = self.tracker.pending_entity_ids(project_id);
        pending_entities.extend(
            self.queue
                .entries()
                .into_iter()
                .filter(|e| e.project_id == project_id)
                .map(|e| e.entity_id),
        );
        MergeContext {
            locked_fields: self.tracker.locked_fields(project_id),
            pending_entities,
            base_synced_at: self.watermarks_mut().last_synced.get(project_id).copied(),
        }
    }

    fn record_conflict(&self, record: ConflictRecord) {
        let event = record.to_event();
        info!(
            "Stored conflict {} on {} ({})",
            record.id,
            record.project_id,
            event.conflicted_fields.join(", ")
        );
        self.resolver.store().record(record);
        self.events.emit(SyncEvent::ConflictDetected(event));
    }
}
