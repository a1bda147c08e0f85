//! Single-writer project store.
//!
//! All project state lives behind one `RwLock`; guards are never held across
//! an `.await`. The active project identity is published on a
//! `tokio::sync::watch` channel with an epoch that bumps on every switch, so
//! in-flight network calls can be cancelled when the user moves on.

use crate::error::{Result, SyncError};
use crate::model::{Project, ProjectId};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// Which project the user is looking at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveProject {
    pub project_id: Option<ProjectId>,
    /// Bumped on every change of `project_id`.
    pub epoch: u64,
}

/// Held while a mutation and its snapshot are applied. Released on drop.
pub struct UpdateGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct ProjectStore {
    projects: RwLock<BTreeMap<ProjectId, Project>>,
    updating: AtomicBool,
    active: watch::Sender<ActiveProject>,
}

impl Default for ProjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectStore {
    pub fn new() -> Self {
        let (active, _) = watch::channel(ActiveProject::default());
        Self {
            projects: RwLock::new(BTreeMap::new()),
            updating: AtomicBool::new(false),
            active,
        }
    }

    /// Take the "is updating" guard. Concurrent callers are rejected, not queued.
    pub fn begin_update(&self) -> Result<UpdateGuard<'_>> {
        self.updating
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| SyncError::Busy)?;
        Ok(UpdateGuard {
            flag: &self.updating,
        })
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    // ==================== Reads ====================

    pub fn get(&self, project_id: &str) -> Option<Project> {
        self.read().get(project_id).cloned()
    }

    pub fn contains(&self, project_id: &str) -> bool {
        self.read().contains_key(project_id)
    }

    pub fn all(&self) -> Vec<Project> {
        self.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<ProjectId> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash over every project's fingerprint, for the autosave dirty check.
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for (id, project) in self.read().iter() {
            id.hash(&mut hasher);
            project.fingerprint().hash(&mut hasher);
        }
        hasher.finish()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ProjectId, Project>> {
        self.projects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ProjectId, Project>> {
        self.projects.write().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Writes ====================

    /// Insert or replace a project.
    pub fn insert(&self, project: Project) {
        self.write().insert(project.id.clone(), project);
    }

    pub fn remove(&self, project_id: &str) -> Option<Project> {
        self.write().remove(project_id)
    }

    pub fn replace_all(&self, projects: Vec<Project>) {
        let mut map = self.write();
        map.clear();
        for project in projects {
            map.insert(project.id.clone(), project);
        }
    }

    /// Mutate one project in place under the write lock.
    pub fn update<R>(&self, project_id: &str, f: impl FnOnce(&mut Project) -> R) -> Option<R> {
        self.write().get_mut(project_id).map(f)
    }

    // ==================== Active project ====================

    pub fn active(&self) -> ActiveProject {
        self.active.borrow().clone()
    }

    pub fn active_project_id(&self) -> Option<ProjectId> {
        self.active.borrow().project_id.clone()
    }

    /// Switch the active project. Returns the new epoch.
    pub fn set_active(&self, project_id: Option<ProjectId>) -> u64 {
        self.active.send_if_modified(|active| {
            if active.project_id == project_id {
                return false;
            }
            debug!("Active project {:?} -> {:?}", active.project_id, project_id);
            active.project_id = project_id;
            active.epoch += 1;
            true
        });
        self.active.borrow().epoch
    }

    pub fn watch_active(&self) -> watch::Receiver<ActiveProject> {
        self.active.subscribe()
    }

    /// Run a network call, cancelling it if the active project switches
    /// before it completes. A result that lands after a switch is dropped.
    pub async fn run_cancellable<F: Future>(&self, fut: F) -> Result<F::Output> {
        let mut rx = self.active.subscribe();
        let epoch = rx.borrow_and_update().epoch;

        tokio::select! {
            output = fut => {
                if self.active.borrow().epoch == epoch {
                    Ok(output)
                } else {
                    Err(SyncError::Cancelled)
                }
            }
            _ = wait_for_switch(&mut rx, epoch) => {
                debug!("Active project switched; cancelling in-flight call");
                Err(SyncError::Cancelled)
            }
        }
    }
}

async fn wait_for_switch(rx: &mut watch::Receiver<ActiveProject>, epoch: u64) {
    loop {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if rx.borrow_and_update().epoch != epoch {
            return;
        }
    }
}
