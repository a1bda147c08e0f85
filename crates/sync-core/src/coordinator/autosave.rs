//! Periodic local durability and housekeeping.

use super::SyncCoordinator;
use crate::events::SyncEvent;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutosaveReport {
    /// The local store was written this tick.
    pub saved: bool,
    pub expired_snapshots: usize,
    pub expired_locks: usize,
}

impl SyncCoordinator {
    /// Cheap change detector over everything `save_local` writes.
    pub(super) fn dirty_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.store.fingerprint().hash(&mut hasher);
        self.queue.queue_size().hash(&mut hasher);
        self.queue.dead_letters().len().hash(&mut hasher);
        hasher.finish()
    }

    /// One autosave round.
    ///
    /// Commits snapshots past their bounded wait, drops expired field locks,
    /// reports the age of the oldest unsynced change and writes the local
    /// store only when something changed since the last write.
    pub async fn autosave_tick(&self) -> AutosaveReport {
        let expired = self.snapshots.expire_stale();
        if !expired.is_empty() {
            let mut pending = self.pending_snapshots_mut();
            for ids in pending.values_mut() {
                ids.retain(|id| !expired.contains(id));
            }
            pending.retain(|_, ids| !ids.is_empty());
            debug!("Committed {} snapshot(s) past their wait", expired.len());
        }

        let expired_locks = self.tracker.cleanup_expired();

        if let Some(age) = self.tracker.oldest_change_age(None) {
            self.events.emit(SyncEvent::StaleChanges {
                oldest_change_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
            });
        }

        let dirty = self.dirty_fingerprint() != self.last_saved_fingerprint.load(Ordering::SeqCst);
        let saved = dirty && self.save_local().await;

        AutosaveReport {
            saved,
            expired_snapshots: expired.len(),
            expired_locks,
        }
    }

    /// Run [`autosave_tick`](Self::autosave_tick) every `period`, then drain
    /// the action queue if there is anything to replay. Stops once the
    /// coordinator is dropped.
    pub fn spawn_autosave(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        info!("Autosave every {:?}", period);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = this.upgrade() else {
                    debug!("Coordinator dropped; autosave stopped");
                    return;
                };
                coordinator.autosave_tick().await;
                if coordinator.is_online() && !coordinator.queue.is_empty() && !coordinator.queue.is_frozen() {
                    coordinator.replay_queue().await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::config::SyncConfig;
    use crate::local_store::LocalStore;
    use crate::mutation::{Mutation, TaskPatch};
    use std::time::Duration;

    fn retitle(title: &str) -> Mutation {
        Mutation::UpdateTask {
            project_id: "p1".into(),
            task_id: "t0".into(),
            patch: TaskPatch {
                title: Some(title.into()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_unchanged_state_skips_write() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));

        assert!(h.coordinator.autosave_tick().await.saved);
        let writes = h.local.project_writes();

        let report = h.coordinator.autosave_tick().await;
        assert!(!report.saved);
        assert_eq!(h.local.project_writes(), writes);
    }

    #[tokio::test]
    async fn test_mutation_makes_next_tick_write() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));
        h.coordinator.autosave_tick().await;

        h.coordinator.submit_mutation(retitle("Dirty")).unwrap();

        assert!(h.coordinator.autosave_tick().await.saved);
        let stored = h.local.load_projects().await.unwrap();
        assert_eq!(stored[0].task("t0").unwrap().title, "Dirty");
    }

    #[tokio::test]
    async fn test_stale_snapshots_are_committed() {
        let h = harness_with(SyncConfig {
            snapshot_timeout: Duration::ZERO,
            ..test_config()
        });
        seed_active(&h, &synced_project("p1", 1));
        h.coordinator.submit_mutation(retitle("Waiting")).unwrap();
        assert_eq!(h.coordinator.snapshots().open_count(), 1);

        let report = h.coordinator.autosave_tick().await;

        assert_eq!(report.expired_snapshots, 1);
        assert_eq!(h.coordinator.snapshots().open_count(), 0);
        assert_eq!(h.coordinator.snapshots().stats().expired, 1);
        // Still pending; the change is kept, not rolled back
        assert!(h.coordinator.project("p1").unwrap().pending_sync);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_autosave_replays_queue() {
        let h = harness();
        seed_active(&h, &synced_project("p1", 1));
        h.coordinator.set_online(false);
        h.coordinator.submit_mutation(retitle("Later")).unwrap();
        h.coordinator.persist_active_project().await;
        assert_eq!(h.coordinator.queue().queue_size(), 1);
        h.coordinator.set_online(true);

        let handle = h.coordinator.spawn_autosave(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(h.coordinator.queue().is_empty());
        assert_eq!(h.remote.project("p1").unwrap().task("t0").unwrap().title, "Later");
        handle.abort();
    }
}
