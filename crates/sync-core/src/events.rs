//! Event infrastructure for the sync core.
//!
//! Provides `SyncEvent` for UI/observability consumers and `EventBus` for
//! subscriptions. Conflicts are also exposed as a `futures::Stream` via
//! [`EventBus::conflict_stream`].

use futures::Stream;
use futures::channel::mpsc;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};

/// Severity of a user-facing notification. Never blocking.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Persistence state of a single project.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PersistState {
    #[default]
    Idle,
    Persisting,
    Confirmed,
    Conflict,
    Failed,
}

/// A stored conflict, announced without interrupting the user.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEvent {
    pub project_id: String,
    pub record_id: String,
    pub conflicted_fields: Vec<String>,
    pub conflict_count: usize,
    pub reason: String,
}

/// Events emitted by the sync core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A merge found true concurrent edits; a conflict record was stored.
    ConflictDetected(ConflictEvent),
    /// Project state changed (local mutation, merge, rollback).
    ProjectChanged {
        #[serde(rename = "projectId")]
        project_id: String,
        /// When the change was applied, in milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// An optimistic mutation was reverted; the UI should re-render.
    SnapshotRolledBack {
        #[serde(rename = "projectId")]
        project_id: String,
        label: String,
    },
    PersistStateChanged {
        #[serde(rename = "projectId")]
        project_id: String,
        state: PersistState,
    },
    /// A queued action failed permanently and was moved aside.
    ActionFailed {
        #[serde(rename = "entryId")]
        entry_id: String,
        #[serde(rename = "entityId")]
        entity_id: String,
        error: String,
    },
    /// The action queue cannot drain.
    QueuePressure {
        #[serde(rename = "queueSize")]
        queue_size: usize,
        #[serde(rename = "deadLetters")]
        dead_letters: usize,
        frozen: bool,
    },
    /// The previously active project is no longer reachable remotely.
    ActiveProjectLost {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    /// A project missing remotely was kept because it holds user data.
    LocalOnlyProjectRetained {
        #[serde(rename = "projectId")]
        project_id: String,
        #[serde(rename = "taskCount")]
        task_count: usize,
    },
    /// Non-blocking user-facing message.
    Notification {
        level: NotificationLevel,
        message: String,
    },
    /// Age of the oldest unsynced local change, for staleness alarms.
    StaleChanges {
        #[serde(rename = "oldestChangeMs")]
        oldest_change_ms: u64,
    },
}

/// Current time in milliseconds since Unix epoch.
pub fn now_millis() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Stream of conflict events only.
    pub fn conflict_stream(self: &Arc<Self>) -> ConflictStream {
        let (tx, rx) = mpsc::unbounded();
        let subscription = self.subscribe(move |event| {
            if let SyncEvent::ConflictDetected(conflict) = event {
                let _ = tx.unbounded_send(conflict);
            }
        });
        ConflictStream {
            _subscription: subscription,
            rx,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Conflict events as an async stream. Unsubscribes when dropped.
pub struct ConflictStream {
    _subscription: Subscription,
    rx: mpsc::UnboundedReceiver<ConflictEvent>,
}

impl Stream for ConflictStream {
    type Item = ConflictEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn changed(project_id: &str) -> SyncEvent {
        SyncEvent::ProjectChanged {
            project_id: project_id.into(),
            timestamp: 1000.0,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(changed("p1"));

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(changed("p1"));
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(changed("p2"));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_conflict_stream_filters_other_events() {
        let bus = Arc::new(EventBus::new());
        let mut stream = bus.conflict_stream();

        bus.emit(changed("p1"));
        bus.emit(SyncEvent::ConflictDetected(ConflictEvent {
            project_id: "p1".into(),
            record_id: "r1".into(),
            conflicted_fields: vec!["content".into()],
            conflict_count: 1,
            reason: "locked field".into(),
        }));

        let event = stream.next().await.unwrap();
        assert_eq!(event.record_id, "r1");
        assert_eq!(event.conflicted_fields, vec!["content".to_string()]);
    }

    #[test]
    fn test_sync_event_serialization() {
        let event = SyncEvent::QueuePressure {
            queue_size: 3,
            dead_letters: 1,
            frozen: true,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"queuePressure\""));
        assert!(json.contains("\"queueSize\":3"));
        assert!(json.contains("\"frozen\":true"));
    }
}
