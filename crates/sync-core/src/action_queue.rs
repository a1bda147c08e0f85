//! Durable, ordered queue of mutations awaiting remote confirmation.
//!
//! Entries are processed FIFO by per-kind processors. Transient failures
//! are retried with exponential backoff; an entry waiting on backoff holds
//! back later entries for the same entity so per-entity order survives
//! retries. Entries that fail permanently move to a dead-letter list and the
//! queue is flagged frozen until someone looks at them.

use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::model::ProjectId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use web_time::Instant;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("No processor registered for: {}", format_kinds(.0))]
    MissingProcessors(Vec<ActionKind>),
}

fn format_kinds(kinds: &[ActionKind]) -> String {
    kinds
        .iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Project,
    Task,
    Connection,
}

/// Processor registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionKind {
    pub action: ActionType,
    pub entity_type: EntityType,
}

impl ActionKind {
    pub const fn new(action: ActionType, entity_type: EntityType) -> Self {
        Self {
            action,
            entity_type,
        }
    }

    /// Every kind the coordinator can enqueue.
    pub fn all() -> Vec<ActionKind> {
        let mut kinds = Vec::with_capacity(9);
        for entity_type in [EntityType::Project, EntityType::Task, EntityType::Connection] {
            for action in [ActionType::Create, ActionType::Update, ActionType::Delete] {
                kinds.push(ActionKind::new(action, entity_type));
            }
        }
        kinds
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{:?}", self.entity_type, self.action)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionQueueEntry {
    pub id: String,
    pub action: ActionType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub project_id: ProjectId,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(skip)]
    next_attempt_at: Option<Instant>,
}

impl ActionQueueEntry {
    pub fn new(
        action: ActionType,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        project_id: impl Into<ProjectId>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action,
            entity_type,
            entity_id: entity_id.into(),
            project_id: project_id.into(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    pub fn kind(&self) -> ActionKind {
        ActionKind::new(self.action, self.entity_type)
    }

    fn same_entity(&self, other: &ActionQueueEntry) -> bool {
        self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.project_id == other.project_id
    }

    fn waiting(&self, now: Instant) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }
}

/// Handles one kind of queued action against the remote store.
///
/// Implementations must be idempotent: replaying an entry that already
/// reached the remote must leave the remote unchanged.
#[async_trait]
pub trait ActionProcessor: Send + Sync {
    async fn process(&self, entry: &ActionQueueEntry) -> std::result::Result<(), SyncError>;
}

/// Adapter for registering a closure as a processor.
pub struct FnProcessor<F>(pub F);

#[async_trait]
impl<F, Fut> ActionProcessor for FnProcessor<F>
where
    F: Fn(ActionQueueEntry) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), SyncError>> + Send,
{
    async fn process(&self, entry: &ActionQueueEntry) -> std::result::Result<(), SyncError> {
        (self.0)(entry.clone()).await
    }
}

/// Backoff policy for failed entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Attempts (including the first) before an entry is dead-lettered
    pub max_attempts: u32,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt`, with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = calculate_backoff(attempt, self);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        Duration::from_secs_f64((base.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()))
    }
}

/// Exponential backoff without jitter. `attempt` starts at 1.
pub fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let delay_secs = policy.initial_delay.as_secs_f64()
        * policy.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(policy.max_delay.as_secs_f64()))
}

/// What `enqueue` did with an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(String),
    /// Folded into an existing entry with this id.
    Coalesced(String),
    /// A delete cancelled a create that never reached the remote.
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Waiting on backoff, or held behind an earlier entry for the same entity.
    pub deferred: usize,
    pub remaining: usize,
    /// Nothing ran because the queue was paused or already draining.
    pub skipped: bool,
}

/// Serializable queue contents for the local store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub entries: Vec<ActionQueueEntry>,
    #[serde(default)]
    pub dead_letters: Vec<ActionQueueEntry>,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<ActionQueueEntry>,
    dead_letters: Vec<ActionQueueEntry>,
    in_flight: Option<String>,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ActionQueue {
    state: Mutex<QueueState>,
    processors: RwLock<HashMap<ActionKind, Arc<dyn ActionProcessor>>>,
    policy: RetryPolicy,
    paused: AtomicBool,
    draining: AtomicBool,
    frozen: AtomicBool,
    events: Option<Arc<EventBus>>,
}

impl ActionQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            processors: RwLock::new(HashMap::new()),
            policy,
            paused: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            events: None,
        }
    }

    pub fn with_events(policy: RetryPolicy, events: Arc<EventBus>) -> Self {
        Self {
            events: Some(events),
            ..Self::new(policy)
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Register the processor for `kind`. Returns false if one already exists.
    pub fn register_processor(&self, kind: ActionKind, processor: Arc<dyn ActionProcessor>) -> bool {
        let mut processors = self.processors.write().unwrap_or_else(|e| e.into_inner());
        if processors.contains_key(&kind) {
            return false;
        }
        processors.insert(kind, processor);
        true
    }

    /// Kinds from `required` that have no processor.
    pub fn validate_processors(&self, required: &[ActionKind]) -> Vec<ActionKind> {
        let processors = self.processors.read().unwrap_or_else(|e| e.into_inner());
        required
            .iter()
            .filter(|kind| !processors.contains_key(kind))
            .copied()
            .collect()
    }

    /// Fail if any of `required` has no processor.
    pub fn ensure_processors(&self, required: &[ActionKind]) -> Result<()> {
        let missing = self.validate_processors(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(QueueError::MissingProcessors(missing))
        }
    }

    pub fn enqueue(&self, entry: ActionQueueEntry) -> EnqueueOutcome {
        let mut state = self.state();
        let QueueState {
            entries, in_flight, ..
        } = &mut *state;
        let in_flight = in_flight.as_deref();

        // Latest queued entry for the same entity that is not mid-flight
        let previous = entries
            .iter()
            .rposition(|e| e.same_entity(&entry) && in_flight != Some(e.id.as_str()));

        match (entry.action, previous.map(|i| entries[i].action)) {
            (ActionType::Update, Some(ActionType::Create | ActionType::Update)) => {
                let Some(existing) = previous.and_then(|i| entries.get_mut(i)) else {
                    return EnqueueOutcome::Queued(entry.id);
                };
                merge_payload(&mut existing.payload, entry.payload);
                debug!("Coalesced update for {} into {}", entry.entity_id, existing.id);
                EnqueueOutcome::Coalesced(existing.id.clone())
            }
            (ActionType::Delete, Some(_)) => {
                let had_create = entries.iter().any(|e| {
                    e.same_entity(&entry)
                        && e.action == ActionType::Create
                        && in_flight != Some(e.id.as_str())
                });
                entries.retain(|e| !e.same_entity(&entry) || in_flight == Some(e.id.as_str()));
                if had_create {
                    debug!("Delete of {} cancelled an unsent create", entry.entity_id);
                    EnqueueOutcome::Cancelled
                } else {
                    let id = entry.id.clone();
                    entries.push_back(entry);
                    EnqueueOutcome::Queued(id)
                }
            }
            _ => {
                let id = entry.id.clone();
                entries.push_back(entry);
                EnqueueOutcome::Queued(id)
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue_size() == 0
    }

    pub fn entries(&self) -> Vec<ActionQueueEntry> {
        self.state().entries.iter().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<ActionQueueEntry> {
        self.state().dead_letters.clone()
    }

    pub fn has_entries_for(&self, project_id: &str) -> bool {
        self.state()
            .entries
            .iter()
            .any(|e| e.project_id == project_id)
    }

    /// Drop everything queued for a project (after it was deleted).
    pub fn remove_project(&self, project_id: &str) -> usize {
        let mut state = self.state();
        let before = state.entries.len();
        state.entries.retain(|e| e.project_id != project_id);
        before - state.entries.len()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn unfreeze(&self) {
        if self.frozen.swap(false, Ordering::SeqCst) {
            info!("Action queue unfrozen");
        }
    }

    /// Move dead letters back onto the queue with a fresh attempt budget.
    pub fn retry_dead_letters(&self) -> usize {
        let count = {
            let mut state = self.state();
            let dead: Vec<_> = state.dead_letters.drain(..).collect();
            let count = dead.len();
            for mut entry in dead {
                entry.retry_count = 0;
                entry.next_attempt_at = None;
                state.entries.push_back(entry);
            }
            count
        };
        self.unfreeze();
        count
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state();
        QueueSnapshot {
            entries: state.entries.iter().cloned().collect(),
            dead_letters: state.dead_letters.clone(),
        }
    }

    /// Replace queue contents with a persisted snapshot.
    pub fn restore(&self, snapshot: QueueSnapshot) {
        let frozen = !snapshot.dead_letters.is_empty();
        {
            let mut state = self.state();
            state.entries = snapshot.entries.into();
            state.dead_letters = snapshot.dead_letters;
        }
        self.frozen.store(frozen, Ordering::SeqCst);
    }

    /// Run one pass over the queue.
    ///
    /// Does nothing while paused, or when another pass is already running.
    pub async fn process_queue(&self) -> ProcessReport {
        let mut report = ProcessReport::default();
        if self.is_paused() {
            report.skipped = true;
            report.remaining = self.queue_size();
            return report;
        }
        if self.draining.swap(true, Ordering::SeqCst) {
            report.skipped = true;
            report.remaining = self.queue_size();
            return report;
        }
        let _guard = DrainGuard(&self.draining);

        let now = Instant::now();
        let pending = self.entries();
        let mut blocked: HashSet<(ProjectId, EntityType, String)> = HashSet::new();
        let mut newly_dead = 0;

        for entry in pending {
            if self.is_paused() {
                debug!("Queue paused mid-pass; stopping");
                break;
            }

            let key = (
                entry.project_id.clone(),
                entry.entity_type,
                entry.entity_id.clone(),
            );
            if blocked.contains(&key) || entry.waiting(now) {
                blocked.insert(key);
                report.deferred += 1;
                continue;
            }

            // Re-read: the entry may have been cancelled or coalesced since the pass began
            let Some(entry) = self.begin(&entry.id) else {
                continue;
            };

            let processor = self
                .processors
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&entry.kind())
                .cloned();

            let result = match processor {
                Some(processor) => processor.process(&entry).await,
                None => Err(SyncError::Unexpected(format!(
                    "no processor registered for {}",
                    entry.kind()
                ))),
            };

            match result {
                Ok(()) => {
                    self.finish(&entry.id);
                    report.processed += 1;
                }
                Err(e) if e.is_retryable() && entry.retry_count + 1 < self.policy.max_attempts => {
                    let attempt = entry.retry_count + 1;
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "Action {} for {} failed (attempt {}), retrying in {:?}: {}",
                        entry.kind(),
                        entry.entity_id,
                        attempt,
                        delay,
                        e
                    );
                    self.reschedule(&entry.id, e.to_string(), Instant::now() + delay);
                    blocked.insert(key);
                    report.retried += 1;
                }
                Err(e) => {
                    warn!(
                        "Action {} for {} failed permanently: {}",
                        entry.kind(),
                        entry.entity_id,
                        e
                    );
                    self.dead_letter(&entry.id, e.to_string());
                    self.emit(SyncEvent::ActionFailed {
                        entry_id: entry.id.clone(),
                        entity_id: entry.entity_id.clone(),
                        error: e.to_string(),
                    });
                    blocked.insert(key);
                    report.failed += 1;
                    newly_dead += 1;
                }
            }
        }

        report.remaining = self.queue_size();

        if newly_dead > 0 {
            self.frozen.store(true, Ordering::SeqCst);
            let dead_letters = self.state().dead_letters.len();
            self.emit(SyncEvent::QueuePressure {
                queue_size: report.remaining,
                dead_letters,
                frozen: true,
            });
        }

        report
    }

    /// Process until the queue is empty or nothing is ready to run.
    pub async fn drain(&self) -> ProcessReport {
        let mut total = ProcessReport::default();
        loop {
            let pass = self.process_queue().await;
            total.processed += pass.processed;
            total.retried += pass.retried;
            total.failed += pass.failed;
            total.remaining = pass.remaining;
            total.deferred = pass.deferred;
            total.skipped = pass.skipped;
            if pass.skipped || pass.processed + pass.failed + pass.retried == 0 || pass.remaining == 0 {
                return total;
            }
        }
    }

    fn begin(&self, id: &str) -> Option<ActionQueueEntry> {
        let mut state = self.state();
        let entry = state.entries.iter().find(|e| e.id == id).cloned()?;
        state.in_flight = Some(entry.id.clone());
        Some(entry)
    }

    fn finish(&self, id: &str) {
        let mut state = self.state();
        state.entries.retain(|e| e.id != id);
        state.in_flight = None;
    }

    fn reschedule(&self, id: &str, error: String, next_attempt_at: Instant) {
        let mut state = self.state();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            entry.retry_count += 1;
            entry.last_error = Some(error);
            entry.next_attempt_at = Some(next_attempt_at);
        }
        state.in_flight = None;
    }

    fn dead_letter(&self, id: &str, error: String) {
        let mut state = self.state();
        if let Some(pos) = state.entries.iter().position(|e| e.id == id) {
            if let Some(mut entry) = state.entries.remove(pos) {
                entry.retry_count += 1;
                entry.last_error = Some(error);
                state.dead_letters.push(entry);
            }
        }
        state.in_flight = None;
    }
}

/// Shallow-merge `incoming` into `existing`; non-object payloads replace.
fn merge_payload(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(update)) => {
            for (key, value) in update {
                current.insert(key, value);
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 2.0,
            max_attempts,
            jitter: 0.0,
        }
    }

    fn task_entry(action: ActionType, task_id: &str, payload: Value) -> ActionQueueEntry {
        ActionQueueEntry::new(action, EntityType::Task, task_id, "p1", payload)
    }

    fn counting(count: Arc<AtomicUsize>) -> Arc<dyn ActionProcessor> {
        Arc::new(FnProcessor(move |_entry: ActionQueueEntry| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<(), SyncError>(())
            }
        }))
    }

    fn failing(error: fn() -> SyncError) -> Arc<dyn ActionProcessor> {
        Arc::new(FnProcessor(move |_entry: ActionQueueEntry| async move {
            Err::<(), SyncError>(error())
        }))
    }

    fn register_all(queue: &ActionQueue, processor: Arc<dyn ActionProcessor>) {
        for kind in ActionKind::all() {
            queue.register_processor(kind, Arc::clone(&processor));
        }
    }

    // ==================== Backoff ====================

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(calculate_backoff(1, &policy), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &policy), Duration::from_secs(2));
        assert_eq!(calculate_backoff(4, &policy), Duration::from_secs(8));
        assert_eq!(calculate_backoff(20, &policy), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_secs_f64(3.6));
            assert!(delay <= Duration::from_secs_f64(4.4));
        }
    }

    // ==================== Registration ====================

    #[test]
    fn test_register_processor_rejects_duplicates() {
        let queue = ActionQueue::new(RetryPolicy::default());
        let kind = ActionKind::new(ActionType::Update, EntityType::Task);
        let count = Arc::new(AtomicUsize::new(0));

        assert!(queue.register_processor(kind, counting(Arc::clone(&count))));
        assert!(!queue.register_processor(kind, counting(count)));
    }

    #[test]
    fn test_validate_processors_lists_missing() {
        let queue = ActionQueue::new(RetryPolicy::default());
        let update = ActionKind::new(ActionType::Update, EntityType::Task);
        let delete = ActionKind::new(ActionType::Delete, EntityType::Task);
        queue.register_processor(update, counting(Arc::new(AtomicUsize::new(0))));

        assert_eq!(queue.validate_processors(&[update, delete]), vec![delete]);
        assert!(matches!(
            queue.ensure_processors(&[update, delete]),
            Err(QueueError::MissingProcessors(_))
        ));
        assert!(queue.ensure_processors(&[update]).is_ok());
    }

    // ==================== Coalescing ====================

    #[test]
    fn test_updates_coalesce_into_pending_entry() {
        let queue = ActionQueue::new(RetryPolicy::default());
        let first = queue.enqueue(task_entry(ActionType::Create, "t1", json!({"title": "a"})));
        let second = queue.enqueue(task_entry(ActionType::Update, "t1", json!({"content": "b"})));

        let EnqueueOutcome::Queued(first_id) = first else {
            panic!("expected queued");
        };
        assert_eq!(second, EnqueueOutcome::Coalesced(first_id));
        assert_eq!(queue.queue_size(), 1);
        assert_eq!(queue.entries()[0].payload, json!({"title": "a", "content": "b"}));
    }

    #[test]
    fn test_delete_cancels_unsent_create() {
        let queue = ActionQueue::new(RetryPolicy::default());
        queue.enqueue(task_entry(ActionType::Create, "t1", json!({})));
        queue.enqueue(task_entry(ActionType::Update, "t2", json!({})));

        assert_eq!(
            queue.enqueue(task_entry(ActionType::Delete, "t1", json!({}))),
            EnqueueOutcome::Cancelled
        );
        assert_eq!(queue.queue_size(), 1);
        assert_eq!(queue.entries()[0].entity_id, "t2");
    }

    #[test]
    fn test_delete_replaces_pending_updates() {
        let queue = ActionQueue::new(RetryPolicy::default());
        queue.enqueue(task_entry(ActionType::Update, "t1", json!({"title": "x"})));
        queue.enqueue(task_entry(ActionType::Delete, "t1", json!({})));

        let entries = queue.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, ActionType::Delete);
    }

    // ==================== Processing ====================

    #[tokio::test]
    async fn test_processes_fifo_and_removes_on_success() {
        let queue = ActionQueue::new(fast_policy(3));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        register_all(
            &queue,
            Arc::new(FnProcessor(move |entry: ActionQueueEntry| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    seen.lock().unwrap().push(entry.entity_id);
                    Ok::<(), SyncError>(())
                }
            })),
        );

        for id in ["t1", "t2", "t3"] {
            queue.enqueue(task_entry(ActionType::Update, id, json!({})));
        }

        let report = queue.process_queue().await;
        assert_eq!(report.processed, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(*seen.lock().unwrap(), vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn test_paused_queue_processes_nothing() {
        let queue = ActionQueue::new(fast_policy(3));
        let count = Arc::new(AtomicUsize::new(0));
        register_all(&queue, counting(Arc::clone(&count)));
        queue.enqueue(task_entry(ActionType::Update, "t1", json!({})));

        queue.pause();
        let report = queue.process_queue().await;
        assert!(report.skipped);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        queue.resume();
        queue.process_queue().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_blocks_same_entity_only() {
        let queue = ActionQueue::new(RetryPolicy {
            initial_delay: Duration::from_secs(30),
            jitter: 0.0,
            ..RetryPolicy::default()
        });
        let count = Arc::new(AtomicUsize::new(0));
        register_all(&queue, counting(Arc::clone(&count)));
        let update = ActionKind::new(ActionType::Update, EntityType::Task);
        queue.processors.write().unwrap().insert(
            update,
            failing(|| SyncError::Network("offline".into())),
        );

        // Restored directly so the two t1 entries are not coalesced
        queue.restore(QueueSnapshot {
            entries: vec![
                task_entry(ActionType::Update, "t1", json!({})),
                task_entry(ActionType::Delete, "t1", json!({})),
                task_entry(ActionType::Create, "t2", json!({})),
            ],
            dead_letters: Vec::new(),
        });

        let report = queue.process_queue().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let entries = queue.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].retry_count, 1);
        assert!(entries[0].last_error.as_deref().unwrap().contains("offline"));
        assert_eq!(entries[1].action, ActionType::Delete);

        // Still waiting on backoff
        let report = queue.process_queue().await;
        assert_eq!(report.deferred, 2);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_failure_in_one_project_does_not_block_same_id_in_another() {
        let queue = ActionQueue::new(RetryPolicy {
            initial_delay: Duration::from_secs(30),
            jitter: 0.0,
            ..RetryPolicy::default()
        });
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        register_all(
            &queue,
            Arc::new(FnProcessor(move |entry: ActionQueueEntry| {
                let seen = Arc::clone(&seen);
                async move {
                    if entry.project_id == "p1" {
                        return Err::<(), SyncError>(SyncError::Network("offline".into()));
                    }
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
        );

        queue.restore(QueueSnapshot {
            entries: vec![
                task_entry(ActionType::Update, "t1", json!({})),
                ActionQueueEntry::new(ActionType::Update, EntityType::Task, "t1", "p2", json!({})),
            ],
            dead_letters: Vec::new(),
        });

        let report = queue.process_queue().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.deferred, 0);
        assert_eq!(report.processed, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let entries = queue.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].project_id, "p1");
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_and_freeze() {
        let bus = Arc::new(EventBus::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let _sub = bus.subscribe(move |event| events_clone.lock().unwrap().push(event));

        let queue = ActionQueue::with_events(fast_policy(2), Arc::clone(&bus));
        register_all(&queue, failing(|| SyncError::Network("down".into())));
        queue.enqueue(task_entry(ActionType::Update, "t1", json!({})));

        let first = queue.process_queue().await;
        assert_eq!(first.retried, 1);
        assert!(!queue.is_frozen());

        let second = queue.process_queue().await;
        assert_eq!(second.failed, 1);
        assert!(queue.is_frozen());
        assert_eq!(queue.queue_size(), 0);
        assert_eq!(queue.dead_letters().len(), 1);

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::ActionFailed { entity_id, .. } if entity_id == "t1")));
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::QueuePressure { frozen: true, .. })));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_dead_letters_immediately() {
        let queue = ActionQueue::new(fast_policy(5));
        register_all(&queue, failing(|| SyncError::Permission("read-only".into())));
        queue.enqueue(task_entry(ActionType::Update, "t1", json!({})));

        let report = queue.process_queue().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);

        assert_eq!(queue.retry_dead_letters(), 1);
        assert!(!queue.is_frozen());
        assert_eq!(queue.queue_size(), 1);
        assert_eq!(queue.entries()[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_missing_processor_is_surfaced_not_dropped() {
        let queue = ActionQueue::new(fast_policy(3));
        queue.enqueue(task_entry(ActionType::Update, "t1", json!({})));

        let report = queue.process_queue().await;
        assert_eq!(report.failed, 1);
        assert_eq!(queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_runs_until_empty() {
        let queue = ActionQueue::new(fast_policy(3));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        register_all(
            &queue,
            Arc::new(FnProcessor(move |_entry: ActionQueueEntry| {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(SyncError::Network("flaky".into()))
                    } else {
                        Ok(())
                    }
                }
            })),
        );
        queue.enqueue(task_entry(ActionType::Update, "t1", json!({})));

        let report = queue.drain().await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_snapshot_restore_roundtrip_through_json() {
        let queue = ActionQueue::new(RetryPolicy::default());
        queue.enqueue(task_entry(ActionType::Update, "t1", json!({"title": "x"})));

        let json = serde_json::to_string(&queue.snapshot()).unwrap();
        let restored = ActionQueue::new(RetryPolicy::default());
        restored.restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.entries(), queue.entries());
        assert!(!restored.is_frozen());
    }
}
