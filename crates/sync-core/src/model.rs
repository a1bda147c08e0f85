//! Project graph: projects, tasks and the connections between them.
//!
//! Every task and connection carries per-field timestamps so merges can pick
//! a winner field by field instead of replacing whole entities. A missing
//! per-field entry falls back to the entity's `updated_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

pub type ProjectId = String;
pub type TaskId = String;
pub type ConnectionId = String;

/// Structural problems that make a project unsafe to upload.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Project id is empty")]
    EmptyProjectId,

    #[error("Entity id is empty in project {0}")]
    EmptyEntityId(ProjectId),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Duplicate connection id: {0}")]
    DuplicateConnection(ConnectionId),

    #[error("Task {0} is its own parent")]
    SelfParent(TaskId),

    #[error("Connection {id} references unknown task {task}")]
    DanglingConnection { id: ConnectionId, task: TaskId },

    #[error("Malformed project payload: {0}")]
    Malformed(String),
}

/// Where the authoritative copy of a project lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncSource {
    /// Uploaded at least once and known to the remote store.
    Synced,
    /// Only exists on this device (never uploaded, or vanished remotely).
    #[default]
    LocalOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    Active,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A mergeable field of a task or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    ParentId,
    Stage,
    Order,
    Rank,
    Status,
    Title,
    Content,
    Position,
    Tags,
    Attachments,
    Priority,
    DueDate,
    DeletedAt,
    Source,
    Target,
    Description,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::ParentId => "parentId",
            Field::Stage => "stage",
            Field::Order => "order",
            Field::Rank => "rank",
            Field::Status => "status",
            Field::Title => "title",
            Field::Content => "content",
            Field::Position => "position",
            Field::Tags => "tags",
            Field::Attachments => "attachments",
            Field::Priority => "priority",
            Field::DueDate => "dueDate",
            Field::DeletedAt => "deletedAt",
            Field::Source => "source",
            Field::Target => "target",
            Field::Description => "description",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const TASK_FIELDS: &[Field] = &[
    Field::ParentId,
    Field::Stage,
    Field::Order,
    Field::Rank,
    Field::Status,
    Field::Title,
    Field::Content,
    Field::Position,
    Field::Tags,
    Field::Attachments,
    Field::Priority,
    Field::DueDate,
    Field::DeletedAt,
];

pub const CONNECTION_FIELDS: &[Field] = &[
    Field::Source,
    Field::Target,
    Field::Title,
    Field::Description,
    Field::DeletedAt,
];

/// Shared view over tasks and connections used by the merge code.
pub trait Entity: Clone {
    fn id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
    fn deleted_at(&self) -> Option<DateTime<Utc>>;
    fn restored_at(&self) -> Option<DateTime<Utc>>;
    fn fields() -> &'static [Field];
    fn field_timestamps(&self) -> &BTreeMap<Field, DateTime<Utc>>;
    fn field_timestamps_mut(&mut self) -> &mut BTreeMap<Field, DateTime<Utc>>;
    fn set_updated_at(&mut self, at: DateTime<Utc>);
    fn field_eq(&self, other: &Self, field: Field) -> bool;
    fn copy_field_from(&mut self, other: &Self, field: Field);
    fn field_json(&self, field: Field) -> Value;

    fn is_tombstone(&self) -> bool {
        self.deleted_at().is_some()
    }

    /// Timestamp of the last write to `field`.
    fn field_updated_at(&self, field: Field) -> DateTime<Utc> {
        self.field_timestamps()
            .get(&field)
            .copied()
            .unwrap_or_else(|| self.updated_at())
    }

    /// Record a write to `fields` at `at`.
    fn touch(&mut self, fields: &[Field], at: DateTime<Utc>) {
        for field in fields {
            self.field_timestamps_mut().insert(*field, at);
        }
        if at > self.updated_at() {
            self.set_updated_at(at);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub stage: Option<i64>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub rank: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    /// Tombstone marker.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Set by an explicit restore; only a restore newer than `deleted_at`
    /// may clear a tombstone during a merge.
    #[serde(default)]
    pub restored_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub field_updated_at: BTreeMap<Field, DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            stage: None,
            order: 0,
            rank: String::new(),
            status: TaskStatus::Active,
            title: title.into(),
            content: String::new(),
            position: Position::default(),
            tags: Vec::new(),
            attachments: Vec::new(),
            priority: None,
            due_date: None,
            deleted_at: None,
            restored_at: None,
            updated_at: now,
            field_updated_at: BTreeMap::new(),
        }
    }
}

impl Entity for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn restored_at(&self) -> Option<DateTime<Utc>> {
        self.restored_at
    }

    fn fields() -> &'static [Field] {
        TASK_FIELDS
    }

    fn field_timestamps(&self) -> &BTreeMap<Field, DateTime<Utc>> {
        &self.field_updated_at
    }

    fn field_timestamps_mut(&mut self) -> &mut BTreeMap<Field, DateTime<Utc>> {
        &mut self.field_updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn field_eq(&self, other: &Self, field: Field) -> bool {
        match field {
            Field::ParentId => self.parent_id == other.parent_id,
            Field::Stage => self.stage == other.stage,
            Field::Order => self.order == other.order,
            Field::Rank => self.rank == other.rank,
            Field::Status => self.status == other.status,
            Field::Title => self.title == other.title,
            Field::Content => self.content == other.content,
            Field::Position => self.position == other.position,
            Field::Tags => self.tags == other.tags,
            Field::Attachments => self.attachments == other.attachments,
            Field::Priority => self.priority == other.priority,
            Field::DueDate => self.due_date == other.due_date,
            Field::DeletedAt => self.deleted_at == other.deleted_at,
            Field::Source | Field::Target | Field::Description => true,
        }
    }

    fn copy_field_from(&mut self, other: &Self, field: Field) {
        match field {
            Field::ParentId => self.parent_id = other.parent_id.clone(),
            Field::Stage => self.stage = other.stage,
            Field::Order => self.order = other.order,
            Field::Rank => self.rank = other.rank.clone(),
            Field::Status => self.status = other.status,
            Field::Title => self.title = other.title.clone(),
            Field::Content => self.content = other.content.clone(),
            Field::Position => self.position = other.position,
            Field::Tags => self.tags = other.tags.clone(),
            Field::Attachments => self.attachments = other.attachments.clone(),
            Field::Priority => self.priority = other.priority,
            Field::DueDate => self.due_date = other.due_date,
            Field::DeletedAt => {
                self.deleted_at = other.deleted_at;
                self.restored_at = other.restored_at;
            }
            Field::Source | Field::Target | Field::Description => return,
        }
        self.field_updated_at
            .insert(field, other.field_updated_at(field));
    }

    fn field_json(&self, field: Field) -> Value {
        let value = match field {
            Field::ParentId => serde_json::to_value(&self.parent_id),
            Field::Stage => serde_json::to_value(self.stage),
            Field::Order => serde_json::to_value(self.order),
            Field::Rank => serde_json::to_value(&self.rank),
            Field::Status => serde_json::to_value(self.status),
            Field::Title => serde_json::to_value(&self.title),
            Field::Content => serde_json::to_value(&self.content),
            Field::Position => serde_json::to_value(self.position),
            Field::Tags => serde_json::to_value(&self.tags),
            Field::Attachments => serde_json::to_value(&self.attachments),
            Field::Priority => serde_json::to_value(self.priority),
            Field::DueDate => serde_json::to_value(self.due_date),
            Field::DeletedAt => serde_json::to_value(self.deleted_at),
            Field::Source | Field::Target | Field::Description => Ok(Value::Null),
        };
        value.unwrap_or(Value::Null)
    }
}

/// Directed edge between two tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub source: TaskId,
    pub target: TaskId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restored_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub field_updated_at: BTreeMap<Field, DateTime<Utc>>,
}

impl Connection {
    pub fn new(
        id: impl Into<ConnectionId>,
        source: impl Into<TaskId>,
        target: impl Into<TaskId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            title: None,
            description: None,
            deleted_at: None,
            restored_at: None,
            updated_at: now,
            field_updated_at: BTreeMap::new(),
        }
    }

    pub fn touches(&self, task_id: &str) -> bool {
        self.source == task_id || self.target == task_id
    }
}

impl Entity for Connection {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn restored_at(&self) -> Option<DateTime<Utc>> {
        self.restored_at
    }

    fn fields() -> &'static [Field] {
        CONNECTION_FIELDS
    }

    fn field_timestamps(&self) -> &BTreeMap<Field, DateTime<Utc>> {
        &self.field_updated_at
    }

    fn field_timestamps_mut(&mut self) -> &mut BTreeMap<Field, DateTime<Utc>> {
        &mut self.field_updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn field_eq(&self, other: &Self, field: Field) -> bool {
        match field {
            Field::Source => self.source == other.source,
            Field::Target => self.target == other.target,
            Field::Title => self.title == other.title,
            Field::Description => self.description == other.description,
            Field::DeletedAt => self.deleted_at == other.deleted_at,
            _ => true,
        }
    }

    fn copy_field_from(&mut self, other: &Self, field: Field) {
        match field {
            Field::Source => self.source = other.source.clone(),
            Field::Target => self.target = other.target.clone(),
            Field::Title => self.title = other.title.clone(),
            Field::Description => self.description = other.description.clone(),
            Field::DeletedAt => {
                self.deleted_at = other.deleted_at;
                self.restored_at = other.restored_at;
            }
            _ => return,
        }
        self.field_updated_at
            .insert(field, other.field_updated_at(field));
    }

    fn field_json(&self, field: Field) -> Value {
        let value = match field {
            Field::Source => serde_json::to_value(&self.source),
            Field::Target => serde_json::to_value(&self.target),
            Field::Title => serde_json::to_value(&self.title),
            Field::Description => serde_json::to_value(&self.description),
            Field::DeletedAt => serde_json::to_value(self.deleted_at),
            _ => Ok(Value::Null),
        };
        value.unwrap_or(Value::Null)
    }
}

/// Aggregate root: a project and its task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Remote-assigned version. Never decreases.
    #[serde(default)]
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_source: SyncSource,
    /// True iff an unconfirmed local mutation exists.
    #[serde(default)]
    pub pending_sync: bool,
}

/// Repairs applied by [`Project::sanitize`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizeReport {
    pub dropped_duplicate_tasks: Vec<TaskId>,
    pub dropped_duplicate_connections: Vec<ConnectionId>,
    pub cleared_self_parents: Vec<TaskId>,
    pub dropped_dangling_connections: Vec<ConnectionId>,
    pub dropped_empty_ids: usize,
}

impl SanitizeReport {
    pub fn is_empty(&self) -> bool {
        self.dropped_duplicate_tasks.is_empty()
            && self.dropped_duplicate_connections.is_empty()
            && self.cleared_self_parents.is_empty()
            && self.dropped_dangling_connections.is_empty()
            && self.dropped_empty_ids == 0
    }
}

impl Project {
    pub fn new(id: impl Into<ProjectId>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: Vec::new(),
            connections: Vec::new(),
            version: 0,
            updated_at: now,
            sync_source: SyncSource::LocalOnly,
            pending_sync: false,
        }
    }

    /// Parse a project from an untyped payload, reporting structural errors
    /// (for example a task list that is not an array) as validation failures.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        if let Some(tasks) = value.get("tasks") {
            if !tasks.is_array() {
                return Err(ValidationError::Malformed("tasks is not an array".into()));
            }
        }
        if let Some(connections) = value.get("connections") {
            if !connections.is_array() {
                return Err(ValidationError::Malformed(
                    "connections is not an array".into(),
                ));
            }
        }
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn connection_mut(&mut self, id: &str) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.id == id)
    }

    /// Tasks that are not tombstoned.
    pub fn live_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.deleted_at.is_none())
    }

    pub fn live_task_count(&self) -> usize {
        self.live_tasks().count()
    }

    /// Whether the project holds enough user data that losing it would hurt.
    pub fn has_substantial_data(&self, min_tasks: usize) -> bool {
        self.live_task_count() >= min_tasks.max(1)
    }

    /// Cheap change detector over (id, updated_at, version) tuples.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.version.hash(&mut hasher);
        self.updated_at.timestamp_millis().hash(&mut hasher);
        self.pending_sync.hash(&mut hasher);
        for task in &self.tasks {
            task.id.hash(&mut hasher);
            task.updated_at.timestamp_millis().hash(&mut hasher);
        }
        for connection in &self.connections {
            connection.id.hash(&mut hasher);
            connection.updated_at.timestamp_millis().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Copy holding only the listed tasks and connections, plus the endpoint
    /// tasks the kept connections need in order to validate.
    pub fn with_entities(&self, ids: &HashSet<String>) -> Project {
        let connections: Vec<Connection> = self
            .connections
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect();
        let endpoints: HashSet<&str> = connections
            .iter()
            .flat_map(|c| [c.source.as_str(), c.target.as_str()])
            .collect();
        let tasks = self
            .tasks
            .iter()
            .filter(|t| ids.contains(&t.id) || endpoints.contains(t.id.as_str()))
            .cloned()
            .collect();
        Project {
            id: self.id.clone(),
            name: self.name.clone(),
            tasks,
            connections,
            version: self.version,
            updated_at: self.updated_at,
            sync_source: self.sync_source,
            pending_sync: self.pending_sync,
        }
    }

    /// Compare user-visible content, ignoring sync bookkeeping.
    pub fn content_eq(&self, other: &Project) -> bool {
        if self.name != other.name
            || self.tasks.len() != other.tasks.len()
            || self.connections.len() != other.connections.len()
        {
            return false;
        }
        let theirs: HashMap<&str, &Task> =
            other.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let tasks_match = self.tasks.iter().all(|task| {
            theirs
                .get(task.id.as_str())
                .is_some_and(|other| TASK_FIELDS.iter().all(|f| task.field_eq(other, *f)))
        });
        if !tasks_match {
            return false;
        }
        let theirs: HashMap<&str, &Connection> = other
            .connections
            .iter()
            .map(|c| (c.id.as_str(), c))
            .collect();
        self.connections.iter().all(|conn| {
            theirs.get(conn.id.as_str()).is_some_and(|other| {
                CONNECTION_FIELDS.iter().all(|f| conn.field_eq(other, *f))
            })
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyProjectId);
        }

        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if task.id.is_empty() {
                return Err(ValidationError::EmptyEntityId(self.id.clone()));
            }
            if !task_ids.insert(task.id.as_str()) {
                return Err(ValidationError::DuplicateTask(task.id.clone()));
            }
            if task.parent_id.as_deref() == Some(task.id.as_str()) {
                return Err(ValidationError::SelfParent(task.id.clone()));
            }
        }

        let mut connection_ids = HashSet::new();
        for conn in &self.connections {
            if conn.id.is_empty() {
                return Err(ValidationError::EmptyEntityId(self.id.clone()));
            }
            if !connection_ids.insert(conn.id.as_str()) {
                return Err(ValidationError::DuplicateConnection(conn.id.clone()));
            }
            for endpoint in [&conn.source, &conn.target] {
                if !task_ids.contains(endpoint.as_str()) {
                    return Err(ValidationError::DanglingConnection {
                        id: conn.id.clone(),
                        task: endpoint.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Repair what can be repaired without losing user intent.
    ///
    /// Duplicates keep the most recently updated copy.
    pub fn sanitize(&mut self) -> SanitizeReport {
        let mut report = SanitizeReport::default();

        let before = self.tasks.len();
        self.tasks.retain(|t| !t.id.is_empty());
        report.dropped_empty_ids += before - self.tasks.len();

        let mut newest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for task in &self.tasks {
            let entry = newest.entry(task.id.clone()).or_insert(task.updated_at);
            if task.updated_at > *entry {
                *entry = task.updated_at;
            }
        }
        let mut seen = HashSet::new();
        self.tasks.retain(|task| {
            let keep = newest.get(&task.id) == Some(&task.updated_at) && seen.insert(task.id.clone());
            if !keep {
                report.dropped_duplicate_tasks.push(task.id.clone());
            }
            keep
        });

        for task in &mut self.tasks {
            if task.parent_id.as_deref() == Some(task.id.as_str()) {
                task.parent_id = None;
                report.cleared_self_parents.push(task.id.clone());
            }
        }

        let before = self.connections.len();
        self.connections.retain(|c| !c.id.is_empty());
        report.dropped_empty_ids += before - self.connections.len();

        let task_ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        let mut seen = HashSet::new();
        let mut dropped_dup = Vec::new();
        let mut dropped_dangling = Vec::new();
        self.connections.retain(|conn| {
            if !seen.insert(conn.id.clone()) {
                dropped_dup.push(conn.id.clone());
                return false;
            }
            if !task_ids.contains(conn.source.as_str()) || !task_ids.contains(conn.target.as_str())
            {
                dropped_dangling.push(conn.id.clone());
                return false;
            }
            true
        });
        report.dropped_duplicate_connections = dropped_dup;
        report.dropped_dangling_connections = dropped_dangling;

        report
    }
}
