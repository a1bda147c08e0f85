//! Collaborator-facing mutations and how they apply to a project.
//!
//! `apply` reports exactly which entities and fields changed; an empty
//! report means the mutation was a no-op (for example moving a task to the
//! stage it is already in).

use crate::change_tracker::{ChangeKind, EntityRef};
use crate::error::{Result, SyncError};
use crate::model::{
    Connection, ConnectionId, Entity, Field, Position, Priority, Project, ProjectId, Task, TaskId,
    TaskStatus, ValidationError, TASK_FIELDS,
};
use chrono::{DateTime, Utc};

/// Partial update of a task. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<TaskStatus>,
    pub rank: Option<String>,
    pub position: Option<Position>,
    pub tags: Option<Vec<String>>,
    pub attachments: Option<Vec<String>>,
    pub priority: Option<Option<Priority>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateProject {
        project_id: ProjectId,
        name: String,
    },
    RenameProject {
        project_id: ProjectId,
        name: String,
    },
    CreateTask {
        project_id: ProjectId,
        task: Task,
    },
    UpdateTask {
        project_id: ProjectId,
        task_id: TaskId,
        patch: TaskPatch,
    },
    /// Move within the board: stage bucket, tree parent and sort order.
    MoveTask {
        project_id: ProjectId,
        task_id: TaskId,
        stage: Option<i64>,
        parent_id: Option<TaskId>,
        order: i64,
    },
    DeleteTask {
        project_id: ProjectId,
        task_id: TaskId,
    },
    /// Explicit restore; the only way a tombstone is cleared.
    RestoreTask {
        project_id: ProjectId,
        task_id: TaskId,
    },
    CreateConnection {
        project_id: ProjectId,
        connection: Connection,
    },
    UpdateConnection {
        project_id: ProjectId,
        connection_id: ConnectionId,
        title: Option<String>,
        description: Option<String>,
    },
    DeleteConnection {
        project_id: ProjectId,
        connection_id: ConnectionId,
    },
}

/// One entity (or the project itself, when `entity` is `None`) touched by a
/// mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub entity: Option<EntityRef>,
    pub kind: ChangeKind,
    pub fields: Vec<Field>,
}

impl AppliedChange {
    fn project() -> Self {
        Self {
            entity: None,
            kind: ChangeKind::Updated,
            fields: Vec::new(),
        }
    }

    fn task(id: &str, kind: ChangeKind, fields: Vec<Field>) -> Self {
        Self {
            entity: Some(EntityRef::Task(id.to_string())),
            kind,
            fields,
        }
    }

    fn connection(id: &str, kind: ChangeKind, fields: Vec<Field>) -> Self {
        Self {
            entity: Some(EntityRef::Connection(id.to_string())),
            kind,
            fields,
        }
    }
}

/// What `submit_mutation` did.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub project_id: ProjectId,
    pub changes: Vec<AppliedChange>,
}

impl MutationOutcome {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

impl Mutation {
    pub fn project_id(&self) -> &str {
        match self {
            Mutation::CreateProject { project_id, .. }
            | Mutation::RenameProject { project_id, .. }
            | Mutation::CreateTask { project_id, .. }
            | Mutation::UpdateTask { project_id, .. }
            | Mutation::MoveTask { project_id, .. }
            | Mutation::DeleteTask { project_id, .. }
            | Mutation::RestoreTask { project_id, .. }
            | Mutation::CreateConnection { project_id, .. }
            | Mutation::UpdateConnection { project_id, .. }
            | Mutation::DeleteConnection { project_id, .. } => project_id,
        }
    }

    /// Entity the mutation is about; keys the optimistic snapshot.
    pub fn entity_id(&self) -> &str {
        match self {
            Mutation::CreateProject { project_id, .. } | Mutation::RenameProject { project_id, .. } => {
                project_id
            }
            Mutation::CreateTask { task, .. } => &task.id,
            Mutation::UpdateTask { task_id, .. }
            | Mutation::MoveTask { task_id, .. }
            | Mutation::DeleteTask { task_id, .. }
            | Mutation::RestoreTask { task_id, .. } => task_id,
            Mutation::CreateConnection { connection, .. } => &connection.id,
            Mutation::UpdateConnection { connection_id, .. }
            | Mutation::DeleteConnection { connection_id, .. } => connection_id,
        }
    }

    /// Operation label for the optimistic snapshot.
    pub fn label(&self) -> &'static str {
        match self {
            Mutation::CreateProject { .. } => "create-project",
            Mutation::RenameProject { .. } => "rename-project",
            Mutation::CreateTask { .. } => "create-task",
            Mutation::UpdateTask { .. } => "update-task",
            Mutation::MoveTask { .. } => "move-task",
            Mutation::DeleteTask { .. } => "delete-task",
            Mutation::RestoreTask { .. } => "restore-task",
            Mutation::CreateConnection { .. } => "create-connection",
            Mutation::UpdateConnection { .. } => "update-connection",
            Mutation::DeleteConnection { .. } => "delete-connection",
        }
    }

    /// Apply to `project` at time `now`.
    ///
    /// `CreateProject` is handled by the coordinator, which owns the project
    /// list; here it only validates that the target is still empty.
    pub fn apply(&self, project: &mut Project, now: DateTime<Utc>) -> Result<Vec<AppliedChange>> {
        let changes = match self {
            Mutation::CreateProject { .. } => vec![AppliedChange::project()],
            Mutation::RenameProject { name, .. } => {
                if project.name == *name {
                    Vec::new()
                } else {
                    project.name = name.clone();
                    vec![AppliedChange::project()]
                }
            }
            Mutation::CreateTask { task, .. } => create_task(project, task, now)?,
            Mutation::UpdateTask { task_id, patch, .. } => update_task(project, task_id, patch, now)?,
            Mutation::MoveTask {
                task_id,
                stage,
                parent_id,
                order,
                ..
            } => move_task(project, task_id, *stage, parent_id.as_ref(), *order, now)?,
            Mutation::DeleteTask { task_id, .. } => delete_task(project, task_id, now)?,
            Mutation::RestoreTask { task_id, .. } => restore_task(project, task_id, now)?,
            Mutation::CreateConnection { connection, .. } => {
                create_connection(project, connection, now)?
            }
            Mutation::UpdateConnection {
                connection_id,
                title,
                description,
                ..
            } => update_connection(project, connection_id, title, description, now)?,
            Mutation::DeleteConnection { connection_id, .. } => {
                delete_connection(project, connection_id, now)?
            }
        };

        if !changes.is_empty() {
            project.updated_at = project.updated_at.max(now);
        }
        Ok(changes)
    }
}

fn live_task_mut<'a>(project: &'a mut Project, task_id: &str) -> Result<&'a mut Task> {
    match project.task_mut(task_id) {
        Some(task) if !task.is_tombstone() => Ok(task),
        _ => Err(SyncError::NotFound(format!("task {task_id}"))),
    }
}

fn create_task(project: &mut Project, task: &Task, now: DateTime<Utc>) -> Result<Vec<AppliedChange>> {
    if task.id.is_empty() {
        return Err(ValidationError::EmptyEntityId(project.id.clone()).into());
    }
    if project.task(&task.id).is_some() {
        return Err(ValidationError::DuplicateTask(task.id.clone()).into());
    }
    if task.parent_id.as_deref() == Some(task.id.as_str()) {
        return Err(ValidationError::SelfParent(task.id.clone()).into());
    }

    let mut task = task.clone();
    task.deleted_at = None;
    task.restored_at = None;
    task.updated_at = now;
    task.field_updated_at.clear();
    let fields: Vec<Field> = TASK_FIELDS
        .iter()
        .copied()
        .filter(|f| *f != Field::DeletedAt)
        .collect();
    let id = task.id.clone();
    project.tasks.push(task);
    Ok(vec![AppliedChange::task(&id, ChangeKind::Created, fields)])
}

fn update_task(
    project: &mut Project,
    task_id: &str,
    patch: &TaskPatch,
    now: DateTime<Utc>,
) -> Result<Vec<AppliedChange>> {
    let task = live_task_mut(project, task_id)?;
    let mut fields = Vec::new();

    macro_rules! set {
        ($field:ident, $variant:expr) => {
            if let Some(value) = &patch.$field {
                if task.$field != *value {
                    task.$field = value.clone();
                    fields.push($variant);
                }
            }
        };
    }

    set!(title, Field::Title);
    set!(content, Field::Content);
    set!(status, Field::Status);
    set!(rank, Field::Rank);
    set!(position, Field::Position);
    set!(tags, Field::Tags);
    set!(attachments, Field::Attachments);
    set!(priority, Field::Priority);
    set!(due_date, Field::DueDate);

    if fields.is_empty() {
        return Ok(Vec::new());
    }
    task.touch(&fields, now);
    Ok(vec![AppliedChange::task(task_id, ChangeKind::Updated, fields)])
}

fn move_task(
    project: &mut Project,
    task_id: &str,
    stage: Option<i64>,
    parent_id: Option<&TaskId>,
    order: i64,
    now: DateTime<Utc>,
) -> Result<Vec<AppliedChange>> {
    if parent_id.is_some_and(|p| p == task_id) {
        return Err(ValidationError::SelfParent(task_id.to_string()).into());
    }
    if let Some(parent) = parent_id {
        if project.live_tasks().all(|t| t.id != *parent) {
            return Err(SyncError::NotFound(format!("parent task {parent}")));
        }
    }

    let task = live_task_mut(project, task_id)?;
    let mut fields = Vec::new();
    if task.stage != stage {
        task.stage = stage;
        fields.push(Field::Stage);
    }
    if task.parent_id.as_ref() != parent_id {
        task.parent_id = parent_id.cloned();
        fields.push(Field::ParentId);
    }
    if task.order != order {
        task.order = order;
        fields.push(Field::Order);
    }

    if fields.is_empty() {
        return Ok(Vec::new());
    }
    task.touch(&fields, now);
    Ok(vec![AppliedChange::task(task_id, ChangeKind::Updated, fields)])
}

fn delete_task(project: &mut Project, task_id: &str, now: DateTime<Utc>) -> Result<Vec<AppliedChange>> {
    let task = project
        .task_mut(task_id)
        .ok_or_else(|| SyncError::NotFound(format!("task {task_id}")))?;
    if task.is_tombstone() {
        return Ok(Vec::new());
    }
    task.deleted_at = Some(now);
    task.touch(&[Field::DeletedAt], now);

    let mut changes = vec![AppliedChange::task(
        task_id,
        ChangeKind::Deleted,
        vec![Field::DeletedAt],
    )];

    // Edges of a deleted task go with it
    for conn in project
        .connections
        .iter_mut()
        .filter(|c| c.touches(task_id) && !c.is_tombstone())
    {
        conn.deleted_at = Some(now);
        conn.touch(&[Field::DeletedAt], now);
        changes.push(AppliedChange::connection(
            &conn.id,
            ChangeKind::Deleted,
            vec![Field::DeletedAt],
        ));
    }
    Ok(changes)
}

fn restore_task(project: &mut Project, task_id: &str, now: DateTime<Utc>) -> Result<Vec<AppliedChange>> {
    let task = project
        .task_mut(task_id)
        .ok_or_else(|| SyncError::NotFound(format!("task {task_id}")))?;
    if !task.is_tombstone() {
        return Ok(Vec::new());
    }
    task.deleted_at = None;
    task.restored_at = Some(now);
    task.touch(&[Field::DeletedAt], now);
    Ok(vec![AppliedChange::task(
        task_id,
        ChangeKind::Updated,
        vec![Field::DeletedAt],
    )])
}

fn create_connection(
    project: &mut Project,
    connection: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<AppliedChange>> {
    if connection.id.is_empty() {
        return Err(ValidationError::EmptyEntityId(project.id.clone()).into());
    }
    if project.connection(&connection.id).is_some() {
        return Err(ValidationError::DuplicateConnection(connection.id.clone()).into());
    }
    for endpoint in [&connection.source, &connection.target] {
        if project.live_tasks().all(|t| t.id != *endpoint) {
            return Err(ValidationError::DanglingConnection {
                id: connection.id.clone(),
                task: endpoint.clone(),
            }
            .into());
        }
    }

    let mut connection = connection.clone();
    connection.deleted_at = None;
    connection.restored_at = None;
    connection.updated_at = now;
    connection.field_updated_at.clear();
    let id = connection.id.clone();
    project.connections.push(connection);
    Ok(vec![AppliedChange::connection(
        &id,
        ChangeKind::Created,
        vec![Field::Source, Field::Target, Field::Title, Field::Description],
    )])
}

fn update_connection(
    project: &mut Project,
    connection_id: &str,
    title: &Option<String>,
    description: &Option<String>,
    now: DateTime<Utc>,
) -> Result<Vec<AppliedChange>> {
    let conn = match project.connection_mut(connection_id) {
        Some(conn) if !conn.is_tombstone() => conn,
        _ => return Err(SyncError::NotFound(format!("connection {connection_id}"))),
    };

    let mut fields = Vec::new();
    if title.is_some() && conn.title != *title {
        conn.title = title.clone();
        fields.push(Field::Title);
    }
    if description.is_some() && conn.description != *description {
        conn.description = description.clone();
        fields.push(Field::Description);
    }
    if fields.is_empty() {
        return Ok(Vec::new());
    }
    conn.touch(&fields, now);
    Ok(vec![AppliedChange::connection(
        connection_id,
        ChangeKind::Updated,
        fields,
    )])
}

fn delete_connection(
    project: &mut Project,
    connection_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<AppliedChange>> {
    let conn = project
        .connection_mut(connection_id)
        .ok_or_else(|| SyncError::NotFound(format!("connection {connection_id}")))?;
    if conn.is_tombstone() {
        return Ok(Vec::new());
    }
    conn.deleted_at = Some(now);
    conn.touch(&[Field::DeletedAt], now);
    Ok(vec![AppliedChange::connection(
        connection_id,
        ChangeKind::Deleted,
        vec![Field::DeletedAt],
    )])
}
