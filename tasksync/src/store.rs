//! The device's local replica of task records.
//!
//! Everything lives in one `tasks` table. Besides the replicated columns it carries
//! one local-only column, `syncedAt`: the `updatedAt` value the remote was last
//! confirmed to hold. A row is *pending* while it is active and its `updatedAt` is
//! newer than `syncedAt`.
//!
//! The free functions take any [`ConnectionTrait`] so the sync engine can run them
//! inside a transaction; [`LocalStore`] wraps them for callers holding the pool.

use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr,
    FromQueryResult, QueryResult, Statement, Value,
};

use crate::error::SyncError;
use crate::task::{SubTask, TaskRecord};
use crate::timestamp::{parse_iso, to_iso};

const CREATE_TASKS_TABLE: &str = "CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    dueDate TEXT,
    createdAt TEXT NOT NULL,
    updatedAt TEXT NOT NULL,
    isDeleted BOOLEAN NOT NULL DEFAULT 0,
    subTasks TEXT NOT NULL DEFAULT '[]',
    syncedAt TEXT
)";

const SELECT_TASK: &str = "SELECT id, title, description, status, priority, tags,
    dueDate AS due_date, createdAt AS created_at, updatedAt AS updated_at,
    isDeleted AS is_deleted, subTasks AS sub_tasks, syncedAt AS synced_at
    FROM tasks";

const PENDING_PREDICATE: &str = "isDeleted = 0 AND (syncedAt IS NULL OR updatedAt > syncedAt)";

/// Create the `tasks` and cursor tables if they do not already exist.
pub async fn create_tables(db: &impl ConnectionTrait) -> Result<(), DbErr> {
    db.execute_unprepared(CREATE_TASKS_TABLE).await?;
    crate::cursor::create_cursor_table(db).await?;
    Ok(())
}

pub(crate) fn statement(sql: &str, params: Vec<Value>) -> Statement {
    Statement::from_sql_and_values(DatabaseBackend::Sqlite, sql, params)
}

#[derive(Debug, FromQueryResult)]
struct TaskRow {
    id: String,
    title: String,
    description: Option<String>,
    status: String,
    priority: String,
    tags: String,
    due_date: Option<String>,
    created_at: String,
    updated_at: String,
    is_deleted: bool,
    sub_tasks: String,
    synced_at: Option<String>,
}

/// A pending record and the last state of it the remote confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    pub record: TaskRecord,
    /// `updatedAt` of the confirmed state; `None` if the remote never confirmed one.
    pub synced_at: Option<DateTime<Utc>>,
}

impl PendingTask {
    /// Whether `remote` holds a write this device has not seen confirmed, i.e. both
    /// sides changed the task since the last sync.
    pub fn diverged_from(&self, remote: &TaskRecord) -> bool {
        self.synced_at != Some(remote.updated_at)
    }
}

impl TaskRow {
    fn into_pending(mut self) -> Result<PendingTask, SyncError> {
        let synced_at = self.synced_at.take().as_deref().map(parse_iso).transpose()?;
        Ok(PendingTask {
            record: self.into_record()?,
            synced_at,
        })
    }

    fn into_record(self) -> Result<TaskRecord, SyncError> {
        let tags: Vec<String> = serde_json::from_str(&self.tags)?;
        let sub_tasks: Vec<SubTask> = serde_json::from_str(&self.sub_tasks)?;
        let due_date = self.due_date.as_deref().map(parse_iso).transpose()?;

        Ok(TaskRecord {
            id: self.id,
            title: self.title,
            description: self.description,
            status: self.status,
            priority: self.priority,
            tags,
            due_date,
            created_at: parse_iso(&self.created_at)?,
            updated_at: parse_iso(&self.updated_at)?,
            is_deleted: self.is_deleted,
            sub_tasks,
        })
    }
}

async fn select_tasks(
    db: &impl ConnectionTrait,
    clause: &str,
    params: Vec<Value>,
) -> Result<Vec<TaskRecord>, SyncError> {
    let sql = format!("{SELECT_TASK} {clause}");
    TaskRow::find_by_statement(statement(&sql, params))
        .all(db)
        .await?
        .into_iter()
        .map(TaskRow::into_record)
        .collect()
}

/// Look up one record by id, tombstones included.
pub async fn find_task(db: &impl ConnectionTrait, id: &str) -> Result<Option<TaskRecord>, SyncError> {
    let mut rows = select_tasks(db, "WHERE id = $1", vec![id.into()]).await?;
    Ok(rows.pop())
}

/// Every non-deleted record, newest first.
pub async fn active_tasks(db: &impl ConnectionTrait) -> Result<Vec<TaskRecord>, SyncError> {
    select_tasks(db, "WHERE isDeleted = 0 ORDER BY createdAt DESC, id ASC", vec![]).await
}

pub async fn tombstones(db: &impl ConnectionTrait) -> Result<Vec<TaskRecord>, SyncError> {
    select_tasks(db, "WHERE isDeleted = 1 ORDER BY updatedAt ASC", vec![]).await
}

async fn select_pending(
    db: &impl ConnectionTrait,
    clause: &str,
    params: Vec<Value>,
) -> Result<Vec<PendingTask>, SyncError> {
    let sql = format!("{SELECT_TASK} WHERE {PENDING_PREDICATE} {clause}");
    TaskRow::find_by_statement(statement(&sql, params))
        .all(db)
        .await?
        .into_iter()
        .map(TaskRow::into_pending)
        .collect()
}

/// Active records whose latest edit has not been confirmed by the remote, oldest first.
pub async fn pending_tasks(db: &impl ConnectionTrait) -> Result<Vec<PendingTask>, SyncError> {
    select_pending(db, "ORDER BY updatedAt ASC, id ASC", vec![]).await
}

/// `id` if it is active and carries an edit the remote has not confirmed.
pub async fn find_pending(
    db: &impl ConnectionTrait,
    id: &str,
) -> Result<Option<PendingTask>, SyncError> {
    let mut rows = select_pending(db, "AND id = $1", vec![id.into()]).await?;
    Ok(rows.pop())
}

pub async fn count_pending(db: &impl ConnectionTrait) -> Result<u64, DbErr> {
    let sql = format!("SELECT COUNT(*) AS n FROM tasks WHERE {PENDING_PREDICATE}");
    let row = db.query_one_raw(statement(&sql, vec![])).await?;
    let count = match row {
        Some(row) => row.try_get::<i64>("", "n")?,
        None => 0,
    };
    Ok(count as u64)
}

/// Whether `id` is active and carries an edit the remote has not confirmed.
pub async fn is_pending(db: &impl ConnectionTrait, id: &str) -> Result<bool, DbErr> {
    let sql = format!("SELECT COUNT(*) AS n FROM tasks WHERE id = $1 AND {PENDING_PREDICATE}");
    let row = db.query_one_raw(statement(&sql, vec![id.into()])).await?;
    Ok(match row {
        Some(row) => row.try_get::<i64>("", "n")? > 0,
        None => false,
    })
}

/// Insert or overwrite a record by id.
///
/// `synced_at` marks the written state as already held by the remote (used when the
/// record came from the remote). `None` keeps whatever marker the row had.
pub async fn upsert_task(
    db: &impl ConnectionTrait,
    record: &TaskRecord,
    synced_at: Option<DateTime<Utc>>,
) -> Result<(), SyncError> {
    let tags = serde_json::to_string(&record.tags)?;
    let sub_tasks = serde_json::to_string(&record.sub_tasks)?;

    db.execute_raw(statement(
        "INSERT INTO tasks (id, title, description, status, priority, tags, dueDate,
             createdAt, updatedAt, isDeleted, subTasks, syncedAt)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         ON CONFLICT(id) DO UPDATE SET
             title = excluded.title,
             description = excluded.description,
             status = excluded.status,
             priority = excluded.priority,
             tags = excluded.tags,
             dueDate = excluded.dueDate,
             createdAt = excluded.createdAt,
             updatedAt = excluded.updatedAt,
             isDeleted = excluded.isDeleted,
             subTasks = excluded.subTasks,
             syncedAt = COALESCE(excluded.syncedAt, tasks.syncedAt)",
        vec![
            record.id.clone().into(),
            record.title.clone().into(),
            record.description.clone().into(),
            record.status.clone().into(),
            record.priority.clone().into(),
            tags.into(),
            record.due_date.as_ref().map(to_iso).into(),
            to_iso(&record.created_at).into(),
            to_iso(&record.updated_at).into(),
            record.is_deleted.into(),
            sub_tasks.into(),
            synced_at.as_ref().map(to_iso).into(),
        ],
    ))
    .await?;
    Ok(())
}

/// Tombstone an active record. Returns `false` if it was missing or already deleted.
pub async fn mark_deleted(
    db: &impl ConnectionTrait,
    id: &str,
    at: DateTime<Utc>,
) -> Result<bool, DbErr> {
    let result = db
        .execute_raw(statement(
            "UPDATE tasks SET isDeleted = 1, updatedAt = $2 WHERE id = $1 AND isDeleted = 0",
            vec![id.into(), to_iso(&at).into()],
        ))
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Record that the remote now holds the state stamped `updated_at`.
pub async fn mark_synced(
    db: &impl ConnectionTrait,
    id: &str,
    updated_at: DateTime<Utc>,
) -> Result<(), DbErr> {
    db.execute_raw(statement(
        "UPDATE tasks SET syncedAt = $2 WHERE id = $1",
        vec![id.into(), to_iso(&updated_at).into()],
    ))
    .await?;
    Ok(())
}

/// Permanently remove a tombstone. Active rows are never purged.
pub async fn purge_tombstone(db: &impl ConnectionTrait, id: &str) -> Result<bool, DbErr> {
    let result = db
        .execute_raw(statement(
            "DELETE FROM tasks WHERE id = $1 AND isDeleted = 1",
            vec![id.into()],
        ))
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Durable, queryable replica backed by SQLite.
///
/// Built once at start-up with [`LocalStore::open`] and shared by reference. A store
/// built with [`LocalStore::unavailable`] has no storage at all: reads come back
/// empty and writes affect nothing, so callers degrade instead of failing.
#[derive(Debug, Clone)]
pub struct LocalStore {
    conn: Option<DatabaseConnection>,
}

impl LocalStore {
    /// Connect to `url` (e.g. `sqlite://tasks.db?mode=rwc` or `sqlite::memory:`)
    /// and create the schema.
    pub async fn open(url: &str) -> Result<Self, DbErr> {
        let mut opts = ConnectOptions::new(url);
        // Single writer per device
        opts.max_connections(1).min_connections(1).sqlx_logging(false);
        let conn = Database::connect(opts).await?;

        create_tables(&conn).await?;
        log::info!("Local store ready at {url}");

        Ok(Self { conn: Some(conn) })
    }

    /// A store with no persistent storage behind it.
    pub fn unavailable() -> Self {
        Self { conn: None }
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    /// The underlying connection, if storage is available.
    pub fn connection(&self) -> Option<&DatabaseConnection> {
        self.conn.as_ref()
    }

    /// Run a parameterized statement and return its rows.
    ///
    /// Placeholders are `$1`, `$2`, … Returns no rows when storage is unavailable.
    pub async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<QueryResult>, DbErr> {
        match &self.conn {
            Some(conn) => conn.query_all_raw(statement(sql, params)).await,
            None => {
                log::debug!("Local store unavailable, returning no rows");
                Ok(Vec::new())
            }
        }
    }

    /// Run a parameterized write and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<u64, DbErr> {
        match &self.conn {
            Some(conn) => Ok(conn.execute_raw(statement(sql, params)).await?.rows_affected()),
            None => Ok(0),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<TaskRecord>, SyncError> {
        match &self.conn {
            Some(conn) => find_task(conn, id).await,
            None => Ok(None),
        }
    }

    pub async fn active_tasks(&self) -> Result<Vec<TaskRecord>, SyncError> {
        match &self.conn {
            Some(conn) => active_tasks(conn).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn tombstones(&self) -> Result<Vec<TaskRecord>, SyncError> {
        match &self.conn {
            Some(conn) => tombstones(conn).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn pending(&self) -> Result<Vec<PendingTask>, SyncError> {
        match &self.conn {
            Some(conn) => pending_tasks(conn).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn pending_count(&self) -> Result<u64, SyncError> {
        match &self.conn {
            Some(conn) => Ok(count_pending(conn).await?),
            None => Ok(0),
        }
    }

    /// Write a local edit. The row becomes pending if its `updatedAt` moved.
    pub async fn upsert(&self, record: &TaskRecord) -> Result<(), SyncError> {
        match &self.conn {
            Some(conn) => upsert_task(conn, record, None).await,
            None => Ok(()),
        }
    }

    pub async fn mark_deleted(&self, id: &str, at: DateTime<Utc>) -> Result<bool, SyncError> {
        match &self.conn {
            Some(conn) => Ok(mark_deleted(conn, id, at).await?),
            None => Ok(false),
        }
    }

    /// Close the pool. Further use of clones of this store will fail.
    pub async fn close(self) -> Result<(), DbErr> {
        if let Some(conn) = self.conn {
            conn.close().await?;
            log::info!("Local store closed");
        }
        Ok(())
    }
}
