//! Persisted sync cursors.
//!
//! The pull phase asks the remote for rows it received after a boundary: the
//! remote's receive time of the newest row pulled so far. That boundary is kept in
//! its own `_tasksync_cursor` table rather than derived from the task rows,
//! so purging a tombstone or editing a task locally never moves it.

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DbErr, FromQueryResult};

use crate::error::SyncError;
use crate::store::statement;
use crate::timestamp::{parse_iso, to_iso};

/// Create the `_tasksync_cursor` table if it does not already exist.
pub async fn create_cursor_table(db: &impl ConnectionTrait) -> Result<(), DbErr> {
    db.execute_unprepared(
        "CREATE TABLE IF NOT EXISTS _tasksync_cursor (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .await?;
    Ok(())
}

/// Cursor name for rows pulled on behalf of `owner`.
pub fn pull_cursor(owner: &str) -> String {
    format!("pull:{owner}")
}

#[derive(Debug, FromQueryResult)]
struct CursorRow {
    value: String,
}

pub async fn load(db: &impl ConnectionTrait, name: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
    let row = CursorRow::find_by_statement(statement(
        "SELECT value FROM _tasksync_cursor WHERE name = $1",
        vec![name.into()],
    ))
    .one(db)
    .await?;

    Ok(row.map(|r| parse_iso(&r.value)).transpose()?)
}

pub async fn save(db: &impl ConnectionTrait, name: &str, at: DateTime<Utc>) -> Result<(), DbErr> {
    db.execute_raw(statement(
        "INSERT INTO _tasksync_cursor (name, value) VALUES ($1, $2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        vec![name.into(), to_iso(&at).into()],
    ))
    .await?;
    Ok(())
}

/// Forget a cursor; the next pull starts from the beginning.
pub async fn reset(db: &impl ConnectionTrait, name: &str) -> Result<(), DbErr> {
    db.execute_raw(statement(
        "DELETE FROM _tasksync_cursor WHERE name = $1",
        vec![name.into()],
    ))
    .await?;
    Ok(())
}
