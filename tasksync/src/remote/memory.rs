//! In-process remote backend.
//!
//! Handles created with [`InMemoryRemote::for_owner`] share the same table, so one
//! backend can stand in for several devices (same owner) or several users.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RemoteError;
use crate::remote::{FilterValue, RECEIVED_AT, RemoteChange, RemoteClient, RowFilter, record_field};
use crate::task::TaskRecord;
use crate::timestamp;

#[derive(Debug, Clone)]
struct StoredRow {
    owner: String,
    record: TaskRecord,
    received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<String, StoredRow>,
    last_received: Option<DateTime<Utc>>,
}

impl Table {
    /// Receive time for the next accepted write. Strictly increasing across every
    /// handle onto the table.
    fn stamp(&mut self) -> DateTime<Utc> {
        let at = match self.last_received {
            Some(last) => timestamp::next_after(last),
            None => timestamp::now(),
        };
        self.last_received = Some(at);
        at
    }
}

/// Number of calls made through a handle, by operation.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub creates: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    pub lists: AtomicU64,
}

impl CallCounts {
    pub fn writes(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
            + self.updates.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryRemote {
    owner: String,
    table: Arc<Mutex<Table>>,
    calls: Arc<CallCounts>,
}

impl InMemoryRemote {
    /// An empty backend with a handle for `owner`.
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            table: Arc::new(Mutex::new(Table::default())),
            calls: Arc::new(CallCounts::default()),
        }
    }

    /// Another handle onto the same backend, acting for `owner`. Call counts are
    /// kept per handle.
    pub fn for_owner(&self, owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            table: Arc::clone(&self.table),
            calls: Arc::new(CallCounts::default()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    /// Snapshot of this owner's rows.
    pub fn rows(&self) -> Vec<TaskRecord> {
        self.lock()
            .rows
            .values()
            .filter(|row| row.owner == self.owner)
            .map(|row| row.record.clone())
            .collect()
    }

    pub fn row(&self, id: &str) -> Option<TaskRecord> {
        self.lock()
            .rows
            .get(id)
            .filter(|row| row.owner == self.owner)
            .map(|row| row.record.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn row_matches(&self, row: &StoredRow, filters: &[RowFilter]) -> bool {
        row.owner == self.owner
            && filters.iter().all(|filter| {
                let actual = match filter.field() {
                    "userId" => Some(FilterValue::Text(row.owner.clone())),
                    RECEIVED_AT => Some(row.received_at.into()),
                    field => record_field(&row.record, field),
                };
                filter.matches(actual.as_ref())
            })
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn create_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        let mut table = self.lock();
        // Ids are unique across owners
        if table.rows.contains_key(&record.id) {
            return Err(RemoteError::Conflict(record.id.clone()));
        }
        let received_at = table.stamp();
        table.rows.insert(
            record.id.clone(),
            StoredRow {
                owner: self.owner.clone(),
                record: record.clone(),
                received_at,
            },
        );
        Ok(record.clone())
    }

    async fn update_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        self.calls.updates.fetch_add(1, Ordering::SeqCst);
        let mut table = self.lock();
        let owned = table
            .rows
            .get(&record.id)
            .is_some_and(|row| row.owner == self.owner);
        if !owned {
            return Err(RemoteError::NotFound(record.id.clone()));
        }
        let received_at = table.stamp();
        match table.rows.get_mut(&record.id) {
            Some(row) => {
                row.record = record.clone();
                row.received_at = received_at;
                Ok(record.clone())
            }
            _ => Err(RemoteError::NotFound(record.id.clone())),
        }
    }

    async fn delete_row(&self, id: &str) -> Result<(), RemoteError> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        let mut table = self.lock();
        match table.rows.get(id) {
            Some(row) if row.owner == self.owner => {
                table.rows.remove(id);
                Ok(())
            }
            _ => Err(RemoteError::NotFound(id.to_string())),
        }
    }

    async fn list_rows(&self, filters: &[RowFilter]) -> Result<Vec<TaskRecord>, RemoteError> {
        Ok(self
            .matching_rows(filters)
            .into_iter()
            .map(|row| row.record)
            .collect())
    }

    async fn list_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        let filters: Vec<RowFilter> = since
            .map(|at| RowFilter::greater_than(RECEIVED_AT, at))
            .into_iter()
            .collect();
        Ok(self
            .matching_rows(&filters)
            .into_iter()
            .map(|row| RemoteChange {
                record: row.record,
                received_at: row.received_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_create_existing_id_conflicts() {
        let remote = InMemoryRemote::new("alice");
        let task = TaskRecord::new("t1", "first");
        remote.create_row(&task).await.unwrap();

        let err = remote.create_row(&task).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_are_not_found() {
        let remote = InMemoryRemote::new("alice");
        let task = TaskRecord::new("t1", "first");

        assert!(remote.update_row(&task).await.unwrap_err().is_not_found());
        assert!(remote.delete_row("t1").await.unwrap_err().is_not_found());
        assert_eq!(remote.calls().writes(), 2);
    }

    #[tokio::test]
    async fn test_rows_are_scoped_by_owner() {
        let alice = InMemoryRemote::new("alice");
        let bob = alice.for_owner("bob");
        alice.create_row(&TaskRecord::new("t1", "alice's")).await.unwrap();

        assert!(bob.list_rows(&[]).await.unwrap().is_empty());
        assert!(bob.update_row(&TaskRecord::new("t1", "hijack")).await.unwrap_err().is_not_found());
        // Ids stay globally unique
        assert!(bob.create_row(&TaskRecord::new("t1", "bob's")).await.unwrap_err().is_conflict());

        let owned = alice.list_rows(&[RowFilter::equal("userId", "alice")]).await.unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_updated_at() {
        let remote = InMemoryRemote::new("alice");
        let old = TaskRecord::new("old", "old");
        let mut new = TaskRecord::new("new", "new");
        new.updated_at = old.updated_at + Duration::minutes(5);
        remote.create_row(&old).await.unwrap();
        remote.create_row(&new).await.unwrap();

        let rows = remote
            .list_rows(&[RowFilter::greater_than("updatedAt", old.updated_at)])
            .await
            .unwrap();
        assert_eq!(rows, vec![new]);
    }

    #[tokio::test]
    async fn test_changes_follow_receive_order_not_updated_at() {
        let phone = InMemoryRemote::new("alice");
        let laptop = phone.for_owner("alice");

        // Edited earlier on the phone, but it reaches the backend last
        let mut late = TaskRecord::new("late", "from the phone");
        let early = TaskRecord::new("early", "from the laptop");
        late.updated_at = early.updated_at - Duration::hours(1);

        laptop.create_row(&early).await.unwrap();
        let seen = laptop.list_changes(None).await.unwrap();
        assert_eq!(seen.len(), 1);
        let cursor = seen[0].received_at;

        phone.create_row(&late).await.unwrap();
        let changes = laptop.list_changes(Some(cursor)).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].record, late);
        assert!(changes[0].received_at > cursor);

        // Updates move a row past the cursor again
        let cursor = changes[0].received_at;
        phone.update_row(&late).await.unwrap();
        assert_eq!(laptop.list_changes(Some(cursor)).await.unwrap().len(), 1);
    }
}
