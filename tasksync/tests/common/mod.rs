#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tasksync::{
    FilterValue, InMemoryRemote, RemoteChange, RemoteClient, RemoteError, RowFilter, SyncOutcome,
    SyncReport, SyncTrigger, TaskRecord, TaskSync, TaskSyncBuilder,
};
use tokio::sync::Notify;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A fixed instant, so tests can place edits before and after each other.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

pub fn at(offset_minutes: i64) -> DateTime<Utc> {
    base_time() + Duration::minutes(offset_minutes)
}

pub fn task_at(id: &str, title: &str, updated_at: DateTime<Utc>) -> TaskRecord {
    let mut task = TaskRecord::new(id, title);
    task.created_at = base_time();
    task.updated_at = updated_at;
    task
}

/// A service over a fresh in-memory replica that only syncs when asked.
pub async fn open_device(remote: Arc<dyn RemoteClient>, owner: &str) -> TaskSync {
    init_logger();
    TaskSyncBuilder::new("sqlite::memory:", owner)
        .sync_trigger(SyncTrigger::Manual)
        .build(remote)
        .await
        .expect("Failed to build TaskSync")
}

pub async fn open_memory_device(remote: &InMemoryRemote) -> TaskSync {
    open_device(Arc::new(remote.clone()), remote.owner()).await
}

/// The report of a pass that ran to the end.
pub fn completed(outcome: SyncOutcome) -> SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed sync pass, got {other:?}"),
    }
}

fn unavailable(id: &str) -> RemoteError {
    RemoteError::Status {
        status: 503,
        message: format!("backend unavailable for {id}"),
    }
}

/// Fails every write touching one of `broken` ids, and every lookup by id that
/// asks for one of the `unreadable` ids.
pub struct FlakyRemote {
    pub inner: InMemoryRemote,
    broken: Mutex<HashSet<String>>,
    unreadable: Mutex<HashSet<String>>,
}

impl FlakyRemote {
    pub fn new(inner: InMemoryRemote, broken: &[&str]) -> Self {
        Self {
            inner,
            broken: Mutex::new(broken.iter().map(|id| id.to_string()).collect()),
            unreadable: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_unreadable(self, ids: &[&str]) -> Self {
        self.unreadable
            .lock()
            .unwrap()
            .extend(ids.iter().map(|id| id.to_string()));
        self
    }

    pub fn heal(&self) {
        self.broken.lock().unwrap().clear();
        self.unreadable.lock().unwrap().clear();
    }

    fn is_broken(&self, id: &str) -> bool {
        self.broken.lock().unwrap().contains(id)
    }

    fn unreadable_in(&self, filters: &[RowFilter]) -> Option<String> {
        let unreadable = self.unreadable.lock().unwrap();
        filters.iter().find_map(|filter| match filter {
            RowFilter::Equal { field, values } if field == "id" => {
                values.iter().find_map(|value| match value {
                    FilterValue::Text(id) if unreadable.contains(id) => Some(id.clone()),
                    _ => None,
                })
            }
            _ => None,
        })
    }
}

#[async_trait]
impl RemoteClient for FlakyRemote {
    async fn create_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        if self.is_broken(&record.id) {
            return Err(unavailable(&record.id));
        }
        self.inner.create_row(record).await
    }

    async fn update_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        if self.is_broken(&record.id) {
            return Err(unavailable(&record.id));
        }
        self.inner.update_row(record).await
    }

    async fn delete_row(&self, id: &str) -> Result<(), RemoteError> {
        if self.is_broken(id) {
            return Err(unavailable(id));
        }
        self.inner.delete_row(id).await
    }

    async fn list_rows(&self, filters: &[RowFilter]) -> Result<Vec<TaskRecord>, RemoteError> {
        if let Some(id) = self.unreadable_in(filters) {
            return Err(unavailable(&id));
        }
        self.inner.list_rows(filters).await
    }

    async fn list_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        self.inner.list_changes(since).await
    }
}

/// Parks every pull until released.
pub struct GatedRemote {
    pub inner: InMemoryRemote,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedRemote {
    pub fn new(inner: InMemoryRemote) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl RemoteClient for GatedRemote {
    async fn create_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        self.inner.create_row(record).await
    }

    async fn update_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        self.inner.update_row(record).await
    }

    async fn delete_row(&self, id: &str) -> Result<(), RemoteError> {
        self.inner.delete_row(id).await
    }

    async fn list_rows(&self, filters: &[RowFilter]) -> Result<Vec<TaskRecord>, RemoteError> {
        self.inner.list_rows(filters).await
    }

    async fn list_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.list_changes(since).await
    }
}

/// Answers the first lookup with nothing and the first update with `NotFound`, as
/// if another device created the row between our update and our create.
pub struct RacingRemote {
    pub inner: InMemoryRemote,
    lookup_hidden: AtomicBool,
    update_missed: AtomicBool,
}

impl RacingRemote {
    pub fn new(inner: InMemoryRemote) -> Self {
        Self {
            inner,
            lookup_hidden: AtomicBool::new(false),
            update_missed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RemoteClient for RacingRemote {
    async fn create_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        self.inner.create_row(record).await
    }

    async fn update_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        if !self.update_missed.swap(true, Ordering::SeqCst) {
            return Err(RemoteError::NotFound(record.id.clone()));
        }
        self.inner.update_row(record).await
    }

    async fn delete_row(&self, id: &str) -> Result<(), RemoteError> {
        self.inner.delete_row(id).await
    }

    async fn list_rows(&self, filters: &[RowFilter]) -> Result<Vec<TaskRecord>, RemoteError> {
        if !self.lookup_hidden.swap(true, Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        self.inner.list_rows(filters).await
    }

    async fn list_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        self.inner.list_changes(since).await
    }
}
