//! The interface the application layer calls.
//!
//! Every mutation is written to the local store first and announced on the change
//! channel, so the UI can re-read immediately. The sync pass that follows is
//! controlled by [`SyncTrigger`].

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::conflict::ConflictResolver;
use crate::engine::{SyncEngine, SyncOutcome};
use crate::error::SyncError;
use crate::remote::RemoteClient;
use crate::store::LocalStore;
use crate::task::{TaskPatch, TaskRecord};
use crate::timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or edited locally.
    Saved,
    /// Tombstoned locally.
    Deleted,
    /// Tombstone removed after the remote confirmed the delete.
    Purged,
    /// Overwritten by the remote copy.
    Pulled,
}

/// Lightweight event emitted whenever a task in the local store changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskChange {
    pub id: String,
    pub kind: ChangeKind,
}

/// When a local mutation kicks off a sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Only explicit [`TaskSync::sync`] calls sync.
    Manual,
    /// The mutating call awaits the pass before returning.
    Inline,
    /// The pass runs on a spawned task; the mutating call returns right away.
    #[default]
    Background,
}

/// Builder for [`TaskSync`].
pub struct TaskSyncBuilder {
    database_url: String,
    owner_id: String,
    resolver: Option<Arc<dyn ConflictResolver>>,
    trigger: SyncTrigger,
    store_available: bool,
}

impl TaskSyncBuilder {
    pub fn new(database_url: &str, owner_id: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            owner_id: owner_id.to_string(),
            resolver: None,
            trigger: SyncTrigger::default(),
            store_available: true,
        }
    }

    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn sync_trigger(mut self, trigger: SyncTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Run without persistent storage: reads return nothing and writes are dropped.
    pub fn unavailable_store(mut self) -> Self {
        self.store_available = false;
        self
    }

    pub async fn build(self, remote: Arc<dyn RemoteClient>) -> Result<TaskSync, SyncError> {
        let store = if self.store_available {
            LocalStore::open(&self.database_url).await?
        } else {
            log::warn!("Persistent storage unavailable, running without a local replica");
            LocalStore::unavailable()
        };

        let mut engine = SyncEngine::new(store.clone(), remote, self.owner_id);
        if let Some(resolver) = self.resolver {
            engine = engine.with_resolver(resolver);
        }

        Ok(TaskSync {
            store,
            engine: Arc::new(engine),
            trigger: self.trigger,
        })
    }
}

/// Long-lived task service: construct once at start-up, share by reference, and
/// call [`shutdown`](TaskSync::shutdown) on exit.
pub struct TaskSync {
    store: LocalStore,
    engine: Arc<SyncEngine>,
    trigger: SyncTrigger,
}

impl TaskSync {
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Subscribe to local store changes, including those made by sync passes.
    pub fn changes(&self) -> broadcast::Receiver<TaskChange> {
        self.engine.subscribe()
    }

    /// Active tasks, newest first.
    pub async fn fetch_tasks(&self) -> Result<Vec<TaskRecord>, SyncError> {
        self.store.active_tasks().await
    }

    /// An active task by id.
    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, SyncError> {
        Ok(self.store.get(id).await?.filter(TaskRecord::is_active))
    }

    pub async fn pending_count(&self) -> Result<u64, SyncError> {
        self.store.pending_count().await
    }

    /// Create or update a task.
    ///
    /// Without an id, or with an id the store has never seen, a new task is created
    /// and `title` is required. Otherwise the patch is applied over the stored task.
    /// Saving over a deleted task fails with [`SyncError::Deleted`].
    pub async fn save_task(&self, patch: TaskPatch) -> Result<TaskRecord, SyncError> {
        if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(SyncError::InvalidPatch("title must not be empty".into()));
        }

        let existing = match &patch.id {
            Some(id) => self.store.get(id).await?,
            None => None,
        };
        let record = match existing {
            Some(task) if task.is_deleted => return Err(SyncError::Deleted(task.id)),
            Some(mut task) => {
                patch.apply_to(&mut task);
                task.updated_at = timestamp::next_after(task.updated_at);
                task
            }
            None => new_record(&patch)?,
        };

        self.store.upsert(&record).await?;
        log::debug!("Saved task {}", record.id);
        self.notify(&record.id, ChangeKind::Saved);
        self.after_write().await;
        Ok(record)
    }

    /// Tombstone a task. Returns `false` if it was missing or already deleted.
    pub async fn delete_task(&self, id: &str) -> Result<bool, SyncError> {
        let at = match self.store.get(id).await? {
            Some(task) if task.is_active() => timestamp::next_after(task.updated_at),
            _ => return Ok(false),
        };
        let deleted = self.store.mark_deleted(id, at).await?;
        if deleted {
            log::debug!("Deleted task {id}");
            self.notify(id, ChangeKind::Deleted);
            self.after_write().await;
        }
        Ok(deleted)
    }

    /// Run a sync pass now. Failures are logged and reported, never raised.
    pub async fn sync(&self) -> SyncOutcome {
        self.engine.sync().await
    }

    /// Sync every time `online` flips from `false` to `true`.
    ///
    /// The task ends when the sender is dropped.
    pub fn watch_connectivity(&self, mut online: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let mut was_online = *online.borrow_and_update();
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                if is_online && !was_online {
                    log::info!("Connectivity restored, syncing");
                    engine.sync().await;
                }
                was_online = is_online;
            }
        })
    }

    /// Close the local store.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        self.store.close().await?;
        Ok(())
    }

    fn notify(&self, id: &str, kind: ChangeKind) {
        let _ = self.engine.change_tx().send(TaskChange {
            id: id.to_string(),
            kind,
        });
    }

    async fn after_write(&self) {
        match self.trigger {
            SyncTrigger::Manual => {}
            SyncTrigger::Inline => {
                self.engine.sync().await;
            }
            SyncTrigger::Background => {
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    engine.sync().await;
                });
            }
        }
    }
}

fn new_record(patch: &TaskPatch) -> Result<TaskRecord, SyncError> {
    let Some(title) = &patch.title else {
        return Err(SyncError::InvalidPatch("title is required for a new task".into()));
    };
    let id = patch.id.clone().unwrap_or_else(TaskRecord::generate_id);
    let mut record = TaskRecord::new(id, title.clone());
    patch.apply_to(&mut record);
    Ok(record)
}
