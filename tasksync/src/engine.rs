//! The reconciliation pass between the local replica and the remote store.
//!
//! A pass runs three phases strictly in order:
//!
//! 1. **Push tombstones**: delete each locally deleted task remotely, then purge it.
//! 2. **Push pending**: send each unconfirmed local edit as an update, falling
//!    back to a create when the remote has never seen the id.
//! 3. **Pull**: fetch rows the remote received since the persisted cursor and write
//!    them over the local copies. The cursor follows the remote's receive time, not
//!    the client-stamped `updatedAt`, so late-arriving offline edits are not skipped.
//!
//! Remote calls happen outside any transaction. Each phase then commits the local
//! effects of everything the remote acknowledged in one transaction, so the store
//! never claims a push that the remote did not confirm. Work committed by an earlier
//! phase is never undone; running the pass again picks up whatever is still pending.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, TransactionTrait};
use tokio::sync::broadcast;

use crate::conflict::{ConflictResolver, LastWriterWins, Winner};
use crate::cursor;
use crate::error::{RemoteError, SyncError};
use crate::remote::{RemoteClient, RowFilter};
use crate::service::{ChangeKind, TaskChange};
use crate::store::{self, LocalStore, PendingTask};
use crate::task::TaskRecord;

/// Ids per remote lookup when prefetching copies of pending tasks.
const LOOKUP_CHUNK: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PushTombstones,
    PushPending,
    Pull,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::PushTombstones => "push-tombstones",
            Phase::PushPending => "push-pending",
            Phase::Pull => "pull",
        };
        f.write_str(name)
    }
}

/// A record whose remote call failed during a pass. It stays pending locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub id: String,
    pub phase: Phase,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Tombstones confirmed gone remotely and purged locally.
    pub purged: usize,
    /// Pending edits sent as remote updates.
    pub pushed: usize,
    /// Pending edits that had to be created remotely.
    pub created: usize,
    /// Remote rows that changed the local replica.
    pub pulled: usize,
    /// Times both sides held a version of the same task.
    pub conflicts: usize,
    pub failures: Vec<FailedRecord>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, id: &str, phase: Phase, error: &RemoteError) {
        log::warn!("Sync {phase} failed for task {id}: {error}");
        self.failures.push(FailedRecord {
            id: id.to_string(),
            phase,
            message: error.to_string(),
        });
    }
}

/// Result of [`SyncEngine::sync`].
#[derive(Debug)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass was already running; this call did nothing.
    Skipped,
    /// A phase could not run at all. `report` holds what earlier phases achieved.
    Failed { report: SyncReport, error: SyncError },
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) | SyncOutcome::Failed { report, .. } => Some(report),
            SyncOutcome::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::Skipped)
    }
}

/// What the remote acknowledged for one pending task.
enum Ack {
    Pushed {
        record: TaskRecord,
        created: bool,
        conflict: bool,
    },
    /// The remote copy won; it replaces the local one.
    Adopted {
        local_updated_at: DateTime<Utc>,
        remote: TaskRecord,
    },
}

/// Clears the in-flight flag when a pass ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteClient>,
    resolver: Arc<dyn ConflictResolver>,
    owner: String,
    in_flight: AtomicBool,
    change_tx: broadcast::Sender<TaskChange>,
}

impl SyncEngine {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteClient>, owner: impl Into<String>) -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            store,
            remote,
            resolver: Arc::new(LastWriterWins),
            owner: owner.into(),
            in_flight: AtomicBool::new(false),
            change_tx,
        }
    }

    /// Replace the conflict policy.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskChange> {
        self.change_tx.subscribe()
    }

    pub(crate) fn change_tx(&self) -> &broadcast::Sender<TaskChange> {
        &self.change_tx
    }

    fn notify(&self, id: &str, kind: ChangeKind) {
        let _ = self.change_tx.send(TaskChange {
            id: id.to_string(),
            kind,
        });
    }

    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(&self.in_flight))
    }

    /// Run one reconciliation pass.
    ///
    /// Returns [`SyncOutcome::Skipped`] immediately if a pass is already running.
    /// Never panics and never returns an error to the caller; failures are logged and
    /// reported in the outcome.
    pub async fn sync(&self) -> SyncOutcome {
        let Some(_guard) = self.try_begin() else {
            log::debug!("Sync already in progress, skipping");
            return SyncOutcome::Skipped;
        };
        let Some(conn) = self.store.connection() else {
            log::debug!("Local store unavailable, nothing to sync");
            return SyncOutcome::Completed(SyncReport::default());
        };

        let mut report = SyncReport::default();
        match self.run_phases(conn, &mut report).await {
            Ok(()) => {
                log::info!(
                    "Sync finished: {} purged, {} pushed, {} created, {} pulled, {} conflicts, {} failures",
                    report.purged,
                    report.pushed,
                    report.created,
                    report.pulled,
                    report.conflicts,
                    report.failures.len()
                );
                SyncOutcome::Completed(report)
            }
            Err(error) => {
                log::error!("Sync aborted: {error}");
                SyncOutcome::Failed { report, error }
            }
        }
    }

    async fn run_phases(
        &self,
        conn: &DatabaseConnection,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        self.push_tombstones(conn, report).await?;
        self.push_pending(conn, report).await?;
        self.pull(conn, report).await
    }

    async fn push_tombstones(
        &self,
        conn: &DatabaseConnection,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let tombstones = store::tombstones(conn).await?;
        log::debug!("Pushing {} tombstones", tombstones.len());

        let mut confirmed = Vec::new();
        for task in &tombstones {
            match self.remote.delete_row(&task.id).await {
                Ok(()) => confirmed.push(task.id.as_str()),
                Err(e) if e.is_not_found() => {
                    log::debug!("Task {} already absent remotely", task.id);
                    confirmed.push(task.id.as_str());
                }
                Err(e) => report.fail(&task.id, Phase::PushTombstones, &e),
            }
        }
        if confirmed.is_empty() {
            return Ok(());
        }

        let txn = conn.begin().await?;
        for id in &confirmed {
            store::purge_tombstone(&txn, id).await?;
        }
        txn.commit().await?;

        report.purged += confirmed.len();
        for id in confirmed {
            self.notify(id, ChangeKind::Purged);
        }
        Ok(())
    }

    async fn push_pending(
        &self,
        conn: &DatabaseConnection,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let pending = store::pending_tasks(conn).await?;
        log::debug!("Pushing {} pending tasks", pending.len());
        if pending.is_empty() {
            return Ok(());
        }

        let mut lookups = self.lookup_remote_copies(&pending).await;

        let mut acks = Vec::new();
        for task in &pending {
            let id = task.record.id.as_str();
            let result = match lookups.remove(id) {
                Some(Ok(Some(remote))) => self.push_against(task, &remote).await,
                Some(Err(e)) => Err(e),
                _ => self.upsert_remote(task).await,
            };
            match result {
                Ok(ack) => acks.push(ack),
                Err(e) => report.fail(id, Phase::PushPending, &e),
            }
        }
        if acks.is_empty() {
            return Ok(());
        }

        let txn = conn.begin().await?;
        let mut adopted = Vec::new();
        for ack in &acks {
            match ack {
                Ack::Pushed { record, .. } => {
                    store::mark_synced(&txn, &record.id, record.updated_at).await?;
                }
                Ack::Adopted {
                    local_updated_at,
                    remote,
                } => {
                    // Leave edits made while the remote call was in flight alone
                    let unchanged = store::find_task(&txn, &remote.id)
                        .await?
                        .is_some_and(|t| t.is_active() && t.updated_at == *local_updated_at);
                    if unchanged {
                        store::upsert_task(&txn, remote, Some(remote.updated_at)).await?;
                        adopted.push(remote.id.as_str());
                    }
                }
            }
        }
        txn.commit().await?;

        for ack in &acks {
            match ack {
                Ack::Pushed {
                    created, conflict, ..
                } => {
                    if *created {
                        report.created += 1;
                    } else {
                        report.pushed += 1;
                    }
                    if *conflict {
                        report.conflicts += 1;
                    }
                }
                Ack::Adopted { .. } => report.conflicts += 1,
            }
        }
        for id in adopted {
            self.notify(id, ChangeKind::Pulled);
        }
        Ok(())
    }

    /// The remote copy of each task, keyed by id, fetched in batches.
    ///
    /// A batch the remote rejects is retried one id at a time, so a lookup failure
    /// only holds back the tasks it actually concerns.
    async fn lookup_remote_copies<'a>(
        &self,
        tasks: &'a [PendingTask],
    ) -> HashMap<&'a str, Result<Option<TaskRecord>, RemoteError>> {
        let mut lookups = HashMap::new();
        for chunk in tasks.chunks(LOOKUP_CHUNK) {
            let filter = RowFilter::one_of("id", chunk.iter().map(|t| t.record.id.as_str()));
            match self.remote.list_rows(&[filter]).await {
                Ok(rows) => {
                    let mut found: HashMap<String, TaskRecord> =
                        rows.into_iter().map(|row| (row.id.clone(), row)).collect();
                    for task in chunk {
                        let id = task.record.id.as_str();
                        lookups.insert(id, Ok(found.remove(id)));
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Looking up {} pending tasks remotely failed, retrying one by one: {e}",
                        chunk.len()
                    );
                    for task in chunk {
                        let id = task.record.id.as_str();
                        lookups.insert(id, self.remote.get_row(id).await);
                    }
                }
            }
        }
        lookups
    }

    /// Push `task` unless the resolver prefers the existing remote copy. Only a
    /// remote copy that moved on since the last sync counts as a conflict.
    async fn push_against(&self, task: &PendingTask, remote: &TaskRecord) -> Result<Ack, RemoteError> {
        let local = &task.record;
        match self.resolver.resolve(local, remote) {
            Winner::Remote => {
                log::debug!("Remote copy of task {} wins, adopting it", local.id);
                Ok(Ack::Adopted {
                    local_updated_at: local.updated_at,
                    remote: remote.clone(),
                })
            }
            Winner::Local => {
                let ack = self.upsert_remote(task).await?;
                Ok(match ack {
                    Ack::Pushed {
                        record, created, ..
                    } => Ack::Pushed {
                        record,
                        created,
                        conflict: task.diverged_from(remote),
                    },
                    adopted => adopted,
                })
            }
        }
    }

    /// Update, or create when the remote answers `NotFound`.
    async fn upsert_remote(&self, task: &PendingTask) -> Result<Ack, RemoteError> {
        let local = &task.record;
        match self.remote.update_row(local).await {
            Ok(_) => Ok(Ack::Pushed {
                record: local.clone(),
                created: false,
                conflict: false,
            }),
            Err(e) if e.is_not_found() => match self.remote.create_row(local).await {
                Ok(_) => Ok(Ack::Pushed {
                    record: local.clone(),
                    created: true,
                    conflict: false,
                }),
                Err(e) if e.is_conflict() => self.resolve_create_conflict(task, e).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// The id appeared remotely between our update and create: someone else holds a
    /// divergent copy. Settle it with the resolver like any other conflict.
    async fn resolve_create_conflict(
        &self,
        task: &PendingTask,
        conflict: RemoteError,
    ) -> Result<Ack, RemoteError> {
        let local = &task.record;
        let Some(remote) = self.remote.get_row(&local.id).await? else {
            // Taken by a row we cannot see
            return Err(conflict);
        };
        match self.resolver.resolve(local, &remote) {
            Winner::Remote => Ok(Ack::Adopted {
                local_updated_at: local.updated_at,
                remote,
            }),
            Winner::Local => {
                self.remote.update_row(local).await?;
                Ok(Ack::Pushed {
                    record: local.clone(),
                    created: false,
                    conflict: task.diverged_from(&remote),
                })
            }
        }
    }

    async fn pull(&self, conn: &DatabaseConnection, report: &mut SyncReport) -> Result<(), SyncError> {
        let cursor_name = cursor::pull_cursor(&self.owner);
        let since = cursor::load(conn, &cursor_name).await?;

        let changes = self.remote.list_changes(since).await?;
        log::debug!("Pulled {} remote rows received since {since:?}", changes.len());
        if changes.is_empty() {
            return Ok(());
        }

        let txn = conn.begin().await?;
        let mut high_water = since;
        let mut changed = Vec::new();
        for change in &changes {
            high_water = high_water.max(Some(change.received_at));
            let remote = &change.record;

            let local = store::find_task(&txn, &remote.id).await?;
            if local.as_ref().is_some_and(|t| t.is_deleted) {
                // Never resurrect a tombstone; phase one removes the row next pass
                continue;
            }
            if let Some(pending) = store::find_pending(&txn, &remote.id).await? {
                if self.resolver.resolve(&pending.record, remote) == Winner::Local {
                    log::debug!("Keeping unpushed local edit of task {}", remote.id);
                    if pending.diverged_from(remote) {
                        report.conflicts += 1;
                    }
                    continue;
                }
            }

            store::upsert_task(&txn, remote, Some(remote.updated_at)).await?;
            if local.as_ref() != Some(remote) {
                changed.push(remote.id.as_str());
            }
        }
        if let Some(at) = high_water {
            cursor::save(&txn, &cursor_name, at).await?;
        }
        txn.commit().await?;

        report.pulled += changed.len();
        for id in changed {
            self.notify(id, ChangeKind::Pulled);
        }
        Ok(())
    }
}
