//! # tasksync
//!
//! Offline-first replication for task records.
//!
//! A device keeps its own replica of the user's tasks in an embedded SQLite
//! database ([`LocalStore`]). Every edit lands there first, so the application stays
//! usable with no network. A [`SyncEngine`] later reconciles the replica with an
//! authoritative row store behind a [`RemoteClient`], in three ordered phases:
//!
//! 1. push tombstones (remote delete, then local purge),
//! 2. push pending edits (update, falling back to create),
//! 3. pull rows changed remotely since the persisted cursor.
//!
//! Conflicts go through a swappable [`ConflictResolver`]; the default is
//! [`LastWriterWins`] on `updatedAt`.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tasksync::{InMemoryRemote, TaskPatch, TaskSyncBuilder};
//!
//! let remote = Arc::new(InMemoryRemote::new("user-1"));
//! let tasks = TaskSyncBuilder::new("sqlite::memory:", "user-1")
//!     .build(remote)
//!     .await?;
//!
//! let task = tasks.save_task(TaskPatch::new().title("Buy milk")).await?;
//! tasks.delete_task(&task.id).await?;
//! tasks.sync().await;
//! ```
//!
//! ## Key types
//!
//! - [`TaskSync`]: the collaborator-facing service (`fetch_tasks`, `save_task`, `delete_task`, `sync`)
//! - [`TaskSyncBuilder`]: configures and builds the store, engine and service
//! - [`SyncEngine`]: the three-phase reconciliation pass
//! - [`TaskRecord`]: the unit of replication

pub mod conflict;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod remote;
pub mod service;
pub mod store;
pub mod task;
pub mod timestamp;

pub use conflict::{ConflictResolver, LastWriterWins, Winner};
pub use engine::{FailedRecord, Phase, SyncEngine, SyncOutcome, SyncReport};
pub use error::{RemoteError, SyncError};
pub use remote::http::{HttpRemote, HttpRemoteConfig};
pub use remote::memory::InMemoryRemote;
pub use remote::{FilterValue, RemoteChange, RemoteClient, RowFilter};
pub use service::{ChangeKind, SyncTrigger, TaskChange, TaskSync, TaskSyncBuilder};
pub use store::{LocalStore, PendingTask};
pub use task::{SubTask, TaskPatch, TaskRecord};

// Re-export sea-orm so callers of `LocalStore::query` can build parameter values
pub use sea_orm;
