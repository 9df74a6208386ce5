//! Client side of the authoritative row store.
//!
//! [`RemoteClient`] is a thin CRUD façade. Every implementation is scoped to one
//! owning user: rows created through it belong to that user and listing only ever
//! returns that user's rows.
//!
//! Besides the client-written `updatedAt`, the remote stamps every row with the
//! time it last accepted a write ([`RECEIVED_AT`]). Pull cursors follow that stamp,
//! so an edit made offline long ago still shows up once it finally arrives.

pub mod http;
pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RemoteError;
use crate::task::TaskRecord;
use crate::timestamp::to_iso;

/// Server-managed attribute holding the time the remote last accepted a write.
pub const RECEIVED_AT: &str = "$updatedAt";

/// A value on the right-hand side of a [`RowFilter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl FilterValue {
    /// Order two values of the same kind. Mixed kinds are unordered.
    pub fn compare(&self, other: &FilterValue) -> Option<Ordering> {
        match (self, other) {
            (FilterValue::Text(a), FilterValue::Text(b)) => Some(a.cmp(b)),
            (FilterValue::Bool(a), FilterValue::Bool(b)) => Some(a.cmp(b)),
            (FilterValue::Timestamp(a), FilterValue::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FilterValue::Text(text) => serde_json::Value::String(text.clone()),
            FilterValue::Bool(flag) => serde_json::Value::Bool(*flag),
            FilterValue::Timestamp(at) => serde_json::Value::String(to_iso(at)),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(value: DateTime<Utc>) -> Self {
        FilterValue::Timestamp(value)
    }
}

/// A predicate on one field of a remote row. Field names are the camelCase names
/// of [`TaskRecord`], plus `userId` for the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// The field equals any of `values`.
    Equal { field: String, values: Vec<FilterValue> },
    GreaterThan { field: String, value: FilterValue },
}

impl RowFilter {
    pub fn equal(field: &str, value: impl Into<FilterValue>) -> Self {
        RowFilter::Equal {
            field: field.to_string(),
            values: vec![value.into()],
        }
    }

    pub fn one_of<V: Into<FilterValue>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        RowFilter::Equal {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn greater_than(field: &str, value: impl Into<FilterValue>) -> Self {
        RowFilter::GreaterThan {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            RowFilter::Equal { field, .. } | RowFilter::GreaterThan { field, .. } => field,
        }
    }

    /// Evaluate against a row's value for [`field`](Self::field). A missing value
    /// never matches.
    pub fn matches(&self, actual: Option<&FilterValue>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        match self {
            RowFilter::Equal { values, .. } => values.iter().any(|v| v == actual),
            RowFilter::GreaterThan { value, .. } => {
                actual.compare(value) == Some(Ordering::Greater)
            }
        }
    }
}

/// Value of a named [`TaskRecord`] field, for filter evaluation.
pub fn record_field(record: &TaskRecord, field: &str) -> Option<FilterValue> {
    match field {
        "id" => Some(record.id.clone().into()),
        "title" => Some(record.title.clone().into()),
        "description" => record.description.clone().map(Into::into),
        "status" => Some(record.status.clone().into()),
        "priority" => Some(record.priority.clone().into()),
        "dueDate" => record.due_date.map(Into::into),
        "createdAt" => Some(record.created_at.into()),
        "updatedAt" => Some(record.updated_at.into()),
        "isDeleted" => Some(record.is_deleted.into()),
        _ => None,
    }
}

/// A row as listed by [`RemoteClient::list_changes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub record: TaskRecord,
    /// When the remote accepted the write that produced `record`.
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Create a row under `record.id`. Fails with [`RemoteError::Conflict`] if the id
    /// already exists.
    async fn create_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError>;

    /// Overwrite the row `record.id`. Fails with [`RemoteError::NotFound`] if absent.
    async fn update_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError>;

    /// Delete the row `id`. Fails with [`RemoteError::NotFound`] if already absent.
    async fn delete_row(&self, id: &str) -> Result<(), RemoteError>;

    /// All of the owner's rows matching every filter, in no particular order.
    async fn list_rows(&self, filters: &[RowFilter]) -> Result<Vec<TaskRecord>, RemoteError>;

    /// The owner's rows the remote accepted a write for after `since`, or all of
    /// them when `since` is `None`.
    async fn list_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteChange>, RemoteError>;

    async fn get_row(&self, id: &str) -> Result<Option<TaskRecord>, RemoteError> {
        let mut rows = self.list_rows(&[RowFilter::equal("id", id)]).await?;
        Ok(rows.pop())
    }
}
