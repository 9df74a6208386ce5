//! Task records and partial updates.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timestamp;

pub const DEFAULT_STATUS: &str = "todo";
pub const DEFAULT_PRIORITY: &str = "medium";

/// A checklist entry embedded in its parent task.
///
/// Sub-tasks have no identity or lifecycle of their own; they are stored as a
/// JSON blob next to the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTask {
    pub title: String,
    pub completed: bool,
}

/// The unit of replication.
///
/// Serializes with the camelCase field names used by both the local schema and the
/// remote row API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, with = "timestamp::iso_opt")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(with = "timestamp::iso")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp::iso")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub sub_tasks: Vec<SubTask>,
}

impl TaskRecord {
    /// A fresh, active record stamped with the current time.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = timestamp::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: DEFAULT_STATUS.to_string(),
            priority: DEFAULT_PRIORITY.to_string(),
            tags: Vec::new(),
            due_date: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            sub_tasks: Vec::new(),
        }
    }

    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }
}

/// A partial update to a task, as submitted by `saveTask`.
///
/// `None` leaves a field untouched. For the clearable fields (`description`,
/// `due_date`) `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub tags: Option<Vec<String>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub sub_tasks: Option<Vec<SubTask>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch for an existing record.
    pub fn for_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn due_date(mut self, due_date: Option<DateTime<Utc>>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn sub_tasks(mut self, sub_tasks: Vec<SubTask>) -> Self {
        self.sub_tasks = Some(sub_tasks);
        self
    }

    /// Apply the patch onto `record` in place. Does not touch timestamps.
    pub fn apply_to(&self, record: &mut TaskRecord) {
        if let Some(title) = &self.title {
            record.title = title.clone();
        }
        if let Some(description) = &self.description {
            record.description = description.clone();
        }
        if let Some(status) = &self.status {
            record.status = status.clone();
        }
        if let Some(priority) = &self.priority {
            record.priority = priority.clone();
        }
        if let Some(tags) = &self.tags {
            record.tags = tags.clone();
        }
        if let Some(due_date) = &self.due_date {
            record.due_date = due_date.map(|at| at.trunc_subsecs(3));
        }
        if let Some(sub_tasks) = &self.sub_tasks {
            record.sub_tasks = sub_tasks.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_leaves_unset_fields_alone() {
        let mut record = TaskRecord::new("t1", "Write report");
        record.description = Some("quarterly".into());

        TaskPatch::for_id("t1").priority("high").apply_to(&mut record);

        assert_eq!(record.priority, "high");
        assert_eq!(record.title, "Write report");
        assert_eq!(record.description.as_deref(), Some("quarterly"));
    }

    #[test]
    fn test_patch_can_clear_description() {
        let mut record = TaskRecord::new("t1", "Write report");
        record.description = Some("quarterly".into());

        TaskPatch::for_id("t1").description(None).apply_to(&mut record);

        assert_eq!(record.description, None);
    }

    #[test]
    fn test_record_json_uses_camel_case() {
        let mut record = TaskRecord::new("t1", "Write report");
        record.sub_tasks.push(SubTask {
            title: "outline".into(),
            completed: true,
        });
        let json = serde_json::to_value(&record).unwrap();

        assert!(json.get("updatedAt").is_some());
        assert!(json.get("isDeleted").is_some());
        assert_eq!(json["subTasks"][0]["completed"], true);

        let back: TaskRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
