//! Remote client for an Appwrite-style row API over HTTP.
//!
//! Rows live at `{endpoint}/tablesdb/{database}/tables/{table}/rows`. `createdAt` and
//! `updatedAt` are regular attributes written by the client, so the device that made
//! an edit decides its position in last-writer-wins ordering. Pulls filter on the
//! server-managed `$updatedAt` instead, which records when the backend accepted the
//! write.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::RemoteError;
use crate::remote::{RECEIVED_AT, RemoteChange, RemoteClient, RowFilter};
use crate::task::{SubTask, TaskRecord};
use crate::timestamp;

/// Rows requested per list call.
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    /// API root, e.g. `https://cloud.appwrite.io/v1`.
    pub endpoint: String,
    pub project_id: String,
    pub api_key: Option<String>,
    pub database_id: String,
    pub table_id: String,
    /// Owning user; stamped on every created row and required on every listing.
    pub owner_id: String,
    pub timeout: Duration,
}

impl HttpRemoteConfig {
    pub fn new(
        endpoint: impl Into<String>,
        project_id: impl Into<String>,
        database_id: impl Into<String>,
        table_id: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            project_id: project_id.into(),
            api_key: None,
            database_id: database_id.into(),
            table_id: table_id.into(),
            owner_id: owner_id.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn rows_url(&self) -> String {
        format!(
            "{}/tablesdb/{}/tables/{}/rows",
            self.endpoint.trim_end_matches('/'),
            self.database_id,
            self.table_id
        )
    }
}

/// Attributes of a row as stored remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RowData {
    user_id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    status: String,
    priority: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default, with = "timestamp::iso_opt")]
    due_date: Option<DateTime<Utc>>,
    #[serde(with = "timestamp::iso")]
    created_at: DateTime<Utc>,
    #[serde(with = "timestamp::iso")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    is_deleted: bool,
    /// JSON-encoded `Vec<SubTask>`
    #[serde(default)]
    sub_tasks: Option<String>,
}

impl RowData {
    fn from_record(owner: &str, record: &TaskRecord) -> Result<Self, RemoteError> {
        Ok(Self {
            user_id: owner.to_string(),
            title: record.title.clone(),
            description: record.description.clone(),
            status: record.status.clone(),
            priority: record.priority.clone(),
            tags: record.tags.clone(),
            due_date: record.due_date,
            created_at: record.created_at,
            updated_at: record.updated_at,
            is_deleted: record.is_deleted,
            sub_tasks: Some(serde_json::to_string(&record.sub_tasks)?),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    row_id: &'a str,
    data: RowData,
}

#[derive(Debug, Serialize)]
struct UpdateBody {
    data: RowData,
}

#[derive(Debug, Deserialize)]
struct RowDocument {
    #[serde(rename = "$id")]
    id: String,
    #[serde(rename = "$updatedAt", with = "timestamp::iso")]
    received_at: DateTime<Utc>,
    #[serde(flatten)]
    data: RowData,
}

impl RowDocument {
    fn into_record(self) -> Result<TaskRecord, RemoteError> {
        let sub_tasks: Vec<SubTask> = match self.data.sub_tasks.as_deref() {
            Some(text) if !text.is_empty() => serde_json::from_str(text)?,
            _ => Vec::new(),
        };
        Ok(TaskRecord {
            id: self.id,
            title: self.data.title,
            description: self.data.description,
            status: self.data.status,
            priority: self.data.priority,
            tags: self.data.tags,
            due_date: self.data.due_date,
            created_at: self.data.created_at,
            updated_at: self.data.updated_at,
            is_deleted: self.data.is_deleted,
            sub_tasks,
        })
    }

    fn into_change(self) -> Result<RemoteChange, RemoteError> {
        let received_at = self.received_at;
        Ok(RemoteChange {
            record: self.into_record()?,
            received_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RowList {
    rows: Vec<RowDocument>,
}

/// Render a filter in the backend's JSON query syntax.
fn encode_filter(filter: &RowFilter) -> String {
    let attribute = match filter.field() {
        "id" => "$id",
        field => field,
    };
    let query = match filter {
        RowFilter::Equal { values, .. } => json!({
            "method": "equal",
            "attribute": attribute,
            "values": values.iter().map(|v| v.to_json()).collect::<Vec<_>>(),
        }),
        RowFilter::GreaterThan { value, .. } => json!({
            "method": "greaterThan",
            "attribute": attribute,
            "values": [value.to_json()],
        }),
    };
    query.to_string()
}

fn encode_page(limit: usize, offset: usize) -> [String; 2] {
    [
        json!({ "method": "limit", "values": [limit] }).to_string(),
        json!({ "method": "offset", "values": [offset] }).to_string(),
    ]
}

pub struct HttpRemote {
    config: HttpRemoteConfig,
    client: Client,
}

impl HttpRemote {
    pub fn new(config: HttpRemoteConfig) -> Result<Self, RemoteError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Appwrite-Project", header_value(&config.project_id)?);
        if let Some(key) = &config.api_key {
            headers.insert("X-Appwrite-Key", header_value(key)?);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpRemoteConfig {
        &self.config
    }

    fn row_url(&self, id: &str) -> String {
        format!("{}/{}", self.config.rows_url(), id)
    }

    async fn fetch_page(
        &self,
        filters: &[RowFilter],
        offset: usize,
    ) -> Result<Vec<RowDocument>, RemoteError> {
        let owner = RowFilter::equal("userId", self.config.owner_id.as_str());
        let mut queries: Vec<(&str, String)> = filters
            .iter()
            .chain(std::iter::once(&owner))
            .map(|filter| ("queries[]", encode_filter(filter)))
            .collect();
        queries.extend(encode_page(PAGE_SIZE, offset).map(|q| ("queries[]", q)));

        let response = self
            .client
            .get(self.config.rows_url())
            .query(&queries)
            .send()
            .await?;
        let body = check_status(response, "").await?.text().await?;
        let list: RowList = serde_json::from_str(&body)?;
        Ok(list.rows)
    }

    /// Every page of rows matching `filters`.
    async fn fetch_all(&self, filters: &[RowFilter]) -> Result<Vec<RowDocument>, RemoteError> {
        let mut rows = Vec::new();
        loop {
            let page = self.fetch_page(filters, rows.len()).await?;
            let done = page.len() < PAGE_SIZE;
            rows.extend(page);
            if done {
                break;
            }
        }
        log::debug!("Listed {} remote rows", rows.len());
        Ok(rows)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, RemoteError> {
    HeaderValue::from_str(value).map_err(|e| RemoteError::InvalidConfig(e.to_string()))
}

/// Map the backend's status codes onto the protocol's error taxonomy.
async fn check_status(response: Response, id: &str) -> Result<Response, RemoteError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound(id.to_string())),
        StatusCode::CONFLICT => Err(RemoteError::Conflict(id.to_string())),
        status => {
            let message = response.text().await.unwrap_or_default();
            Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

async fn decode_row(response: Response) -> Result<TaskRecord, RemoteError> {
    let body = response.text().await?;
    let document: RowDocument = serde_json::from_str(&body)?;
    document.into_record()
}

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn create_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        let data = RowData::from_record(&self.config.owner_id, record)?;
        let response = self
            .client
            .post(self.config.rows_url())
            .json(&CreateBody {
                row_id: &record.id,
                data,
            })
            .send()
            .await?;
        decode_row(check_status(response, &record.id).await?).await
    }

    async fn update_row(&self, record: &TaskRecord) -> Result<TaskRecord, RemoteError> {
        let data = RowData::from_record(&self.config.owner_id, record)?;
        let response = self
            .client
            .patch(self.row_url(&record.id))
            .json(&UpdateBody { data })
            .send()
            .await?;
        decode_row(check_status(response, &record.id).await?).await
    }

    async fn delete_row(&self, id: &str) -> Result<(), RemoteError> {
        let response = self.client.delete(self.row_url(id)).send().await?;
        check_status(response, id).await?;
        Ok(())
    }

    async fn list_rows(&self, filters: &[RowFilter]) -> Result<Vec<TaskRecord>, RemoteError> {
        self.fetch_all(filters)
            .await?
            .into_iter()
            .map(RowDocument::into_record)
            .collect()
    }

    async fn list_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        let filters: Vec<RowFilter> = since
            .map(|at| RowFilter::greater_than(RECEIVED_AT, at))
            .into_iter()
            .collect();
        self.fetch_all(&filters)
            .await?
            .into_iter()
            .map(RowDocument::into_change)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> HttpRemoteConfig {
        HttpRemoteConfig::new("https://api.example.com/v1/", "proj", "main", "tasks", "alice")
    }

    #[test]
    fn test_rows_url_trims_trailing_slash() {
        assert_eq!(
            config().rows_url(),
            "https://api.example.com/v1/tablesdb/main/tables/tasks/rows"
        );
    }

    #[test]
    fn test_encode_greater_than_uses_iso_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let encoded = encode_filter(&RowFilter::greater_than("updatedAt", at));
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["method"], "greaterThan");
        assert_eq!(value["attribute"], "updatedAt");
        assert_eq!(value["values"][0], "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_encode_id_filter_targets_row_id() {
        let encoded = encode_filter(&RowFilter::one_of("id", ["a", "b"]));
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["attribute"], "$id");
        assert_eq!(value["values"], json!(["a", "b"]));
    }

    #[test]
    fn test_row_document_round_trip() {
        let mut record = TaskRecord::new("t1", "Plan trip");
        record.tags = vec!["travel".into()];
        record.sub_tasks = vec![SubTask {
            title: "book hotel".into(),
            completed: false,
        }];

        let data = RowData::from_record("alice", &record).unwrap();
        let mut document = serde_json::to_value(&data).unwrap();
        assert_eq!(document["userId"], "alice");
        document["$id"] = json!("t1");
        document["$createdAt"] = json!("2020-01-01T00:00:00.000+00:00");
        document["$updatedAt"] = json!("2020-01-02T00:00:00.000+00:00");

        let decoded: RowDocument = serde_json::from_value(document).unwrap();
        assert_eq!(decoded.into_record().unwrap(), record);
    }

    #[test]
    fn test_change_carries_server_receive_time() {
        let mut record = TaskRecord::new("t1", "Written offline");
        record.updated_at = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();

        let mut document = serde_json::to_value(RowData::from_record("alice", &record).unwrap()).unwrap();
        document["$id"] = json!("t1");
        document["$updatedAt"] = json!("2024-01-01T12:30:00.250+02:00");

        let decoded: RowDocument = serde_json::from_value(document).unwrap();
        let change = decoded.into_change().unwrap();
        assert_eq!(change.record.updated_at, record.updated_at);
        assert_eq!(
            change.received_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap() + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_change_filter_targets_server_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let encoded = encode_filter(&RowFilter::greater_than(RECEIVED_AT, at));
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["attribute"], "$updatedAt");
        assert_eq!(value["values"][0], "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_invalid_project_header_is_rejected() {
        let mut config = config();
        config.project_id = "bad\nvalue".into();
        assert!(matches!(
            HttpRemote::new(config),
            Err(RemoteError::InvalidConfig(_))
        ));
    }
}
