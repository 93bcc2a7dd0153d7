use std::fmt;

use serde::{Deserialize, Serialize};

/// A storage bucket as returned by `GET /bucket`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub file_size_limit: Option<i64>,
    #[serde(default)]
    pub allowed_mime_types: Option<Vec<String>>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Options for [`StorageClient::create_bucket`](crate::StorageClient::create_bucket).
#[derive(Debug, Clone, Default, Serialize)]
pub struct BucketOptions {
    pub public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_mime_types: Option<Vec<String>>,
}

impl BucketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    /// Maximum object size in bytes.
    pub fn file_size_limit(mut self, limit: i64) -> Self {
        self.file_size_limit = Some(limit);
        self
    }

    pub fn allowed_mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_mime_types = Some(types.into_iter().map(Into::into).collect());
        self
    }
}

/// Body sent to `POST /bucket`.
#[derive(Debug, Serialize)]
pub(crate) struct CreateBucketBody<'a> {
    pub id: &'a str,
    pub name: &'a str,
    #[serde(flatten)]
    pub options: &'a BucketOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBucketResponse {
    pub name: String,
}

/// An object entry returned by list and remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileObject {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub bucket_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub last_accessed_at: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Per-upload options, shared by plain and resumable uploads.
#[derive(Debug, Clone)]
pub struct FileOptions {
    /// `Cache-Control` max-age in seconds, sent as `max-age=<n>`.
    pub cache_control: String,
    pub content_type: Option<String>,
    pub upsert: bool,
    pub metadata: Option<serde_json::Value>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            cache_control: "3600".to_string(),
            content_type: None,
            upsert: false,
            metadata: None,
        }
    }
}

impl FileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_control(mut self, seconds: impl Into<String>) -> Self {
        self.cache_control = seconds.into();
        self
    }

    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn upsert(mut self, value: bool) -> Self {
        self.upsert = value;
        self
    }

    pub fn metadata(mut self, value: serde_json::Value) -> Self {
        self.metadata = Some(value);
        self
    }

    pub(crate) fn content_type_or_default(&self) -> &str {
        self.content_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }

    pub(crate) fn cache_control_header(&self) -> String {
        format!("max-age={}", self.cache_control)
    }
}

/// Options for [`StorageFileApi::list`](crate::StorageFileApi::list).
#[derive(Debug, Clone, Serialize)]
pub struct SearchOptions {
    pub limit: u32,
    pub offset: u32,
    #[serde(rename = "sortBy")]
    pub sort_by: SortBy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
            sort_by: SortBy {
                column: "name".to_string(),
                order: SortOrder::Asc,
            },
            search: None,
        }
    }
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn sort_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = SortBy {
            column: column.into(),
            order,
        };
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortBy {
    pub column: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Body sent to `POST /object/list/{bucket}`.
#[derive(Debug, Serialize)]
pub(crate) struct ListBody<'a> {
    pub prefix: &'a str,
    #[serde(flatten)]
    pub options: &'a SearchOptions,
}

/// Response from a plain upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    #[serde(default, rename = "Id")]
    pub id: Option<String>,
    /// Full object key, `<bucket>/<path>`.
    #[serde(rename = "Key")]
    pub key: String,
}

/// Lifecycle of a [`ResumableUpload`](crate::ResumableUpload).
///
/// `Idle → InProgress → (Paused | Completed | Failed)`; `Paused` and
/// `Failed` go back to `InProgress` on the next start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Idle,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UploadStatus::Idle => "idle",
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        })
    }
}
