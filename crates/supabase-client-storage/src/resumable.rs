//! Pausable uploads over the TUS 1.0.0 protocol.
//!
//! The upload is created with `POST /upload/resumable`, then the bytes are
//! sent in fixed-size `PATCH` chunks to the returned location. Resuming asks
//! the server for its offset with `HEAD` and continues from there.

use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::Method;
use supabase_client_core::platform::{self, SpawnHandle};
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};
use url::Url;

use crate::client::parse_error;
use crate::error::StorageError;
use crate::file_api::StorageFileApi;
use crate::types::{FileOptions, UploadStatus};

const TUS_RESUMABLE: &str = "Tus-Resumable";
const TUS_VERSION: &str = "1.0.0";
const UPLOAD_OFFSET: &str = "Upload-Offset";

/// Handle to a resumable upload. Clones share the same transfer.
///
/// `start_or_resume` drives the transfer and resolves once it completes,
/// fails or is paused; `pause` may be called from another task meanwhile.
#[derive(Clone)]
pub struct ResumableUpload {
    inner: Arc<UploadInner>,
}

struct UploadInner {
    api: StorageFileApi,
    path: String,
    data: Vec<u8>,
    options: FileOptions,
    status: watch::Sender<UploadStatus>,
    transfer: Mutex<Transfer>,
}

#[derive(Default)]
struct Transfer {
    upload_url: Option<Url>,
    offset: u64,
    /// Bumped by every start and pause so a superseded task cannot commit.
    attempt: u64,
    task: Option<SpawnHandle>,
}

impl ResumableUpload {
    pub(crate) fn new(api: StorageFileApi, path: String, data: Vec<u8>, options: FileOptions) -> Self {
        let (status, _) = watch::channel(UploadStatus::Idle);
        Self {
            inner: Arc::new(UploadInner {
                api,
                path,
                data,
                options,
                status,
                transfer: Mutex::new(Transfer::default()),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn status(&self) -> UploadStatus {
        *self.inner.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<UploadStatus> {
        self.inner.status.subscribe()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.data.len() as u64
    }

    /// Bytes the server has acknowledged so far.
    pub fn bytes_uploaded(&self) -> u64 {
        self.inner.transfer().offset
    }

    /// Location of the upload on the server, once created.
    pub fn upload_url(&self) -> Option<Url> {
        self.inner.transfer().upload_url.clone()
    }

    /// Start the upload from `Idle`, or continue it from `Paused`/`Failed`.
    ///
    /// Returns the status the transfer settled in: `Completed`, or `Paused`
    /// if [`pause`](Self::pause) interrupted it. A call while the upload is
    /// already `InProgress` (or `Completed`) returns that status at once.
    pub async fn start_or_resume(&self) -> Result<UploadStatus, StorageError> {
        let done = {
            let mut transfer = self.inner.transfer();
            let from = self.status();
            if matches!(from, UploadStatus::InProgress | UploadStatus::Completed) {
                debug!(path = %self.inner.path, status = %from, "Upload start ignored");
                return Ok(from);
            }

            transfer.attempt += 1;
            let attempt = transfer.attempt;
            self.inner.set_status(UploadStatus::InProgress);
            debug!(path = %self.inner.path, from = %from, attempt, "Upload started");

            let (tx, rx) = oneshot::channel();
            let inner = Arc::clone(&self.inner);
            transfer.task = Some(platform::spawn(async move {
                let outcome = inner.run().await;
                let _ = tx.send(inner.finish(attempt, outcome));
            }));
            rx
        };

        match done.await {
            Ok(result) => result,
            // Task aborted by pause.
            Err(_) => Ok(self.status()),
        }
    }

    /// Abort the in-flight transfer and move to `Paused`. Returns once the
    /// transfer has stopped. No-op unless `InProgress`.
    pub async fn pause(&self) {
        let task = {
            let mut transfer = self.inner.transfer();
            if self.status() != UploadStatus::InProgress {
                return;
            }
            transfer.attempt += 1;
            self.inner.set_status(UploadStatus::Paused);
            transfer.task.take()
        };
        if let Some(task) = task {
            task.abort();
            task.join().await;
        }
        debug!(
            path = %self.inner.path,
            offset = self.bytes_uploaded(),
            "Upload paused"
        );
    }
}

impl std::fmt::Debug for ResumableUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableUpload")
            .field("bucket", &self.inner.api.bucket_id())
            .field("path", &self.inner.path)
            .field("status", &self.status())
            .field("total_bytes", &self.total_bytes())
            .finish_non_exhaustive()
    }
}

impl UploadInner {
    fn transfer(&self) -> MutexGuard<'_, Transfer> {
        self.transfer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: UploadStatus) {
        self.status.send_replace(status);
    }

    fn finish(
        &self,
        attempt: u64,
        outcome: Result<(), StorageError>,
    ) -> Result<UploadStatus, StorageError> {
        let mut transfer = self.transfer();
        if transfer.attempt != attempt {
            return Ok(*self.status.borrow());
        }
        transfer.task = None;
        match outcome {
            Ok(()) => {
                self.set_status(UploadStatus::Completed);
                debug!(path = %self.path, bytes = self.data.len(), "Upload completed");
                Ok(UploadStatus::Completed)
            }
            Err(e) => {
                warn!(path = %self.path, offset = transfer.offset, error = %e, "Upload failed");
                self.set_status(UploadStatus::Failed);
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<(), StorageError> {
        let total = self.data.len() as u64;
        let existing = self.transfer().upload_url.clone();
        let (location, mut offset) = match existing {
            Some(location) => {
                let offset = self.server_offset(&location).await?;
                if offset > total {
                    return Err(StorageError::protocol(format!(
                        "server offset {} exceeds upload length {}",
                        offset, total
                    )));
                }
                (location, offset)
            }
            None => {
                let location = self.create().await?;
                self.transfer().upload_url = Some(location.clone());
                (location, 0)
            }
        };
        self.transfer().offset = offset;

        let chunk_size = self.api.client().upload_chunk_size() as u64;
        while offset < total {
            let end = (offset + chunk_size).min(total);
            let chunk = self.data[offset as usize..end as usize].to_vec();
            let next = self.send_chunk(&location, offset, chunk).await?;
            if next <= offset || next > total {
                return Err(StorageError::protocol(format!(
                    "unexpected offset {} after sending bytes {}..{}",
                    next, offset, end
                )));
            }
            offset = next;
            self.transfer().offset = offset;
            trace!(path = %self.path, offset, total, "Chunk uploaded");
        }
        Ok(())
    }

    async fn create(&self) -> Result<Url, StorageError> {
        let client = self.api.client();
        let resp = client
            .request(Method::POST, "/upload/resumable")
            .await
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header("Upload-Length", self.data.len().to_string())
            .header("Upload-Metadata", self.metadata()?)
            .header("x-upsert", self.options.upsert.to_string())
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(parse_error(status, resp).await);
        }
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StorageError::protocol("missing Location header"))?;
        let location = resp.url().join(location)?;
        debug!(path = %self.path, location = %location, "Upload created");
        Ok(location)
    }

    async fn server_offset(&self, location: &Url) -> Result<u64, StorageError> {
        let resp = self
            .api
            .client()
            .request_url(Method::HEAD, location.clone())
            .await
            .header(TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(parse_error(status, resp).await);
        }
        let offset = upload_offset(resp.headers())?;
        debug!(path = %self.path, offset, "Resuming upload");
        Ok(offset)
    }

    async fn send_chunk(
        &self,
        location: &Url,
        offset: u64,
        chunk: Vec<u8>,
    ) -> Result<u64, StorageError> {
        let resp = self
            .api
            .client()
            .request_url(Method::PATCH, location.clone())
            .await
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_OFFSET, offset.to_string())
            .header("content-type", "application/offset+octet-stream")
            .body(chunk)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(parse_error(status, resp).await);
        }
        upload_offset(resp.headers())
    }

    /// `Upload-Metadata`: comma-separated `key base64(value)` pairs.
    fn metadata(&self) -> Result<String, StorageError> {
        let mut pairs = vec![
            ("bucketName", self.api.bucket_id().to_string()),
            ("objectName", self.path.clone()),
            ("contentType", self.options.content_type_or_default().to_string()),
            ("cacheControl", self.options.cache_control.clone()),
        ];
        if let Some(metadata) = &self.options.metadata {
            pairs.push(("metadata", serde_json::to_string(metadata)?));
        }
        Ok(encode_metadata(&pairs))
    }
}

fn encode_metadata(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{} {}", key, STANDARD.encode(value)))
        .collect::<Vec<_>>()
        .join(",")
}

fn upload_offset(headers: &HeaderMap) -> Result<u64, StorageError> {
    headers
        .get(UPLOAD_OFFSET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| StorageError::protocol("missing or invalid Upload-Offset header"))
}
