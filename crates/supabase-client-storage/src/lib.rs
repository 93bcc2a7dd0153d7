//! Supabase Storage HTTP client.
//!
//! Bucket management, object upload/download/remove and pausable resumable
//! uploads against `/storage/v1`. Requests carry the signed-in user's access
//! token when a [`AccessTokenProvider`](supabase_client_core::AccessTokenProvider)
//! is configured, and the API key otherwise.
//!
//! # Usage
//!
//! ```ignore
//! use supabase_client_storage::{FileOptions, StorageClient, UploadStatus};
//!
//! let storage = StorageClient::new("https://your-project.supabase.co", "anon-key")?;
//! let videos = storage.from("videos");
//!
//! let upload = videos.resumable_upload("clip.mp4", bytes, FileOptions::new());
//! let pauser = upload.clone();
//! tokio::spawn(async move { pauser.pause().await });
//! if upload.start_or_resume().await? == UploadStatus::Paused {
//!     upload.start_or_resume().await?;
//! }
//! ```

pub mod client;
pub mod error;
pub mod file_api;
pub mod resumable;
pub mod types;

pub use client::{StorageClient, StorageConfig, DEFAULT_UPLOAD_CHUNK_SIZE};
pub use error::{StorageApiErrorResponse, StorageError};
pub use file_api::StorageFileApi;
pub use resumable::ResumableUpload;
pub use types::{
    Bucket, BucketOptions, CreateBucketResponse, FileObject, FileOptions, SearchOptions, SortBy,
    SortOrder, UploadResponse, UploadStatus,
};
