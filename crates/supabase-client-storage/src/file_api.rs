use reqwest::Method;
use serde_json::json;

use crate::client::StorageClient;
use crate::error::StorageError;
use crate::resumable::ResumableUpload;
use crate::types::{FileObject, FileOptions, ListBody, SearchOptions, UploadResponse};

/// Object operations scoped to one bucket.
///
/// Created via [`StorageClient::from`].
///
/// # Example
/// ```ignore
/// let avatars = storage.from("avatars");
/// avatars.upload("me.png", bytes, FileOptions::new().content_type("image/png")).await?;
/// let bytes = avatars.download("me.png").await?;
/// ```
#[derive(Debug, Clone)]
pub struct StorageFileApi {
    client: StorageClient,
    bucket_id: String,
}

impl StorageFileApi {
    pub(crate) fn new(client: StorageClient, bucket_id: String) -> Self {
        Self { client, bucket_id }
    }

    pub fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    pub(crate) fn client(&self) -> &StorageClient {
        &self.client
    }

    /// Upload a whole file in one request. With `upsert` an existing object
    /// is overwritten, otherwise the server answers 409.
    pub async fn upload(
        &self,
        path: &str,
        data: Vec<u8>,
        options: FileOptions,
    ) -> Result<UploadResponse, StorageError> {
        let mut req = self
            .client
            .request(Method::POST, &self.object_path(path))
            .await
            .header("content-type", options.content_type_or_default())
            .header("cache-control", options.cache_control_header())
            .header("x-upsert", options.upsert.to_string())
            .body(data);
        if let Some(metadata) = &options.metadata {
            req = req.header("x-metadata", serde_json::to_string(metadata)?);
        }

        let resp = req.send().await?;
        self.client.handle_response(resp).await
    }

    pub async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let resp = self
            .client
            .request(Method::GET, &self.object_path(path))
            .await
            .send()
            .await?;
        self.client.handle_bytes_response(resp).await
    }

    /// Delete objects; returns the ones that were removed.
    pub async fn remove(&self, paths: &[&str]) -> Result<Vec<FileObject>, StorageError> {
        let resp = self
            .client
            .request(Method::DELETE, &format!("/object/{}", self.bucket_id))
            .await
            .json(&json!({ "prefixes": paths }))
            .send()
            .await?;
        self.client.handle_response(resp).await
    }

    /// List objects under a folder prefix (`None` for the bucket root).
    pub async fn list(
        &self,
        prefix: Option<&str>,
        options: SearchOptions,
    ) -> Result<Vec<FileObject>, StorageError> {
        let body = ListBody {
            prefix: prefix.unwrap_or(""),
            options: &options,
        };
        let resp = self
            .client
            .request(Method::POST, &format!("/object/list/{}", self.bucket_id))
            .await
            .json(&body)
            .send()
            .await?;
        self.client.handle_response(resp).await
    }

    /// Public URL of an object in a public bucket. No request is made.
    pub fn get_public_url(&self, path: &str) -> String {
        let base = self.client.base_url().as_str().trim_end_matches('/');
        format!("{}/object/public/{}/{}", base, self.bucket_id, path)
    }

    /// Prepare a pausable TUS upload of `data` to `path`. Nothing is sent
    /// until [`ResumableUpload::start_or_resume`] is called.
    pub fn resumable_upload(
        &self,
        path: &str,
        data: Vec<u8>,
        options: FileOptions,
    ) -> ResumableUpload {
        ResumableUpload::new(self.clone(), path.to_string(), data, options)
    }

    fn object_path(&self, path: &str) -> String {
        format!("/object/{}/{}", self.bucket_id, path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url() {
        let client = StorageClient::new("https://example.supabase.co", "key").unwrap();
        let docs = client.from("docs");
        assert_eq!(docs.bucket_id(), "docs");
        assert_eq!(
            docs.get_public_url("a/b/file.pdf"),
            "https://example.supabase.co/storage/v1/object/public/docs/a/b/file.pdf"
        );
    }

    #[test]
    fn object_path_strips_leading_slash() {
        let client = StorageClient::new("https://example.supabase.co", "key").unwrap();
        let docs = client.from("docs");
        assert_eq!(docs.object_path("/a.txt"), "/object/docs/a.txt");
        assert_eq!(docs.object_path("a.txt"), "/object/docs/a.txt");
    }
}
