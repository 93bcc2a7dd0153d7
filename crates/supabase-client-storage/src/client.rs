use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use supabase_client_core::{bearer_token, AccessTokenProvider, SupabaseConfig, CLIENT_INFO};
use tracing::debug;
use url::Url;

use crate::error::{StorageApiErrorResponse, StorageError};
use crate::file_api::StorageFileApi;
use crate::types::{Bucket, BucketOptions, CreateBucketBody, CreateBucketResponse};

/// Supabase refuses TUS chunks other than 6 MiB (except the last one).
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 6 * 1024 * 1024;

// ─── Configuration ────────────────────────────────────────────

/// Configuration for [`StorageClient`].
#[derive(Clone)]
pub struct StorageConfig {
    /// Project URL; the storage API lives under `/storage/v1`.
    pub url: String,
    pub api_key: String,
    pub headers: HashMap<String, String>,
    /// Source of the user's access token. Without one, or when it yields
    /// nothing, requests authenticate with the API key.
    pub token_provider: Option<Arc<dyn AccessTokenProvider>>,
    pub upload_chunk_size: usize,
}

impl StorageConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            headers: HashMap::new(),
            token_provider: None,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }

    /// Start from a project config, inheriting its global headers.
    pub fn from_supabase(config: &SupabaseConfig) -> Self {
        let mut storage = Self::new(&config.supabase_url, &config.supabase_key);
        storage.headers = config.headers.clone();
        storage
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn AccessTokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn upload_chunk_size(mut self, size: usize) -> Self {
        self.upload_chunk_size = size;
        self
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("url", &self.url)
            .field("has_token_provider", &self.token_provider.is_some())
            .field("upload_chunk_size", &self.upload_chunk_size)
            .finish_non_exhaustive()
    }
}

// ─── Client ───────────────────────────────────────────────────

/// HTTP client for the Supabase Storage API (`/storage/v1/...`).
///
/// # Example
/// ```ignore
/// use supabase_client_storage::{BucketOptions, StorageClient};
///
/// let storage = StorageClient::new("https://your-project.supabase.co", "your-anon-key")?;
/// storage.create_bucket("avatars", BucketOptions::new().public(true)).await?;
/// let avatars = storage.from("avatars");
/// ```
#[derive(Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    token_provider: Option<Arc<dyn AccessTokenProvider>>,
    upload_chunk_size: usize,
}

impl StorageClient {
    /// Client authenticating with the API key only.
    pub fn new(supabase_url: &str, api_key: &str) -> Result<Self, StorageError> {
        Self::with_config(StorageConfig::new(supabase_url, api_key))
    }

    pub fn with_config(config: StorageConfig) -> Result<Self, StorageError> {
        if config.api_key.trim().is_empty() {
            return Err(StorageError::InvalidConfig("api_key must not be empty".into()));
        }
        if config.upload_chunk_size == 0 {
            return Err(StorageError::InvalidConfig(
                "upload_chunk_size must be positive".into(),
            ));
        }
        let base = config.url.trim_end_matches('/');
        let base_url = Url::parse(&format!("{}/storage/v1", base))?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            "apikey",
            HeaderValue::from_str(&config.api_key)
                .map_err(|e| StorageError::InvalidConfig(format!("Invalid API key header: {}", e)))?,
        );
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        default_headers.insert("X-Client-Info", HeaderValue::from_static(CLIENT_INFO));
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| StorageError::InvalidConfig(format!("Invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| StorageError::InvalidConfig(format!("Invalid header value: {}", e)))?;
            default_headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(StorageError::Http)?;

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key,
            token_provider: config.token_provider,
            upload_chunk_size: config.upload_chunk_size,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ─── Bucket Operations ───────────────────────────────────────

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>, StorageError> {
        let resp = self.request(Method::GET, "/bucket").await.send().await?;
        self.handle_response(resp).await
    }

    pub async fn get_bucket(&self, id: &str) -> Result<Bucket, StorageError> {
        let resp = self
            .request(Method::GET, &format!("/bucket/{}", id))
            .await
            .send()
            .await?;
        self.handle_response(resp).await
    }

    /// Create a bucket whose name equals its id.
    pub async fn create_bucket(
        &self,
        id: &str,
        options: BucketOptions,
    ) -> Result<CreateBucketResponse, StorageError> {
        let body = CreateBucketBody {
            id,
            name: id,
            options: &options,
        };
        let resp = self
            .request(Method::POST, "/bucket")
            .await
            .json(&body)
            .send()
            .await?;
        let created: CreateBucketResponse = self.handle_response(resp).await?;
        debug!(bucket = id, "Bucket created");
        Ok(created)
    }

    /// Delete a bucket. The server refuses non-empty buckets.
    pub async fn delete_bucket(&self, id: &str) -> Result<(), StorageError> {
        let resp = self
            .request(Method::DELETE, &format!("/bucket/{}", id))
            .await
            .json(&json!({}))
            .send()
            .await?;
        self.handle_empty_response(resp).await
    }

    /// Object operations scoped to one bucket.
    pub fn from(&self, bucket: &str) -> StorageFileApi {
        StorageFileApi::new(self.clone(), bucket.to_string())
    }

    // ─── Internal Helpers ────────────────────────────────────────

    pub(crate) fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let current = url.path().to_string();
        match path.split_once('?') {
            Some((path, query)) => {
                url.set_path(&format!("{}{}", current, path));
                url.set_query(Some(query));
            }
            None => url.set_path(&format!("{}{}", current, path)),
        }
        url
    }

    /// Request to a path under the storage base URL, authorised with the
    /// current bearer token.
    pub(crate) async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.request_url(method, self.url(path)).await
    }

    pub(crate) async fn request_url(&self, method: Method, url: Url) -> RequestBuilder {
        let token = bearer_token(self.token_provider.as_deref(), &self.api_key).await;
        self.http.request(method, url).bearer_auth(token)
    }

    pub(crate) fn upload_chunk_size(&self) -> usize {
        self.upload_chunk_size
    }

    pub(crate) async fn handle_response<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, StorageError> {
        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(parse_error(status, resp).await);
        }
        Ok(resp.json().await?)
    }

    pub(crate) async fn handle_empty_response(
        &self,
        resp: reqwest::Response,
    ) -> Result<(), StorageError> {
        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(parse_error(status, resp).await);
        }
        Ok(())
    }

    pub(crate) async fn handle_bytes_response(
        &self,
        resp: reqwest::Response,
    ) -> Result<Vec<u8>, StorageError> {
        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(parse_error(status, resp).await);
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("base_url", &self.base_url.as_str())
            .field("has_token_provider", &self.token_provider.is_some())
            .finish_non_exhaustive()
    }
}

pub(crate) async fn parse_error(status: u16, resp: reqwest::Response) -> StorageError {
    match resp.json::<StorageApiErrorResponse>().await {
        Ok(body) => StorageError::Api {
            status,
            message: body.error_message(),
        },
        Err(_) => StorageError::Api {
            status,
            message: format!("HTTP {}", status),
        },
    }
}
