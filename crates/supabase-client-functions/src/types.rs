use std::collections::HashMap;

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::FunctionsError;

/// Request body of an invocation. The content type follows the variant
/// unless overridden with a `content-type` header.
#[derive(Debug, Clone, Default)]
pub enum InvokeBody {
    Json(Value),
    Bytes(Vec<u8>),
    Text(String),
    #[default]
    None,
}

impl InvokeBody {
    pub(crate) fn content_type(&self) -> Option<&'static str> {
        match self {
            InvokeBody::Json(_) => Some("application/json"),
            InvokeBody::Bytes(_) => Some("application/octet-stream"),
            InvokeBody::Text(_) => Some("text/plain"),
            InvokeBody::None => None,
        }
    }
}

/// Options for [`FunctionsClient::invoke`](crate::FunctionsClient::invoke).
///
/// # Example
/// ```
/// use supabase_client_functions::InvokeOptions;
/// use serde_json::json;
///
/// let opts = InvokeOptions::new()
///     .body(json!({"name": "World"}))
///     .header("x-custom", "value");
/// ```
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub(crate) body: InvokeBody,
    pub(crate) method: Method,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) region: Option<String>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            body: InvokeBody::None,
            method: Method::POST,
            headers: HashMap::new(),
            region: None,
        }
    }
}

impl InvokeOptions {
    /// POST with no body.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(mut self, value: Value) -> Self {
        self.body = InvokeBody::Json(value);
        self
    }

    pub fn body_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.body = InvokeBody::Bytes(bytes);
        self
    }

    pub fn body_text(mut self, text: impl Into<String>) -> Self {
        self.body = InvokeBody::Text(text.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Per-call header. Wins over client defaults, including
    /// `Authorization`.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Route the call to a region (`x-region`), e.g. `"eu-west-1"`.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Successful (2xx) answer from a function.
#[derive(Debug, Clone)]
pub struct FunctionResponse {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl FunctionResponse {
    pub(crate) fn new(status: u16, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FunctionsError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.body
    }
}
