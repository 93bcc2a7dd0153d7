use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use supabase_client_core::{bearer_token, AccessTokenProvider, SupabaseConfig, CLIENT_INFO};
use tracing::debug;
use url::Url;

use crate::error::{FunctionsApiErrorResponse, FunctionsError};
use crate::types::{FunctionResponse, InvokeBody, InvokeOptions};

/// Configuration for [`FunctionsClient`].
#[derive(Clone)]
pub struct FunctionsConfig {
    /// Project URL; functions live under `/functions/v1`.
    pub url: String,
    pub api_key: String,
    pub headers: HashMap<String, String>,
    pub token_provider: Option<Arc<dyn AccessTokenProvider>>,
}

impl FunctionsConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            headers: HashMap::new(),
            token_provider: None,
        }
    }

    pub fn from_supabase(config: &SupabaseConfig) -> Self {
        let mut functions = Self::new(&config.supabase_url, &config.supabase_key);
        functions.headers = config.headers.clone();
        functions
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn AccessTokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }
}

impl std::fmt::Debug for FunctionsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionsConfig")
            .field("url", &self.url)
            .field("has_token_provider", &self.token_provider.is_some())
            .finish_non_exhaustive()
    }
}

/// Client for invoking Edge Functions at `/functions/v1/{name}`.
///
/// # Example
/// ```ignore
/// use supabase_client_functions::{FunctionsClient, InvokeOptions};
/// use serde_json::json;
///
/// let functions = FunctionsClient::new("https://your-project.supabase.co", "anon-key")?;
/// let response = functions
///     .invoke("hello", InvokeOptions::new().body(json!({ "name": "World" })))
///     .await?;
/// let data: serde_json::Value = response.json()?;
/// ```
#[derive(Clone)]
pub struct FunctionsClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    token_provider: Option<Arc<dyn AccessTokenProvider>>,
}

impl FunctionsClient {
    pub fn new(supabase_url: &str, api_key: &str) -> Result<Self, FunctionsError> {
        Self::with_config(FunctionsConfig::new(supabase_url, api_key))
    }

    pub fn with_config(config: FunctionsConfig) -> Result<Self, FunctionsError> {
        if config.api_key.trim().is_empty() {
            return Err(FunctionsError::InvalidConfig("api_key must not be empty".into()));
        }
        let base = config.url.trim_end_matches('/');
        let base_url = Url::parse(&format!("{}/functions/v1", base))?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert("apikey", header_value(&config.api_key)?);
        default_headers.insert("X-Client-Info", HeaderValue::from_static(CLIENT_INFO));
        for (key, value) in &config.headers {
            default_headers.insert(header_name(key)?, header_value(value)?);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(FunctionsError::Http)?;

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key,
            token_provider: config.token_provider,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Invoke a deployed function.
    ///
    /// # Errors
    /// * [`FunctionsError::RelayError`] if the relay rejected the call.
    /// * [`FunctionsError::HttpError`] if the function answered non-2xx.
    /// * [`FunctionsError::Http`] on transport failure.
    pub async fn invoke(
        &self,
        function_name: &str,
        options: InvokeOptions,
    ) -> Result<FunctionResponse, FunctionsError> {
        let url = self.function_url(function_name)?;
        debug!(function = function_name, method = %options.method, "Invoking edge function");

        let token = bearer_token(self.token_provider.as_deref(), &self.api_key).await;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
        if let Some(content_type) = options.body.content_type() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        if let Some(region) = &options.region {
            headers.insert("x-region", header_value(region)?);
        }
        for (key, value) in &options.headers {
            headers.insert(header_name(key)?, header_value(value)?);
        }

        let request = self.http.request(options.method, url).headers(headers);
        let request = match options.body {
            InvokeBody::Json(value) => request.body(serde_json::to_vec(&value)?),
            InvokeBody::Bytes(bytes) => request.body(bytes),
            InvokeBody::Text(text) => request.body(text),
            InvokeBody::None => request,
        };

        let response = request.send().await?;
        let status = response.status().as_u16();
        let is_relay_error = response
            .headers()
            .get("x-relay-error")
            .and_then(|v| v.to_str().ok())
            == Some("true");
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        if is_relay_error {
            let message = error_message(&body);
            debug!(function = function_name, status, message = %message, "Relay error");
            return Err(FunctionsError::RelayError { status, message });
        }
        if status >= 400 {
            let message = error_message(&body);
            debug!(function = function_name, status, message = %message, "Function returned an error");
            return Err(FunctionsError::HttpError { status, message });
        }

        Ok(FunctionResponse::new(status, headers, body))
    }

    fn function_url(&self, function_name: &str) -> Result<Url, FunctionsError> {
        let name = function_name.trim_matches('/');
        if name.is_empty() {
            return Err(FunctionsError::InvalidConfig("function name must not be empty".into()));
        }
        Ok(Url::parse(&format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            name
        ))?)
    }
}

impl std::fmt::Debug for FunctionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionsClient")
            .field("base_url", &self.base_url.as_str())
            .field("has_token_provider", &self.token_provider.is_some())
            .finish_non_exhaustive()
    }
}

fn header_name(name: &str) -> Result<HeaderName, FunctionsError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| FunctionsError::InvalidConfig(format!("Invalid header name '{}': {}", name, e)))
}

fn header_value(value: &str) -> Result<HeaderValue, FunctionsError> {
    HeaderValue::from_str(value)
        .map_err(|e| FunctionsError::InvalidConfig(format!("Invalid header value: {}", e)))
}

/// JSON `message`/`error` if the body has one, the raw text otherwise.
fn error_message(body: &[u8]) -> String {
    match serde_json::from_slice::<FunctionsApiErrorResponse>(body) {
        Ok(parsed) => parsed.error_message(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}
