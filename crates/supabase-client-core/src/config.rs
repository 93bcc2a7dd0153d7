use std::collections::HashMap;

use url::Url;

use crate::error::{SupabaseError, SupabaseResult};
use crate::CLIENT_INFO;

/// Project-level configuration shared by every service client.
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    /// Supabase project URL (e.g. "https://your-project.supabase.co")
    pub supabase_url: String,
    /// Supabase anon or service key
    pub supabase_key: String,
    /// Extra headers sent with every request to every service
    pub headers: HashMap<String, String>,
}

impl SupabaseConfig {
    /// Create a config for the given project URL and API key.
    pub fn new(supabase_url: impl Into<String>, supabase_key: impl Into<String>) -> Self {
        Self {
            supabase_url: supabase_url.into(),
            supabase_key: supabase_key.into(),
            headers: HashMap::new(),
        }
    }

    /// Add a global header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Validate that URL and key are usable.
    pub fn validate(&self) -> SupabaseResult<()> {
        if self.supabase_key.trim().is_empty() {
            return Err(SupabaseError::config("supabase_key must not be empty"));
        }
        let url = Url::parse(&self.supabase_url)?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(SupabaseError::config(format!(
                "unsupported URL scheme: {}",
                other
            ))),
        }
    }

    /// URL of a versioned service endpoint, e.g. `service_url("auth")` →
    /// `https://host/auth/v1`.
    pub fn service_url(&self, service: &str) -> SupabaseResult<Url> {
        let base = self.supabase_url.trim_end_matches('/');
        Ok(Url::parse(&format!("{}/{}/v1", base, service))?)
    }

    pub fn auth_url(&self) -> SupabaseResult<Url> {
        self.service_url("auth")
    }

    pub fn realtime_url(&self) -> SupabaseResult<Url> {
        self.service_url("realtime")
    }

    pub fn storage_url(&self) -> SupabaseResult<Url> {
        self.service_url("storage")
    }

    pub fn functions_url(&self) -> SupabaseResult<Url> {
        self.service_url("functions")
    }

    /// Headers every service client starts from: client info, API key and
    /// the user-supplied global headers (which win on conflict).
    pub fn default_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("X-Client-Info".to_string(), CLIENT_INFO.to_string());
        headers.insert("apikey".to_string(), self.supabase_key.clone());
        for (key, value) in &self.headers {
            headers.insert(key.clone(), value.clone());
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_urls() {
        let config = SupabaseConfig::new("https://example.supabase.co/", "key");
        assert_eq!(
            config.auth_url().unwrap().as_str(),
            "https://example.supabase.co/auth/v1"
        );
        assert_eq!(config.realtime_url().unwrap().path(), "/realtime/v1");
        assert_eq!(config.storage_url().unwrap().path(), "/storage/v1");
        assert_eq!(config.functions_url().unwrap().path(), "/functions/v1");
    }

    #[test]
    fn default_headers_carry_key_and_client_info() {
        let config = SupabaseConfig::new("https://example.supabase.co", "anon")
            .header("x-custom", "1");
        let headers = config.default_headers();
        assert_eq!(headers.get("apikey").map(String::as_str), Some("anon"));
        assert_eq!(headers.get("x-custom").map(String::as_str), Some("1"));
        assert!(headers["X-Client-Info"].starts_with("supabase-client-rs/"));
    }

    #[test]
    fn validate_rejects_bad_input() {
        assert!(SupabaseConfig::new("https://example.supabase.co", "")
            .validate()
            .is_err());
        assert!(SupabaseConfig::new("ftp://example.supabase.co", "key")
            .validate()
            .is_err());
        assert!(SupabaseConfig::new("http://127.0.0.1:54321", "key")
            .validate()
            .is_ok());
    }
}
