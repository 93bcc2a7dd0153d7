use serde::Deserialize;
use supabase_client_core::SupabaseError;

/// Error body returned by the Storage API.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageApiErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "statusCode")]
    pub status_code: Option<String>,
}

impl StorageApiErrorResponse {
    /// `message` wins over `error`.
    pub fn error_message(&self) -> String {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("Unknown error")
            .to_string()
    }
}

/// Storage-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The resumable upload server broke the TUS protocol (missing
    /// `Location` or `Upload-Offset`, offset moving backwards).
    #[error("Resumable upload protocol error: {0}")]
    Protocol(String),
}

impl StorageError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// HTTP status of an API error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::Api { status, .. } => Some(*status),
            StorageError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<StorageError> for SupabaseError {
    fn from(err: StorageError) -> Self {
        SupabaseError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display() {
        let err = StorageError::Api {
            status: 404,
            message: "Bucket not found".into(),
        };
        assert_eq!(err.to_string(), "Storage API error (404): Bucket not found");
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn converts_to_supabase_error() {
        let supa: SupabaseError = StorageError::protocol("missing Location header").into();
        match supa {
            SupabaseError::Storage(msg) => assert!(msg.contains("Location")),
            other => panic!("Expected Storage variant, got: {:?}", other),
        }
    }

    #[test]
    fn error_body_prefers_message() {
        let json = r#"{"error":"not_found","message":"Object not found","statusCode":"404"}"#;
        let resp: StorageApiErrorResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status_code.as_deref(), Some("404"));
        assert_eq!(resp.error_message(), "Object not found");

        let resp: StorageApiErrorResponse =
            serde_json::from_str(r#"{"error":"Duplicate"}"#).unwrap();
        assert_eq!(resp.error_message(), "Duplicate");

        let resp: StorageApiErrorResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp.error_message(), "Unknown error");
    }
}
