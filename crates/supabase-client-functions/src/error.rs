use serde::Deserialize;
use supabase_client_core::SupabaseError;

/// Error body returned by a function or by the relay in front of it.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionsApiErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl FunctionsApiErrorResponse {
    pub fn error_message(&self) -> String {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("Unknown error")
            .to_string()
    }
}

/// Edge Functions errors.
///
/// [`RelayError`](FunctionsError::RelayError) means the request never
/// reached the function (the relay flagged it with `x-relay-error: true`);
/// [`HttpError`](FunctionsError::HttpError) is a non-2xx answer from the
/// function itself.
#[derive(Debug, thiserror::Error)]
pub enum FunctionsError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Functions HTTP error ({status}): {message}")]
    HttpError { status: u16, message: String },

    #[error("Functions relay error ({status}): {message}")]
    RelayError { status: u16, message: String },

    #[error("Invalid functions configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl FunctionsError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FunctionsError::HttpError { status, .. } | FunctionsError::RelayError { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<FunctionsError> for SupabaseError {
    fn from(err: FunctionsError) -> Self {
        SupabaseError::Functions(err.to_string())
    }
}
