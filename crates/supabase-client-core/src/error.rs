/// All errors that can surface from the umbrella `supabase-client` crate.
///
/// Service crates keep their own richer error enums and convert into this
/// one via `From`, flattening to a message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupabaseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Functions error: {0}")]
    Functions(String),
}

impl SupabaseError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<serde_json::Error> for SupabaseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for SupabaseError {
    fn from(e: url::ParseError) -> Self {
        Self::Config(format!("invalid URL: {}", e))
    }
}

/// Result alias using SupabaseError.
pub type SupabaseResult<T> = Result<T, SupabaseError>;
