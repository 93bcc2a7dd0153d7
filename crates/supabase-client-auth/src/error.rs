use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use supabase_client_core::SupabaseError;

/// Error response format from the GoTrue API.
///
/// GoTrue may return errors in different shapes; this covers the common fields.
#[derive(Debug, Clone, Deserialize)]
pub struct GoTrueErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl GoTrueErrorResponse {
    /// Extract the most informative error message from the response.
    pub fn error_message(&self) -> String {
        self.msg
            .as_deref()
            .or(self.message.as_deref())
            .or(self.error_description.as_deref())
            .or(self.error.as_deref())
            .unwrap_or("Unknown error")
            .to_string()
    }

    /// The machine-readable error code, from `error_code` or a string `code`.
    pub fn code(&self) -> Option<AuthErrorCode> {
        self.error_code
            .as_deref()
            .or_else(|| self.code.as_ref().and_then(|c| c.as_str()))
            .map(AuthErrorCode::from)
    }
}

/// Failure of the local session persistence backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LocalStorageError {
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("Stored value is corrupt: {0}")]
    Corrupt(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for LocalStorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Auth-specific errors.
///
/// `Clone` so a single refresh outcome can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// HTTP transport error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[source] Arc<reqwest::Error>),

    /// GoTrue API returned an error response.
    #[error("Auth API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        #[source]
        error_code: Option<AuthErrorCode>,
    },

    /// Invalid configuration (missing URL or key).
    #[error("Invalid auth configuration: {0}")]
    InvalidConfig(String),

    /// No session has been established, or the server no longer knows it.
    #[error("Auth session missing")]
    SessionMissing,

    /// Session has expired and cannot be refreshed.
    #[error("Session expired")]
    SessionExpired,

    /// Reading or writing the persisted session failed.
    #[error("Session storage error: {0}")]
    Storage(#[from] LocalStorageError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Invalid or malformed JWT token.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// A PKCE exchange was attempted but no code verifier was stored.
    #[error("PKCE code verifier not found in storage")]
    CodeVerifierMissing,

    /// A redirect URL did not carry the parameters of any supported flow.
    #[error("Invalid auth callback URL: {0}")]
    InvalidCallbackUrl(String),

    /// The shared operation was torn down before completing.
    #[error("Operation cancelled")]
    Cancelled,
}

impl AuthError {
    /// Whether the server explicitly rejected the session or refresh token,
    /// as opposed to a transient transport failure.
    pub fn is_session_revoked(&self) -> bool {
        match self {
            Self::SessionMissing => true,
            Self::Api {
                status,
                message,
                error_code,
            } => match error_code {
                Some(
                    AuthErrorCode::RefreshTokenNotFound
                    | AuthErrorCode::RefreshTokenAlreadyUsed
                    | AuthErrorCode::SessionNotFound
                    | AuthErrorCode::SessionExpired,
                ) => true,
                _ => {
                    matches!(status, 400 | 401 | 403)
                        && message.to_ascii_lowercase().contains("invalid refresh token")
                }
            },
            _ => false,
        }
    }

    /// Whether the failure happened before any response was received.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(Arc::new(e))
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(e))
    }
}

/// Known GoTrue error codes for programmatic matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthErrorCode {
    InvalidCredentials,
    UserNotFound,
    UserAlreadyExists,
    EmailNotConfirmed,
    PhoneNotConfirmed,
    SessionNotFound,
    SessionExpired,
    RefreshTokenNotFound,
    RefreshTokenAlreadyUsed,
    BadJwt,
    FlowStateNotFound,
    FlowStateExpired,
    BadCodeVerifier,
    OtpExpired,
    OtpDisabled,
    WeakPassword,
    SamePassword,
    ValidationFailed,
    OverRequestRateLimit,
    Unknown(String),
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials => write!(f, "invalid_credentials"),
            Self::UserNotFound => write!(f, "user_not_found"),
            Self::UserAlreadyExists => write!(f, "user_already_exists"),
            Self::EmailNotConfirmed => write!(f, "email_not_confirmed"),
            Self::PhoneNotConfirmed => write!(f, "phone_not_confirmed"),
            Self::SessionNotFound => write!(f, "session_not_found"),
            Self::SessionExpired => write!(f, "session_expired"),
            Self::RefreshTokenNotFound => write!(f, "refresh_token_not_found"),
            Self::RefreshTokenAlreadyUsed => write!(f, "refresh_token_already_used"),
            Self::BadJwt => write!(f, "bad_jwt"),
            Self::FlowStateNotFound => write!(f, "flow_state_not_found"),
            Self::FlowStateExpired => write!(f, "flow_state_expired"),
            Self::BadCodeVerifier => write!(f, "bad_code_verifier"),
            Self::OtpExpired => write!(f, "otp_expired"),
            Self::OtpDisabled => write!(f, "otp_disabled"),
            Self::WeakPassword => write!(f, "weak_password"),
            Self::SamePassword => write!(f, "same_password"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::OverRequestRateLimit => write!(f, "over_request_rate_limit"),
            Self::Unknown(code) => write!(f, "{}", code),
        }
    }
}

impl std::error::Error for AuthErrorCode {}

impl From<&str> for AuthErrorCode {
    fn from(s: &str) -> Self {
        match s {
            "invalid_credentials" => Self::InvalidCredentials,
            "user_not_found" => Self::UserNotFound,
            "user_already_exists" => Self::UserAlreadyExists,
            "email_not_confirmed" => Self::EmailNotConfirmed,
            "phone_not_confirmed" => Self::PhoneNotConfirmed,
            "session_not_found" => Self::SessionNotFound,
            "session_expired" => Self::SessionExpired,
            "refresh_token_not_found" => Self::RefreshTokenNotFound,
            "refresh_token_already_used" => Self::RefreshTokenAlreadyUsed,
            "bad_jwt" => Self::BadJwt,
            "flow_state_not_found" => Self::FlowStateNotFound,
            "flow_state_expired" => Self::FlowStateExpired,
            "bad_code_verifier" => Self::BadCodeVerifier,
            "otp_expired" => Self::OtpExpired,
            "otp_disabled" => Self::OtpDisabled,
            "weak_password" => Self::WeakPassword,
            "same_password" => Self::SamePassword,
            "validation_failed" => Self::ValidationFailed,
            "over_request_rate_limit" => Self::OverRequestRateLimit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<AuthError> for SupabaseError {
    fn from(err: AuthError) -> Self {
        SupabaseError::Auth(err.to_string())
    }
}
