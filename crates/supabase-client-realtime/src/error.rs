use std::time::Duration;

use crate::types::ChannelStatus;
use supabase_client_core::SupabaseError;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Socket is not connected")]
    NotConnected,

    #[error("Channel already exists: {0}")]
    ChannelAlreadyExists(String),

    #[error("Invalid channel state: expected {expected}, actual {actual}")]
    InvalidChannelState {
        expected: ChannelStatus,
        actual: ChannelStatus,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server error: {0}")]
    ServerError(String),
}

impl From<RealtimeError> for SupabaseError {
    fn from(e: RealtimeError) -> Self {
        SupabaseError::Realtime(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = RealtimeError::Timeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "Timed out after 10s");

        let err = RealtimeError::InvalidChannelState {
            expected: ChannelStatus::Subscribed,
            actual: ChannelStatus::Unsubscribed,
        };
        assert_eq!(
            err.to_string(),
            "Invalid channel state: expected subscribed, actual unsubscribed"
        );
    }

    #[test]
    fn converts_to_supabase_error() {
        let err: SupabaseError = RealtimeError::NotConnected.into();
        match err {
            SupabaseError::Realtime(msg) => assert!(msg.contains("not connected")),
            other => panic!("expected Realtime variant, got {other:?}"),
        }
    }
}
