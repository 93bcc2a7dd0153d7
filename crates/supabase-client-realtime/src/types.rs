use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Wire Message ──────────────────────────────────────────────────────────────

/// A message on the realtime socket (Phoenix channels `vsn=1.0.0` JSON form).
///
/// Field names are part of the wire contract with the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref")]
    pub msg_ref: Option<String>,
    pub join_ref: Option<String>,
}

impl RealtimeMessage {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref: None,
            join_ref: None,
        }
    }

    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }
}

// ── Socket Status ─────────────────────────────────────────────────────────────

/// Connection state of the realtime socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SocketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

// ── Channel Status ────────────────────────────────────────────────────────────

/// Subscription state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsubscribed => write!(f, "unsubscribed"),
            Self::Subscribing => write!(f, "subscribing"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Unsubscribing => write!(f, "unsubscribing"),
        }
    }
}

// ── Push Status ───────────────────────────────────────────────────────────────

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Ok,
    Error,
    Timeout,
}

impl PushStatus {
    /// Parse the `status` field of a `phx_reply` payload.
    pub fn from_reply(status: &str) -> Self {
        match status {
            "ok" => Self::Ok,
            "timeout" => Self::Timeout,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

// ── Postgres Changes ──────────────────────────────────────────────────────────

/// Which Postgres change events to listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostgresChangesEvent {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl PostgresChangesEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "*",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Whether a change of the given type (`"INSERT"` etc.) matches.
    pub fn matches(&self, change_type: &str) -> bool {
        matches!(self, Self::All) || self.as_str() == change_type
    }
}

impl fmt::Display for PostgresChangesEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter for a postgres_changes subscription, sent in the join payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChangesFilter {
    pub event: PostgresChangesEvent,
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresChangesFilter {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            event: PostgresChangesEvent::All,
            schema: schema.into(),
            table: Some(table.into()),
            filter: None,
        }
    }

    /// Every table in a schema.
    pub fn schema_only(schema: impl Into<String>) -> Self {
        Self {
            event: PostgresChangesEvent::All,
            schema: schema.into(),
            table: None,
            filter: None,
        }
    }

    /// Row-level filter, e.g. `"id=eq.1"`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Row change delivered on a postgres_changes binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresChangePayload {
    pub schema: String,
    pub table: String,
    #[serde(rename = "type")]
    pub change_type: String,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
    #[serde(default)]
    pub errors: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

// ── Presence ──────────────────────────────────────────────────────────────────

/// Presence key → metas currently tracked under that key.
pub type PresenceState = HashMap<String, Vec<PresenceMeta>>;

/// One tracked presence (a key may have several, e.g. one per device).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    #[serde(default)]
    pub phx_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phx_ref_prev: Option<String>,
    #[serde(flatten)]
    pub data: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: HashMap<String, PresenceEntry>,
    #[serde(default)]
    pub leaves: HashMap<String, PresenceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub metas: Vec<PresenceMeta>,
}

// ── Join Payload ──────────────────────────────────────────────────────────────

/// Payload of `phx_join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub config: JoinConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinConfig {
    pub broadcast: BroadcastConfig,
    pub presence: PresenceConfig,
    pub postgres_changes: Vec<PostgresChangesFilter>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Server acknowledges each broadcast; `send` waits for it.
    pub ack: bool,
    /// Deliver our own broadcasts back to us.
    #[serde(rename = "self")]
    pub self_send: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub key: String,
}

// ── Realtime Config ───────────────────────────────────────────────────────────

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(7);
pub const DEFAULT_TIMEOUT_INTERVAL: Duration = Duration::from_secs(10);

/// Socket configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Project URL (http/https); the websocket endpoint is derived from it.
    pub url: String,
    pub api_key: String,
    /// Extra headers for the websocket handshake.
    pub headers: HashMap<String, String>,
    pub heartbeat_interval: Duration,
    /// Delay before reconnecting after an unplanned connection loss.
    pub reconnect_delay: Duration,
    /// Bounds the handshake and every acknowledged push.
    pub timeout_interval: Duration,
    /// Disconnect when the auth session goes away.
    pub disconnect_on_session_loss: bool,
    /// Let `subscribe()` open the socket when it is not connected yet.
    pub connect_on_subscribe: bool,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            headers: HashMap::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            timeout_interval: DEFAULT_TIMEOUT_INTERVAL,
            disconnect_on_session_loss: true,
            connect_on_subscribe: true,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn timeout_interval(mut self, timeout: Duration) -> Self {
        self.timeout_interval = timeout;
        self
    }

    pub fn disconnect_on_session_loss(mut self, disconnect: bool) -> Self {
        self.disconnect_on_session_loss = disconnect;
        self
    }

    pub fn connect_on_subscribe(mut self, connect: bool) -> Self {
        self.connect_on_subscribe = connect;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_uses_wire_field_names() {
        let msg = RealtimeMessage::new("realtime:room", "phx_join", json!({}))
            .with_ref("3")
            .with_join_ref("3");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["ref"], "3");
        assert_eq!(value["join_ref"], "3");
        assert_eq!(value["topic"], "realtime:room");
        assert!(value.get("msg_ref").is_none());
    }

    #[test]
    fn message_accepts_null_refs() {
        let msg: RealtimeMessage = serde_json::from_value(json!({
            "topic": "realtime:room",
            "event": "broadcast",
            "payload": {"event": "msg"},
            "ref": null,
            "join_ref": null
        }))
        .unwrap();
        assert!(msg.msg_ref.is_none());
        assert!(msg.join_ref.is_none());
    }

    #[test]
    fn push_status_from_reply() {
        assert_eq!(PushStatus::from_reply("ok"), PushStatus::Ok);
        assert_eq!(PushStatus::from_reply("timeout"), PushStatus::Timeout);
        assert_eq!(PushStatus::from_reply("error"), PushStatus::Error);
        assert_eq!(PushStatus::from_reply("garbage"), PushStatus::Error);
    }

    #[test]
    fn config_defaults() {
        let config = RealtimeConfig::new("http://localhost:54321", "key");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.reconnect_delay, Duration::from_secs(7));
        assert_eq!(config.timeout_interval, Duration::from_secs(10));
        assert!(config.disconnect_on_session_loss);
        assert!(config.connect_on_subscribe);
    }

    #[test]
    fn join_config_serialization() {
        let payload = JoinPayload {
            config: JoinConfig {
                broadcast: BroadcastConfig {
                    ack: true,
                    self_send: false,
                },
                presence: PresenceConfig {
                    key: "user-1".into(),
                },
                postgres_changes: vec![PostgresChangesFilter::new("public", "messages")
                    .with_filter("room_id=eq.1")],
                private: false,
            },
            access_token: Some("token".into()),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["config"]["broadcast"]["self"], false);
        assert_eq!(value["config"]["broadcast"]["ack"], true);
        assert_eq!(value["config"]["presence"]["key"], "user-1");
        assert_eq!(value["config"]["postgres_changes"][0]["event"], "*");
        assert_eq!(value["config"]["postgres_changes"][0]["filter"], "room_id=eq.1");
        assert_eq!(value["access_token"], "token");
    }

    #[test]
    fn postgres_event_matching() {
        assert!(PostgresChangesEvent::All.matches("DELETE"));
        assert!(PostgresChangesEvent::Insert.matches("INSERT"));
        assert!(!PostgresChangesEvent::Insert.matches("UPDATE"));
    }
}
