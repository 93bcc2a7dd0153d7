//! Builders for the messages the client sends.
//!
//! Refs are left unset unless the message needs one up front (`phx_join`
//! carries its ref as the join ref); the socket assigns the rest on push.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use crate::types::{JoinPayload, RealtimeMessage};

pub(crate) const PHOENIX_TOPIC: &str = "phoenix";

pub(crate) mod event {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    pub const SYSTEM: &str = "system";
}

/// Monotonic message refs, unique per socket.
pub(crate) struct RefCounter {
    counter: AtomicU64,
}

impl RefCounter {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> String {
        self.counter.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

pub(crate) fn heartbeat(msg_ref: String) -> RealtimeMessage {
    RealtimeMessage::new(PHOENIX_TOPIC, event::HEARTBEAT, json!({})).with_ref(msg_ref)
}

pub(crate) fn join(
    topic: &str,
    payload: &JoinPayload,
    join_ref: &str,
) -> Result<RealtimeMessage, serde_json::Error> {
    Ok(
        RealtimeMessage::new(topic, event::JOIN, serde_json::to_value(payload)?)
            .with_ref(join_ref)
            .with_join_ref(join_ref),
    )
}

pub(crate) fn leave(topic: &str, join_ref: &str) -> RealtimeMessage {
    RealtimeMessage::new(topic, event::LEAVE, json!({})).with_join_ref(join_ref)
}

pub(crate) fn broadcast(topic: &str, event: &str, payload: Value, join_ref: &str) -> RealtimeMessage {
    RealtimeMessage::new(
        topic,
        event::BROADCAST,
        json!({
            "type": "broadcast",
            "event": event,
            "payload": payload,
        }),
    )
    .with_join_ref(join_ref)
}

pub(crate) fn presence_track(topic: &str, payload: Value, join_ref: &str) -> RealtimeMessage {
    RealtimeMessage::new(
        topic,
        event::PRESENCE,
        json!({
            "type": "presence",
            "event": "track",
            "payload": payload,
        }),
    )
    .with_join_ref(join_ref)
}

pub(crate) fn presence_untrack(topic: &str, join_ref: &str) -> RealtimeMessage {
    RealtimeMessage::new(
        topic,
        event::PRESENCE,
        json!({
            "type": "presence",
            "event": "untrack",
        }),
    )
    .with_join_ref(join_ref)
}

pub(crate) fn access_token(topic: &str, token: &str, join_ref: &str) -> RealtimeMessage {
    RealtimeMessage::new(topic, event::ACCESS_TOKEN, json!({ "access_token": token }))
        .with_join_ref(join_ref)
}

/// `status` and `response` of a `phx_reply` payload.
pub(crate) fn reply_parts(payload: &Value) -> (&str, Value) {
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("error");
    let response = payload.get("response").cloned().unwrap_or(Value::Null);
    (status, response)
}
