//! Supabase Realtime WebSocket client.
//!
//! Speaks the Phoenix channels v1.0.0 JSON protocol: one socket per
//! [`RealtimeClient`], any number of [`RealtimeChannel`]s multiplexed over
//! it for broadcast, presence and Postgres change feeds. The socket keeps
//! itself alive with heartbeats, reconnects after unplanned drops and
//! rejoins the channels that were subscribed.
//!
//! # Usage
//!
//! ```ignore
//! use supabase_client_realtime::{PostgresChangesEvent, PostgresChangesFilter, RealtimeClient};
//!
//! let realtime = RealtimeClient::new("https://your-project.supabase.co", "anon-key")?;
//!
//! let channel = realtime
//!     .channel("db-changes")
//!     .on_postgres_changes(
//!         PostgresChangesEvent::Insert,
//!         PostgresChangesFilter::new("public", "messages"),
//!         |change| println!("new row: {:?}", change.record),
//!     )
//!     .subscribe()
//!     .await?;
//!
//! channel.send("typing", serde_json::json!({ "user": "alice" })).await?;
//! ```

pub mod callback;
pub mod channel;
pub mod client;
pub mod error;
pub(crate) mod presence;
pub(crate) mod protocol;
pub mod push;
pub(crate) mod transport;
pub mod types;

pub use channel::{ChannelBuilder, RealtimeChannel};
pub use client::RealtimeClient;
pub use error::RealtimeError;
pub use push::Push;
pub use types::{
    BroadcastConfig, ChannelStatus, ColumnInfo, JoinConfig, JoinPayload, PostgresChangePayload,
    PostgresChangesEvent, PostgresChangesFilter, PresenceConfig, PresenceDiff, PresenceEntry,
    PresenceMeta, PresenceState, PushStatus, RealtimeConfig, RealtimeMessage, SocketStatus,
};
