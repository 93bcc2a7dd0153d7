use std::sync::Arc;
use std::time::Duration;

use supabase_client_auth::{AuthFlowType, AuthLocalStorage, DEFAULT_EXPIRY_MARGIN, STORAGE_KEY};
use supabase_client_realtime::types::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONNECT_DELAY, DEFAULT_TIMEOUT_INTERVAL,
};

/// Per-service knobs for [`SupabaseClient::new`](crate::SupabaseClient::new).
/// URL, key and global headers come from the
/// [`SupabaseConfig`](supabase_client_core::SupabaseConfig).
#[derive(Clone, Default)]
pub struct SupabaseClientOptions {
    pub auth: AuthOptions,
    pub realtime: RealtimeOptions,
    /// TUS chunk size for resumable uploads; `None` keeps the server default.
    pub upload_chunk_size: Option<usize>,
}

impl SupabaseClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth(mut self, auth: AuthOptions) -> Self {
        self.auth = auth;
        self
    }

    pub fn realtime(mut self, realtime: RealtimeOptions) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn upload_chunk_size(mut self, size: usize) -> Self {
        self.upload_chunk_size = Some(size);
        self
    }
}

impl std::fmt::Debug for SupabaseClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClientOptions")
            .field("auth", &self.auth)
            .field("realtime", &self.realtime)
            .field("upload_chunk_size", &self.upload_chunk_size)
            .finish()
    }
}

/// Session persistence and refresh behaviour.
#[derive(Clone)]
pub struct AuthOptions {
    /// Where the session is persisted; in-memory when `None`.
    pub storage: Option<Arc<dyn AuthLocalStorage>>,
    pub storage_key: String,
    pub flow_type: AuthFlowType,
    pub expiry_margin: Duration,
    /// Start the background refresh ticker on construction.
    pub auto_refresh_token: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            storage: None,
            storage_key: STORAGE_KEY.to_string(),
            flow_type: AuthFlowType::default(),
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
            auto_refresh_token: true,
        }
    }
}

impl AuthOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(mut self, storage: Arc<dyn AuthLocalStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn flow_type(mut self, flow_type: AuthFlowType) -> Self {
        self.flow_type = flow_type;
        self
    }

    pub fn expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    pub fn auto_refresh_token(mut self, enabled: bool) -> Self {
        self.auto_refresh_token = enabled;
        self
    }
}

impl std::fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthOptions")
            .field("persistent", &self.storage.is_some())
            .field("storage_key", &self.storage_key)
            .field("flow_type", &self.flow_type)
            .field("expiry_margin", &self.expiry_margin)
            .field("auto_refresh_token", &self.auto_refresh_token)
            .finish()
    }
}

/// Socket timing and session-loss behaviour.
#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub timeout_interval: Duration,
    pub disconnect_on_session_loss: bool,
    pub connect_on_subscribe: bool,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            timeout_interval: DEFAULT_TIMEOUT_INTERVAL,
            disconnect_on_session_loss: true,
            connect_on_subscribe: true,
        }
    }
}

impl RealtimeOptions {
    pub fn new() -> Self {
        Self::default()
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
