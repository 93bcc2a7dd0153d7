use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use supabase_client_core::platform::{self, SpawnHandle};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::channel::{self, ChannelBuilder, ChannelInner, RealtimeChannel};
use crate::error::RealtimeError;
use crate::protocol::{self, event, RefCounter, PHOENIX_TOPIC};
use crate::transport::{self, WsFrame, WsRead, WsSink};
use crate::types::{
    ChannelStatus, JoinConfig, RealtimeConfig, RealtimeMessage, SocketStatus,
};

// ── RealtimeClient ────────────────────────────────────────────────────────────

/// The realtime socket: one websocket shared by every channel.
///
/// Wraps `Arc<Inner>`, so clones share the connection.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<SocketInner>,
}

impl RealtimeClient {
    /// Create a client for a project URL and API key with default settings.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, RealtimeError> {
        Self::with_config(RealtimeConfig::new(url, api_key))
    }

    pub fn with_config(config: RealtimeConfig) -> Result<Self, RealtimeError> {
        if config.api_key.is_empty() {
            return Err(RealtimeError::InvalidConfig(
                "API key must not be empty".to_string(),
            ));
        }
        let endpoint = build_ws_url(&config.url, &config.api_key)?;
        let (status, _) = watch::channel(SocketStatus::Disconnected);

        Ok(Self {
            inner: Arc::new(SocketInner {
                config,
                endpoint,
                status,
                outbound: Mutex::new(Outbound::default()),
                channels: RwLock::new(HashMap::new()),
                refs: RefCounter::new(),
                access_token: RwLock::new(None),
                runner: tokio::sync::Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Websocket URL derived from the project URL.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Open the socket. Returns once the handshake succeeded; a failed first
    /// attempt is returned to the caller and not retried.
    ///
    /// Calling this while connecting or connected is a no-op. After an
    /// unplanned connection loss the socket reconnects on its own.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.inner.connect().await
    }

    /// Close the socket and stop reconnecting. Every channel ends up
    /// unsubscribed and queued messages are discarded.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub fn status(&self) -> SocketStatus {
        self.inner.status()
    }

    pub fn status_changes(&self) -> watch::Receiver<SocketStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Queue a message for sending. A missing ref is filled in; while
    /// disconnected the message is buffered and sent after connecting.
    pub fn push(&self, message: RealtimeMessage) {
        self.inner.push(message);
    }

    /// Start configuring channel `name`; its topic is `realtime:<name>`.
    pub fn channel(&self, name: &str) -> ChannelBuilder {
        ChannelBuilder {
            socket: Arc::clone(&self.inner),
            name: name.to_string(),
            config: JoinConfig::default(),
            bindings: Vec::new(),
            timeout: self.inner.config.timeout_interval,
        }
    }

    /// Unsubscribe (best effort) and forget a channel.
    pub async fn remove_channel(&self, channel: &RealtimeChannel) -> Result<(), RealtimeError> {
        if let Err(e) = channel.unsubscribe().await {
            debug!(topic = %channel.topic(), error = %e, "Leave failed while removing channel");
        }
        channel.inner.set_status(ChannelStatus::Unsubscribed);
        self.inner.unregister(&channel.inner);
        Ok(())
    }

    pub async fn remove_all_channels(&self) -> Result<(), RealtimeError> {
        for channel in self.channels() {
            self.remove_channel(&channel).await?;
        }
        Ok(())
    }

    /// Channels currently registered on the socket.
    pub fn channels(&self) -> Vec<RealtimeChannel> {
        self.inner
            .channels_snapshot()
            .into_iter()
            .map(|inner| RealtimeChannel { inner })
            .collect()
    }

    /// Use `token` for future joins and send it to every subscribed channel.
    /// `None` falls back to the API key for future joins.
    pub fn set_auth(&self, token: Option<String>) {
        self.inner.set_auth(token);
    }

    /// Token sent with joins: the user's access token, or the API key.
    pub fn access_token(&self) -> String {
        self.inner.access_token()
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.inner.status())
            .finish()
    }
}

// ── SocketInner ───────────────────────────────────────────────────────────────

pub(crate) struct SocketInner {
    pub(crate) config: RealtimeConfig,
    endpoint: String,
    status: watch::Sender<SocketStatus>,
    outbound: Mutex<Outbound>,
    /// Known channels by topic. Held weakly: a channel lives as long as a
    /// user handle (or an in-flight rejoin) does.
    channels: RwLock<HashMap<String, Weak<ChannelInner>>>,
    refs: RefCounter,
    access_token: RwLock<Option<String>>,
    runner: tokio::sync::Mutex<Option<Runner>>,
}

/// Messages waiting for the socket loop. `sender` is set while connected.
#[derive(Default)]
struct Outbound {
    sender: Option<mpsc::UnboundedSender<RealtimeMessage>>,
    buffer: Vec<RealtimeMessage>,
}

/// The background connection loop and its stop signal.
struct Runner {
    stop: oneshot::Sender<()>,
    task: SpawnHandle,
}

enum Exit {
    Stopped,
    /// Connection lost; carries a message taken off the queue but not sent.
    Lost(Option<RealtimeMessage>),
}

impl SocketInner {
    pub(crate) fn make_ref(&self) -> String {
        self.refs.next()
    }

    pub(crate) fn status(&self) -> SocketStatus {
        *self.status.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.status() == SocketStatus::Connected
    }

    fn set_status(&self, status: SocketStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "Socket status changed");
        }
    }

    pub(crate) fn access_token(&self) -> String {
        read(&self.access_token)
            .clone()
            .unwrap_or_else(|| self.config.api_key.clone())
    }

    pub(crate) fn push(&self, mut message: RealtimeMessage) {
        if message.msg_ref.is_none() {
            message.msg_ref = Some(self.make_ref());
        }
        let mut outbound = lock(&self.outbound);
        let message = match &outbound.sender {
            Some(sender) => match sender.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        trace!(topic = %message.topic, event = %message.event, "Buffering message until connected");
        outbound.buffer.push(message);
    }

    // ── Channels ──

    pub(crate) fn register(&self, channel: &Arc<ChannelInner>) -> Result<(), RealtimeError> {
        let mut channels = write(&self.channels);
        channels.retain(|_, existing| existing.strong_count() > 0);
        match channels.entry(channel.topic.clone()) {
            Entry::Occupied(existing) if existing.get().as_ptr() == Arc::as_ptr(channel) => Ok(()),
            Entry::Occupied(_) => Err(RealtimeError::ChannelAlreadyExists(channel.topic.clone())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::downgrade(channel));
                Ok(())
            }
        }
    }

    pub(crate) fn unregister(&self, channel: &ChannelInner) {
        let mut channels = write(&self.channels);
        if channels
            .get(&channel.topic)
            .is_some_and(|existing| std::ptr::eq(existing.as_ptr(), channel))
        {
            channels.remove(&channel.topic);
        }
    }

    fn channel(&self, topic: &str) -> Option<Arc<ChannelInner>> {
        let found = read(&self.channels).get(topic).map(Weak::upgrade);
        match found {
            Some(Some(channel)) => Some(channel),
            Some(None) => {
                let mut channels = write(&self.channels);
                if channels.get(topic).is_some_and(|c| c.strong_count() == 0) {
                    channels.remove(topic);
                }
                None
            }
            None => None,
        }
    }

    fn channels_snapshot(&self) -> Vec<Arc<ChannelInner>> {
        let mut channels = write(&self.channels);
        channels.retain(|_, channel| channel.strong_count() > 0);
        channels.values().filter_map(Weak::upgrade).collect()
    }

    fn set_auth(&self, token: Option<String>) {
        *write(&self.access_token) = token.clone();
        let Some(token) = token else {
            return;
        };
        for channel in self.channels_snapshot() {
            if channel.status() != ChannelStatus::Subscribed {
                continue;
            }
            if let Some(join_ref) = channel.join_ref() {
                self.push(protocol::access_token(&channel.topic, &token, &join_ref));
            }
        }
    }

    // ── Connection lifecycle ──

    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), RealtimeError> {
        let mut runner = self.runner.lock().await;
        if runner.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Ok(());
        }

        self.set_status(SocketStatus::Connecting);
        debug!(url = %self.endpoint, "Connecting to Supabase Realtime");
        let ws = match handshake(&self.config, &self.endpoint).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "Realtime connection failed");
                self.set_status(SocketStatus::Disconnected);
                return Err(e);
            }
        };

        let outbound = self.open();
        let (stop, stop_rx) = oneshot::channel();
        let task = platform::spawn(run(Arc::downgrade(self), ws, outbound, stop_rx));
        *runner = Some(Runner { stop, task });
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        let runner = self.runner.lock().await.take();
        if let Some(Runner { stop, task }) = runner {
            let _ = stop.send(());
            task.join().await;
        }

        {
            let mut outbound = lock(&self.outbound);
            outbound.sender = None;
            outbound.buffer.clear();
        }
        self.set_status(SocketStatus::Disconnected);
        for channel in self.channels_snapshot() {
            channel.reset();
        }
        debug!("Disconnected from Supabase Realtime");
    }

    /// Connection is up: start the outbound queue with whatever was buffered,
    /// then rejoin channels that were subscribed before a connection loss.
    fn open(self: &Arc<Self>) -> mpsc::UnboundedReceiver<RealtimeMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut outbound = lock(&self.outbound);
            for message in outbound.buffer.drain(..) {
                let _ = tx.send(message);
            }
            outbound.sender = Some(tx);
        }
        self.set_status(SocketStatus::Connected);

        for channel in self.channels_snapshot() {
            if channel.take_rejoin() {
                debug!(topic = %channel.topic, "Rejoining channel");
                channel::spawn_rejoin(channel, Arc::clone(self));
            }
        }
        rx
    }

    /// Connection dropped: put unsent messages back in front of the buffer
    /// and mark subscribed channels for rejoin.
    fn connection_lost(
        &self,
        unsent: Option<RealtimeMessage>,
        outbound_rx: &mut mpsc::UnboundedReceiver<RealtimeMessage>,
    ) {
        self.set_status(SocketStatus::Disconnected);
        {
            let mut outbound = lock(&self.outbound);
            outbound.sender = None;
            let mut requeued: Vec<RealtimeMessage> = unsent.into_iter().collect();
            while let Ok(message) = outbound_rx.try_recv() {
                requeued.push(message);
            }
            requeued.append(&mut outbound.buffer);
            outbound.buffer = requeued;
        }
        for channel in self.channels_snapshot() {
            channel.mark_for_rejoin();
        }
    }

    fn handle_text(&self, text: &str, pending_heartbeat: &mut Option<String>) {
        let msg: RealtimeMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Failed to parse realtime message");
                return;
            }
        };
        trace!(topic = %msg.topic, event = %msg.event, msg_ref = ?msg.msg_ref, "Received message");

        if msg.topic == PHOENIX_TOPIC {
            if msg.event == event::REPLY && msg.msg_ref.is_some() && msg.msg_ref == *pending_heartbeat
            {
                *pending_heartbeat = None;
            }
            return;
        }

        match self.channel(&msg.topic) {
            Some(channel) => channel.handle(msg),
            None => debug!(
                topic = %msg.topic,
                event = %msg.event,
                "No channel for topic, dropping message"
            ),
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.get_mut().take() {
            let _ = runner.stop.send(());
        }
    }
}

// ── Connection loop ───────────────────────────────────────────────────────────

async fn handshake(
    config: &RealtimeConfig,
    endpoint: &str,
) -> Result<(WsSink, WsRead), RealtimeError> {
    platform::timeout(config.timeout_interval, transport::connect(config, endpoint))
        .await
        .map_err(|_| RealtimeError::Timeout(config.timeout_interval))?
}

/// Owns the websocket until `disconnect`, reconnecting after losses. Holds
/// the socket weakly so dropping the last client ends the loop.
async fn run(
    socket: Weak<SocketInner>,
    mut ws: (WsSink, WsRead),
    mut outbound: mpsc::UnboundedReceiver<RealtimeMessage>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let Some(heartbeat_interval) = socket.upgrade().map(|s| s.config.heartbeat_interval) else {
            return;
        };
        let unsent = match drive(&socket, ws, &mut outbound, &mut stop, heartbeat_interval).await {
            Exit::Stopped => return,
            Exit::Lost(unsent) => unsent,
        };
        ws = match reconnect(&socket, unsent, &mut outbound, &mut stop).await {
            Some(ws) => ws,
            None => return,
        };
    }
}

async fn drive(
    socket: &Weak<SocketInner>,
    ws: (WsSink, WsRead),
    outbound: &mut mpsc::UnboundedReceiver<RealtimeMessage>,
    stop: &mut oneshot::Receiver<()>,
    heartbeat_interval: Duration,
) -> Exit {
    let (mut sink, mut read) = ws;
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending_heartbeat: Option<String> = None;

    loop {
        tokio::select! {
            _ = &mut *stop => {
                transport::send_close(&mut sink).await;
                return Exit::Stopped;
            }
            frame = transport::recv(&mut read) => {
                let Some(inner) = socket.upgrade() else {
                    return Exit::Stopped;
                };
                match frame {
                    Some(Ok(WsFrame::Text(text))) => inner.handle_text(&text, &mut pending_heartbeat),
                    Some(Ok(WsFrame::Ping(data))) => {
                        if let Err(e) = transport::send_pong(&mut sink, data).await {
                            warn!(error = %e, "Pong failed");
                            return Exit::Lost(None);
                        }
                    }
                    Some(Ok(WsFrame::Close)) | None => {
                        debug!("WebSocket closed by server");
                        return Exit::Lost(None);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read error");
                        return Exit::Lost(None);
                    }
                }
            }
            Some(message) = outbound.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(topic = %message.topic, error = %e, "Dropping unserializable message");
                        continue;
                    }
                };
                trace!(topic = %message.topic, event = %message.event, msg_ref = ?message.msg_ref, "Sending message");
                if let Err(e) = transport::send_text(&mut sink, text).await {
                    warn!(error = %e, "WebSocket write failed");
                    return Exit::Lost(Some(message));
                }
            }
            _ = heartbeat.tick() => {
                if pending_heartbeat.take().is_some() {
                    warn!("Heartbeat timed out");
                    return Exit::Lost(None);
                }
                let Some(inner) = socket.upgrade() else {
                    return Exit::Stopped;
                };
                let message = protocol::heartbeat(inner.make_ref());
                pending_heartbeat = message.msg_ref.clone();
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode heartbeat");
                        continue;
                    }
                };
                trace!(msg_ref = ?pending_heartbeat, "Heartbeat");
                if let Err(e) = transport::send_text(&mut sink, text).await {
                    warn!(error = %e, "Heartbeat send failed");
                    return Exit::Lost(None);
                }
            }
        }
    }
}

/// Wait out the reconnect delay and retry until connected, stopped, or the
/// socket is dropped.
async fn reconnect(
    socket: &Weak<SocketInner>,
    unsent: Option<RealtimeMessage>,
    outbound: &mut mpsc::UnboundedReceiver<RealtimeMessage>,
    stop: &mut oneshot::Receiver<()>,
) -> Option<(WsSink, WsRead)> {
    let (config, endpoint) = {
        let inner = socket.upgrade()?;
        inner.connection_lost(unsent, outbound);
        (inner.config.clone(), inner.endpoint.clone())
    };

    loop {
        debug!(delay = ?config.reconnect_delay, "Reconnecting after delay");
        tokio::select! {
            _ = &mut *stop => return None,
            _ = platform::sleep(config.reconnect_delay) => {}
        }

        socket.upgrade()?.set_status(SocketStatus::Connecting);
        let attempt = tokio::select! {
            _ = &mut *stop => return None,
            attempt = handshake(&config, &endpoint) => attempt,
        };

        let inner = socket.upgrade()?;
        match attempt {
            Ok(ws) => {
                *outbound = inner.open();
                debug!("Reconnected to Supabase Realtime");
                return Some(ws);
            }
            Err(e) => {
                warn!(error = %e, "Reconnect failed");
                inner.set_status(SocketStatus::Disconnected);
            }
        }
    }
}

// ── WebSocket URL Construction ────────────────────────────────────────────────

/// Convert a project URL to the realtime websocket endpoint.
pub(crate) fn build_ws_url(base_url: &str, api_key: &str) -> Result<String, RealtimeError> {
    let mut parsed = url::Url::parse(base_url)?;

    let ws_scheme = match parsed.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RealtimeError::InvalidConfig(format!(
                "Unsupported URL scheme: {}",
                other
            )));
        }
    };
    parsed
        .set_scheme(ws_scheme)
        .map_err(|_| RealtimeError::InvalidConfig("Failed to set WS scheme".to_string()))?;

    let mut path = parsed.path().to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    path.push_str("realtime/v1/websocket");
    parsed.set_path(&path);

    parsed
        .query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");

    Ok(parsed.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
