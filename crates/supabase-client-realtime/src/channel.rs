use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use supabase_client_core::platform;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::callback::{self, Binding};
use crate::client::SocketInner;
use crate::error::RealtimeError;
use crate::presence::{self, PresenceChanges};
use crate::protocol::{self, event};
use crate::push::{Push, PushReply};
use crate::types::{
    ChannelStatus, JoinConfig, JoinPayload, PostgresChangePayload, PostgresChangesEvent,
    PostgresChangesFilter, PresenceDiff, PresenceMeta, PresenceState, PushStatus,
    RealtimeMessage,
};

// ── ChannelBuilder ────────────────────────────────────────────────────────────

/// Configures a channel before it is registered on the socket.
///
/// Created via [`RealtimeClient::channel`](crate::RealtimeClient::channel).
pub struct ChannelBuilder {
    pub(crate) socket: Arc<SocketInner>,
    pub(crate) name: String,
    pub(crate) config: JoinConfig,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) timeout: Duration,
}

impl ChannelBuilder {
    /// Listen for row changes matching `filter`.
    pub fn on_postgres_changes<F>(
        mut self,
        event: PostgresChangesEvent,
        filter: PostgresChangesFilter,
        callback: F,
    ) -> Self
    where
        F: Fn(PostgresChangePayload) + Send + Sync + 'static,
    {
        let filter_index = self.config.postgres_changes.len();
        self.config
            .postgres_changes
            .push(PostgresChangesFilter { event, ..filter });
        self.bindings.push(Binding::PostgresChanges {
            filter_index,
            event,
            callback: Arc::new(callback),
        });
        self
    }

    /// Listen for broadcasts with the given event name (`"*"` for all).
    pub fn on_broadcast<F>(mut self, event: &str, callback: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.bindings.push(Binding::Broadcast {
            event: event.to_string(),
            callback: Arc::new(callback),
        });
        self
    }

    pub fn on_presence_sync<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PresenceState) + Send + Sync + 'static,
    {
        self.bindings.push(Binding::PresenceSync(Arc::new(callback)));
        self
    }

    pub fn on_presence_join<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &[PresenceMeta]) + Send + Sync + 'static,
    {
        self.bindings.push(Binding::PresenceJoin(Arc::new(callback)));
        self
    }

    pub fn on_presence_leave<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &[PresenceMeta]) + Send + Sync + 'static,
    {
        self.bindings.push(Binding::PresenceLeave(Arc::new(callback)));
        self
    }

    /// Server `system` messages (extension status, errors).
    pub fn on_system<F>(mut self, callback: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.bindings.push(Binding::System(Arc::new(callback)));
        self
    }

    /// Ask the server to acknowledge broadcasts; `send` then waits for it.
    pub fn broadcast_ack(mut self, ack: bool) -> Self {
        self.config.broadcast.ack = ack;
        self
    }

    /// Receive our own broadcasts.
    pub fn broadcast_self(mut self, self_send: bool) -> Self {
        self.config.broadcast.self_send = self_send;
        self
    }

    pub fn presence_key(mut self, key: &str) -> Self {
        self.config.presence.key = key.to_string();
        self
    }

    /// Private channel, authorized by RLS policies on the server.
    pub fn private(mut self) -> Self {
        self.config.private = true;
        self
    }

    /// Override the socket's timeout for this channel's pushes.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register the channel on the socket without joining it.
    pub fn build(self) -> Result<RealtimeChannel, RealtimeError> {
        if self.bindings.iter().any(Binding::uses_presence) && self.config.presence.key.is_empty() {
            trace!(name = %self.name, "Presence bindings without a key; server assigns one");
        }

        let (status, _) = watch::channel(ChannelStatus::Unsubscribed);
        let inner = Arc::new(ChannelInner {
            topic: format!("realtime:{}", self.name),
            name: self.name,
            config: self.config,
            bindings: self.bindings,
            timeout: self.timeout,
            socket: Arc::downgrade(&self.socket),
            status,
            join_ref: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            presence: Mutex::new(PresenceState::new()),
            pg_change_ids: Mutex::new(HashMap::new()),
            rejoin: AtomicBool::new(false),
        });
        self.socket.register(&inner)?;
        Ok(RealtimeChannel { inner })
    }

    /// Build and join in one step.
    pub async fn subscribe(self) -> Result<RealtimeChannel, RealtimeError> {
        let channel = self.build()?;
        channel.subscribe().await?;
        Ok(channel)
    }
}

// ── RealtimeChannel ───────────────────────────────────────────────────────────

/// Handle to a channel registered on a [`RealtimeClient`](crate::RealtimeClient).
///
/// Cheaply cloneable. The socket only knows the channel weakly: once every
/// handle is dropped the channel leaves its topic and is forgotten.
#[derive(Clone)]
pub struct RealtimeChannel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    /// Full topic, e.g. `"realtime:room-1"`.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.status()
    }

    /// Watch status transitions.
    pub fn status_changes(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    /// Join the channel and wait for the server's acknowledgement.
    ///
    /// Opens the socket first unless it is connected or `connect_on_subscribe`
    /// is off, in which case this fails with [`RealtimeError::NotConnected`].
    /// A join that is not acknowledged within the timeout leaves the channel
    /// unsubscribed and returns [`RealtimeError::Timeout`].
    pub async fn subscribe(&self) -> Result<(), RealtimeError> {
        let socket = self.inner.socket().ok_or(RealtimeError::ConnectionClosed)?;

        let mut status = self.inner.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            match current {
                ChannelStatus::Subscribed => return Ok(()),
                ChannelStatus::Unsubscribed => {
                    if self
                        .inner
                        .transition(ChannelStatus::Unsubscribed, ChannelStatus::Subscribing)
                    {
                        break;
                    }
                }
                ChannelStatus::Subscribing | ChannelStatus::Unsubscribing => {
                    if status.changed().await.is_err() {
                        return Err(RealtimeError::ConnectionClosed);
                    }
                }
            }
        }

        if let Err(e) = self.prepare(&socket).await {
            self.inner.set_status(ChannelStatus::Unsubscribed);
            return Err(e);
        }

        self.inner.join(&socket).await
    }

    async fn prepare(&self, socket: &Arc<SocketInner>) -> Result<(), RealtimeError> {
        socket.register(&self.inner)?;
        if !socket.is_connected() {
            if !socket.config.connect_on_subscribe {
                return Err(RealtimeError::NotConnected);
            }
            socket.connect().await?;
        }
        Ok(())
    }

    /// Leave the channel and drop it from the socket. Calling this on an
    /// unsubscribed channel does nothing.
    pub async fn unsubscribe(&self) -> Result<(), RealtimeError> {
        let socket = self.inner.socket();
        self.inner.rejoin.store(false, Ordering::SeqCst);

        let mut status = self.inner.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            match current {
                ChannelStatus::Unsubscribed => {
                    if let Some(socket) = &socket {
                        socket.unregister(&self.inner);
                    }
                    return Ok(());
                }
                ChannelStatus::Unsubscribing => {
                    if status.changed().await.is_err() {
                        return Err(RealtimeError::ConnectionClosed);
                    }
                }
                ChannelStatus::Subscribed | ChannelStatus::Subscribing => {
                    if self.inner.transition(current, ChannelStatus::Unsubscribing) {
                        break;
                    }
                }
            }
        }

        debug!(topic = %self.inner.topic, "Leaving channel");
        let connected = socket.as_ref().is_some_and(|s| s.is_connected());
        let result = match (connected, self.inner.join_ref()) {
            (true, Some(join_ref)) => {
                let leave = protocol::leave(&self.inner.topic, &join_ref);
                match self.inner.push(leave, true).send().await {
                    PushStatus::Ok => Ok(()),
                    PushStatus::Timeout => Err(RealtimeError::Timeout(self.inner.timeout)),
                    PushStatus::Error => Err(RealtimeError::ServerError(
                        "leave was rejected".to_string(),
                    )),
                }
            }
            _ => Ok(()),
        };

        self.inner.set_status(ChannelStatus::Unsubscribed);
        if let Some(socket) = &socket {
            socket.unregister(&self.inner);
        }
        result
    }

    /// Broadcast `payload` under `event`.
    ///
    /// With `broadcast_ack` enabled this waits for the server and can resolve
    /// to [`PushStatus::Timeout`]; otherwise it returns `Ok` once queued.
    pub async fn send(&self, event: &str, payload: Value) -> Result<PushStatus, RealtimeError> {
        let join_ref = self.inner.require_subscribed()?;
        let message = protocol::broadcast(&self.inner.topic, event, payload, &join_ref);
        Ok(self
            .inner
            .push(message, self.inner.config.broadcast.ack)
            .send()
            .await)
    }

    /// Track this client's presence with the given state.
    pub async fn track(&self, payload: Value) -> Result<PushStatus, RealtimeError> {
        let join_ref = self.inner.require_subscribed()?;
        let message = protocol::presence_track(&self.inner.topic, payload, &join_ref);
        Ok(self.inner.push(message, true).send().await)
    }

    pub async fn untrack(&self) -> Result<PushStatus, RealtimeError> {
        let join_ref = self.inner.require_subscribed()?;
        let message = protocol::presence_untrack(&self.inner.topic, &join_ref);
        Ok(self.inner.push(message, true).send().await)
    }

    /// Current presence state as last synced from the server.
    pub fn presence_state(&self) -> PresenceState {
        self.inner.presence().clone()
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> Weak<ChannelInner> {
        Arc::downgrade(&self.inner)
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("topic", &self.inner.topic)
            .field("status", &self.inner.status())
            .finish()
    }
}

// ── ChannelInner ──────────────────────────────────────────────────────────────

pub(crate) struct ChannelInner {
    pub(crate) topic: String,
    name: String,
    config: JoinConfig,
    bindings: Vec<Binding>,
    timeout: Duration,
    socket: Weak<SocketInner>,
    status: watch::Sender<ChannelStatus>,
    join_ref: Mutex<Option<String>>,
    /// Pushes awaiting a `phx_reply`, by ref.
    pending: Mutex<HashMap<String, Arc<Push>>>,
    presence: Mutex<PresenceState>,
    /// Server-assigned postgres_changes id → filter index.
    pg_change_ids: Mutex<HashMap<u64, usize>>,
    /// Set when the connection drops while subscribed.
    rejoin: AtomicBool,
}

impl ChannelInner {
    pub(crate) fn socket(&self) -> Option<Arc<SocketInner>> {
        self.socket.upgrade()
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub(crate) fn set_status(&self, status: ChannelStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(topic = %self.topic, from = %previous, to = %status, "Channel status changed");
        }
    }

    /// Move from `from` to `to` if the status is still `from`.
    fn transition(&self, from: ChannelStatus, to: ChannelStatus) -> bool {
        let moved = self.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(topic = %self.topic, from = %from, to = %to, "Channel status changed");
        }
        moved
    }

    pub(crate) fn join_ref(&self) -> Option<String> {
        lock(&self.join_ref).clone()
    }

    fn require_subscribed(&self) -> Result<String, RealtimeError> {
        let status = self.status();
        match (status, self.join_ref()) {
            (ChannelStatus::Subscribed, Some(join_ref)) => Ok(join_ref),
            _ => Err(RealtimeError::InvalidChannelState {
                expected: ChannelStatus::Subscribed,
                actual: status,
            }),
        }
    }

    fn push(self: &Arc<Self>, message: RealtimeMessage, ack_required: bool) -> Arc<Push> {
        Push::new(Arc::downgrade(self), message, ack_required, self.timeout)
    }

    pub(crate) fn register_push(&self, msg_ref: String, push: Arc<Push>) {
        lock(&self.pending).insert(msg_ref, push);
    }

    pub(crate) fn forget_push(&self, msg_ref: &str) {
        lock(&self.pending).remove(msg_ref);
    }

    fn presence(&self) -> MutexGuard<'_, PresenceState> {
        lock(&self.presence)
    }

    pub(crate) fn mark_for_rejoin(&self) {
        if self.transition(ChannelStatus::Subscribed, ChannelStatus::Subscribing) {
            self.rejoin.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn take_rejoin(&self) -> bool {
        self.rejoin.swap(false, Ordering::SeqCst)
    }

    /// Back to unsubscribed after an explicit disconnect.
    pub(crate) fn reset(&self) {
        self.rejoin.store(false, Ordering::SeqCst);
        self.set_status(ChannelStatus::Unsubscribed);
    }

    /// Send `phx_join` and wait for the reply. Used for the first join and
    /// for rejoins after a reconnect.
    pub(crate) async fn join(self: &Arc<Self>, socket: &SocketInner) -> Result<(), RealtimeError> {
        let join_ref = socket.make_ref();
        *lock(&self.join_ref) = Some(join_ref.clone());
        let payload = JoinPayload {
            config: self.config.clone(),
            access_token: Some(socket.access_token()),
        };
        let message = match protocol::join(&self.topic, &payload, &join_ref) {
            Ok(message) => message,
            Err(e) => {
                self.set_status(ChannelStatus::Unsubscribed);
                return Err(e.into());
            }
        };

        self.set_status(ChannelStatus::Subscribing);
        debug!(topic = %self.topic, join_ref = %join_ref, "Joining channel");
        let reply = self.push(message, true).send_for_reply().await;

        match reply.status {
            PushStatus::Ok => {
                self.record_postgres_ids(&reply.response);
                if self.transition(ChannelStatus::Subscribing, ChannelStatus::Subscribed) {
                    Ok(())
                } else {
                    debug!(topic = %self.topic, "Join acknowledged after the channel moved on");
                    Err(RealtimeError::ConnectionClosed)
                }
            }
            PushStatus::Error => {
                self.set_status(ChannelStatus::Unsubscribed);
                let reason = reply
                    .response
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("join was rejected")
                    .to_string();
                warn!(topic = %self.topic, reason = %reason, "Join failed");
                Err(RealtimeError::ServerError(reason))
            }
            PushStatus::Timeout => {
                self.set_status(ChannelStatus::Unsubscribed);
                warn!(topic = %self.topic, timeout = ?self.timeout, "Join timed out");
                // The server may still join us late.
                if socket.is_connected() {
                    socket.push(protocol::leave(&self.topic, &join_ref));
                }
                Err(RealtimeError::Timeout(self.timeout))
            }
        }
    }

    fn record_postgres_ids(&self, response: &Value) {
        let Some(entries) = response.get("postgres_changes").and_then(Value::as_array) else {
            return;
        };
        let mut ids = lock(&self.pg_change_ids);
        ids.clear();
        for (index, entry) in entries.iter().enumerate() {
            if let Some(id) = entry.get("id").and_then(Value::as_u64) {
                ids.insert(id, index);
            }
        }
    }

    // ── Dispatch ──

    pub(crate) fn handle(&self, msg: RealtimeMessage) {
        let lifecycle = matches!(msg.event.as_str(), event::CLOSE | event::ERROR);
        if lifecycle && msg.join_ref.is_some() && msg.join_ref != self.join_ref() {
            trace!(topic = %self.topic, event = %msg.event, "Ignoring event for a previous join");
            return;
        }

        match msg.event.as_str() {
            event::REPLY => self.handle_reply(msg),
            event::CLOSE => {
                debug!(topic = %self.topic, "Channel closed by server");
                self.rejoin.store(false, Ordering::SeqCst);
                self.set_status(ChannelStatus::Unsubscribed);
            }
            event::ERROR => {
                warn!(topic = %self.topic, payload = %msg.payload, "Channel error from server");
                self.rejoin.store(false, Ordering::SeqCst);
                self.set_status(ChannelStatus::Unsubscribed);
            }
            event::BROADCAST => self.handle_broadcast(msg.payload),
            event::PRESENCE_STATE => {
                let changes = presence::sync_state(&mut self.presence(), msg.payload);
                self.dispatch_presence(changes);
            }
            event::PRESENCE_DIFF => match serde_json::from_value::<PresenceDiff>(msg.payload) {
                Ok(diff) => {
                    let changes = presence::apply_diff(&mut self.presence(), diff);
                    self.dispatch_presence(changes);
                }
                Err(e) => warn!(topic = %self.topic, error = %e, "Failed to parse presence diff"),
            },
            event::POSTGRES_CHANGES => self.handle_postgres_changes(msg.payload),
            event::SYSTEM => {
                debug!(topic = %self.topic, payload = %msg.payload, "System message");
                for binding in &self.bindings {
                    if let Binding::System(callback) = binding {
                        callback(msg.payload.clone());
                    }
                }
            }
            other => trace!(topic = %self.topic, event = %other, "Unhandled event"),
        }
    }

    fn handle_reply(&self, msg: RealtimeMessage) {
        let Some(msg_ref) = msg.msg_ref.as_deref() else {
            trace!(topic = %self.topic, "Reply without ref");
            return;
        };
        let push = lock(&self.pending).remove(msg_ref);
        match push {
            Some(push) => {
                let (status, response) = protocol::reply_parts(&msg.payload);
                push.resolve(PushReply::new(PushStatus::from_reply(status), response));
            }
            None => trace!(topic = %self.topic, msg_ref = %msg_ref, "Reply for unknown push"),
        }
    }

    fn handle_broadcast(&self, payload: Value) {
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let data = payload.get("payload").cloned().unwrap_or(Value::Null);
        for binding in &self.bindings {
            if let Binding::Broadcast {
                event: bound,
                callback,
            } = binding
            {
                if bound == "*" || bound == event {
                    callback(data.clone());
                }
            }
        }
    }

    fn handle_postgres_changes(&self, payload: Value) {
        let matched: Vec<usize> = {
            let ids = lock(&self.pg_change_ids);
            payload
                .get("ids")
                .and_then(Value::as_array)
                .map(|raw| {
                    raw.iter()
                        .filter_map(Value::as_u64)
                        .filter_map(|id| ids.get(&id).copied())
                        .collect()
                })
                .unwrap_or_default()
        };

        let data = payload.get("data").cloned().unwrap_or(payload);
        let change: PostgresChangePayload = match serde_json::from_value(data) {
            Ok(change) => change,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "Failed to parse postgres change");
                return;
            }
        };

        for binding in &self.bindings {
            if let Binding::PostgresChanges {
                filter_index,
                event,
                callback,
            } = binding
            {
                if callback::postgres_binding_matches(
                    *filter_index,
                    *event,
                    &matched,
                    &change.change_type,
                ) {
                    callback(change.clone());
                }
            }
        }
    }

    fn dispatch_presence(&self, changes: PresenceChanges) {
        let state = self.presence().clone();
        for binding in &self.bindings {
            match binding {
                Binding::PresenceJoin(callback) => {
                    for (key, metas) in &changes.joins {
                        callback(key, metas);
                    }
                }
                Binding::PresenceLeave(callback) => {
                    for (key, metas) in &changes.leaves {
                        callback(key, metas);
                    }
                }
                Binding::PresenceSync(callback) => callback(&state),
                _ => {}
            }
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let joined = matches!(
            self.status(),
            ChannelStatus::Subscribed | ChannelStatus::Subscribing
        );
        let join_ref = self.join_ref.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let (true, Some(join_ref), Some(socket)) = (joined, join_ref, self.socket.upgrade()) {
            if socket.is_connected() {
                debug!(topic = %self.topic, "Channel dropped, leaving topic");
                socket.push(protocol::leave(&self.topic, &join_ref));
            }
        }

        let pending = self.pending.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, push) in pending.drain() {
            push.resolve(PushReply::new(PushStatus::Error, Value::Null));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Detached rejoin after a reconnect.
pub(crate) fn spawn_rejoin(channel: Arc<ChannelInner>, socket: Arc<SocketInner>) {
    platform::spawn(async move {
        if let Err(e) = channel.join(&socket).await {
            warn!(topic = %channel.topic, error = %e, "Rejoin failed");
        }
    });
}
