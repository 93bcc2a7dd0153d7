use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use supabase_client_core::platform;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::channel::ChannelInner;
use crate::types::{PushStatus, RealtimeMessage};

/// Server answer to a push.
#[derive(Debug, Clone)]
pub(crate) struct PushReply {
    pub status: PushStatus,
    pub response: Value,
}

impl PushReply {
    pub(crate) fn new(status: PushStatus, response: Value) -> Self {
        Self { status, response }
    }

    fn status(status: PushStatus) -> Self {
        Self::new(status, Value::Null)
    }
}

/// One outbound message on a channel, optionally awaiting the server's
/// `phx_reply`.
///
/// Holds the channel weakly: a push that outlives its channel resolves to
/// [`PushStatus::Error`].
pub struct Push {
    channel: Weak<ChannelInner>,
    message: RealtimeMessage,
    ack_required: bool,
    timeout: Duration,
    slot: Mutex<Option<oneshot::Sender<PushReply>>>,
}

impl Push {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        message: RealtimeMessage,
        ack_required: bool,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            message,
            ack_required,
            timeout,
            slot: Mutex::new(None),
        })
    }

    pub fn message(&self) -> &RealtimeMessage {
        &self.message
    }

    /// Send the message. Without an ack requirement this resolves to `Ok` as
    /// soon as the message is queued; otherwise it waits for the reply and
    /// resolves to `Timeout` once the timeout elapses.
    pub async fn send(self: Arc<Self>) -> PushStatus {
        self.send_for_reply().await.status
    }

    /// Resolve a pending send. Only the first call has an effect.
    pub fn did_receive(&self, status: PushStatus) {
        self.resolve(PushReply::status(status));
    }

    pub(crate) fn resolve(&self, reply: PushReply) {
        if let Some(tx) = self.slot().take() {
            let _ = tx.send(reply);
        }
    }

    pub(crate) async fn send_for_reply(self: Arc<Self>) -> PushReply {
        let Some(channel) = self.channel.upgrade() else {
            debug!(event = %self.message.event, "Push dropped: channel is gone");
            return PushReply::status(PushStatus::Error);
        };
        let Some(socket) = channel.socket() else {
            debug!(topic = %channel.topic, "Push dropped: socket is gone");
            return PushReply::status(PushStatus::Error);
        };

        let mut message = self.message.clone();
        let msg_ref = message
            .msg_ref
            .get_or_insert_with(|| socket.make_ref())
            .clone();

        if !self.ack_required {
            socket.push(message);
            return PushReply::status(PushStatus::Ok);
        }

        let (tx, rx) = oneshot::channel();
        *self.slot() = Some(tx);
        channel.register_push(msg_ref.clone(), Arc::clone(&self));
        socket.push(message);
        drop(socket);
        drop(channel);

        let reply = match platform::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => PushReply::status(PushStatus::Error),
            Err(_) => {
                trace!(msg_ref = %msg_ref, "Push timed out");
                PushReply::status(PushStatus::Timeout)
            }
        };

        self.slot().take();
        if let Some(channel) = self.channel.upgrade() {
            channel.forget_push(&msg_ref);
        }
        reply
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<PushReply>>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}
