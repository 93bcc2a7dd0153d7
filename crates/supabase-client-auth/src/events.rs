//! Fan-out of auth state changes with replay for late listeners.
//!
//! Every listener owns an unbounded queue. The emitter keeps the latest
//! committed change; attaching a listener and reading that snapshot happen
//! under the same lock that `emit` holds while fanning out, so a listener
//! sees exactly one replay followed by every later event, in commit order.
//!
//! While the client is initializing, state is not yet known: changes
//! committed before `initialSession` (a refresh of the stored session) are
//! folded into it rather than replayed on their own.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use supabase_client_core::platform::{self, SpawnHandle};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::types::{AuthChangeEvent, AuthStateChange, Session};

/// Callback invoked for each auth state change.
pub type AuthStateCallback =
    Arc<dyn Fn(AuthChangeEvent, Option<&Session>) + Send + Sync + 'static>;

/// Hub that delivers [`AuthStateChange`]s to registered listeners.
#[derive(Clone)]
pub struct AuthEventEmitter {
    inner: Arc<EmitterInner>,
}

struct EmitterInner {
    state: Mutex<EmitterState>,
    /// `true` while the current state is known and may be replayed.
    /// Only written with `state` locked.
    ready: watch::Sender<bool>,
}

#[derive(Default)]
struct EmitterState {
    latest: Option<AuthStateChange>,
    listeners: BTreeMap<u64, Listener>,
    next_id: u64,
    /// Set between the start of initialization and `initialSession`.
    initializing: bool,
    closed: bool,
}

impl EmitterState {
    fn known(&self) -> Option<&AuthStateChange> {
        match self.initializing {
            true => None,
            false => self.latest.as_ref(),
        }
    }
}

struct Listener {
    tx: mpsc::UnboundedSender<AuthStateChange>,
    /// False until the replay has been queued.
    live: bool,
    tasks: Vec<SpawnHandle>,
}

impl Listener {
    fn cancel(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Default for AuthEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthEventEmitter {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(EmitterInner {
                state: Mutex::new(EmitterState::default()),
                ready,
            }),
        }
    }

    /// Deliver `event` to every live listener, in registration order.
    ///
    /// During initialization only `initialSession` makes the state known;
    /// earlier changes reach listeners that are already live and are
    /// otherwise superseded by it.
    pub fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        let change = AuthStateChange { event, session };
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        trace!(%event, listeners = state.listeners.len(), "Emitting auth event");
        if event == AuthChangeEvent::InitialSession {
            state.initializing = false;
        }
        state.latest = Some(change.clone());
        state.listeners.retain(|_, listener| {
            !listener.live || listener.tx.send(change.clone()).is_ok()
        });
        if !state.initializing {
            self.inner.ready.send_replace(true);
        }
    }

    /// Mark the state unknown until the next `initialSession`. Listeners
    /// attaching in between get that event as their replay.
    pub(crate) fn begin_initialization(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.initializing = true;
        self.inner.ready.send_replace(false);
    }

    /// Register a callback. It first receives a replay of the current state.
    pub fn on_auth_state_change<F>(&self, callback: F) -> AuthSubscription
    where
        F: Fn(AuthChangeEvent, Option<&Session>) + Send + Sync + 'static,
    {
        let callback: AuthStateCallback = Arc::new(callback);
        let (id, mut rx) = self.attach();
        let forwarder = platform::spawn(async move {
            while let Some(change) = rx.recv().await {
                callback(change.event, change.session.as_ref());
            }
        });
        self.inner.add_task(id, forwarder);
        AuthSubscription {
            id,
            emitter: Arc::downgrade(&self.inner),
        }
    }

    /// Register a listener as a stream. Dropping the stream unsubscribes.
    pub fn auth_state_changes(&self) -> AuthStateChanges {
        let (id, rx) = self.attach();
        AuthStateChanges {
            id,
            rx,
            emitter: Arc::downgrade(&self.inner),
        }
    }

    /// Remove every listener and cancel their pending replay and delivery
    /// tasks. Later emits and registrations are ignored.
    pub fn shutdown(&self) {
        let listeners = {
            let mut state = self.inner.lock();
            state.closed = true;
            std::mem::take(&mut state.listeners)
        };
        debug!(count = listeners.len(), "Tearing down auth listeners");
        for listener in listeners.into_values() {
            listener.cancel();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// The most recent committed change, if any.
    pub fn latest(&self) -> Option<AuthStateChange> {
        self.inner.lock().latest.clone()
    }

    fn attach(&self) -> (u64, mpsc::UnboundedReceiver<AuthStateChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        if state.closed {
            return (id, rx);
        }

        let live = match state.known() {
            Some(latest) => {
                let _ = tx.send(replay_of(latest));
                true
            }
            None => false,
        };
        let mut listener = Listener {
            tx,
            live,
            tasks: Vec::new(),
        };
        if !live {
            let weak = Arc::downgrade(&self.inner);
            listener.tasks.push(platform::spawn(deliver_replay(weak, id)));
        }
        state.listeners.insert(id, listener);
        (id, rx)
    }
}

impl EmitterInner {
    fn lock(&self) -> MutexGuard<'_, EmitterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_task(&self, id: u64, task: SpawnHandle) {
        let mut state = self.lock();
        match state.listeners.get_mut(&id) {
            Some(listener) => listener.tasks.push(task),
            None => task.abort(),
        }
    }

    fn remove(&self, id: u64) {
        let removed = self.lock().listeners.remove(&id);
        if let Some(listener) = removed {
            trace!(id, "Auth listener removed");
            listener.cancel();
        }
    }
}

/// Replay shown to a listener that attaches after state is known.
fn replay_of(latest: &AuthStateChange) -> AuthStateChange {
    let event = match (latest.event, &latest.session) {
        (AuthChangeEvent::InitialSession, _) => AuthChangeEvent::InitialSession,
        (_, Some(_)) => AuthChangeEvent::SignedIn,
        (_, None) => AuthChangeEvent::SignedOut,
    };
    AuthStateChange {
        event,
        session: latest.session.clone(),
    }
}

async fn deliver_replay(inner: Weak<EmitterInner>, id: u64) {
    let mut ready = match inner.upgrade() {
        Some(inner) => inner.ready.subscribe(),
        None => return,
    };
    loop {
        if ready.wait_for(|ready| *ready).await.is_err() {
            return;
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.lock();
        // Initialization may have restarted since the flag was observed.
        let Some(replay) = state.known().map(replay_of) else {
            continue;
        };
        if let Some(listener) = state.listeners.get_mut(&id) {
            if !listener.live {
                let _ = listener.tx.send(replay);
                listener.live = true;
            }
        }
        return;
    }
}

// ── Handles ───────────────────────────────────────────────────

/// Handle returned by [`AuthEventEmitter::on_auth_state_change`].
///
/// The callback stays registered until [`AuthSubscription::unsubscribe`]
/// is called or the emitter is torn down.
#[derive(Debug)]
pub struct AuthSubscription {
    id: u64,
    emitter: Weak<EmitterInner>,
}

impl AuthSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivery. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.emitter.upgrade() {
            inner.remove(self.id);
        }
    }
}

/// Stream of auth state changes; the first item is the replay.
pub struct AuthStateChanges {
    id: u64,
    rx: mpsc::UnboundedReceiver<AuthStateChange>,
    emitter: Weak<EmitterInner>,
}

impl Stream for AuthStateChanges {
    type Item = AuthStateChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AuthStateChanges {
    fn drop(&mut self) {
        if let Some(inner) = self.emitter.upgrade() {
            inner.remove(self.id);
        }
    }
}

impl std::fmt::Debug for EmitterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmitterInner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::session_expiring_in;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn next(stream: &mut AuthStateChanges) -> AuthStateChange {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for auth event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn late_listener_gets_signed_in_replay() {
        let emitter = AuthEventEmitter::new();
        let session = session_expiring_in("tok", 3600);
        emitter.emit(AuthChangeEvent::InitialSession, None);
        emitter.emit(AuthChangeEvent::SignedIn, Some(session.clone()));

        let mut changes = emitter.auth_state_changes();
        let replay = next(&mut changes).await;
        assert_eq!(replay.event, AuthChangeEvent::SignedIn);
        assert_eq!(replay.session, Some(session));
    }

    #[tokio::test]
    async fn replay_reports_signed_in_after_refresh_and_signed_out_after_logout() {
        let emitter = AuthEventEmitter::new();
        emitter.emit(AuthChangeEvent::TokenRefreshed, Some(session_expiring_in("t", 60)));
        let mut changes = emitter.auth_state_changes();
        assert_eq!(next(&mut changes).await.event, AuthChangeEvent::SignedIn);

        emitter.emit(AuthChangeEvent::SignedOut, None);
        let mut later = emitter.auth_state_changes();
        let replay = next(&mut later).await;
        assert_eq!(replay.event, AuthChangeEvent::SignedOut);
        assert!(replay.session.is_none());
    }

    #[tokio::test]
    async fn listener_before_initialization_waits_for_first_state() {
        let emitter = AuthEventEmitter::new();
        let mut changes = emitter.auth_state_changes();

        let pending = tokio::time::timeout(Duration::from_millis(50), changes.next()).await;
        assert!(pending.is_err(), "nothing should be delivered before state is known");

        emitter.emit(AuthChangeEvent::InitialSession, None);
        let replay = next(&mut changes).await;
        assert_eq!(replay.event, AuthChangeEvent::InitialSession);

        emitter.emit(AuthChangeEvent::SignedIn, Some(session_expiring_in("t", 60)));
        assert_eq!(next(&mut changes).await.event, AuthChangeEvent::SignedIn);
    }

    #[tokio::test]
    async fn refresh_during_initialization_is_folded_into_initial_session() {
        let emitter = AuthEventEmitter::new();
        let mut early = emitter.auth_state_changes();

        emitter.begin_initialization();
        let refreshed = session_expiring_in("s2", 3600);
        emitter.emit(AuthChangeEvent::TokenRefreshed, Some(refreshed.clone()));

        let mut during = emitter.auth_state_changes();
        let pending = tokio::time::timeout(Duration::from_millis(50), during.next()).await;
        assert!(pending.is_err(), "state is not known until initialSession");

        emitter.emit(AuthChangeEvent::InitialSession, Some(refreshed.clone()));
        for stream in [&mut early, &mut during] {
            let first = next(stream).await;
            assert_eq!(first.event, AuthChangeEvent::InitialSession);
            assert_eq!(first.session, Some(refreshed.clone()));
            let extra = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
            assert!(extra.is_err());
        }
    }

    #[tokio::test]
    async fn live_events_follow_replay_in_order_without_duplicates() {
        let emitter = AuthEventEmitter::new();
        emitter.emit(AuthChangeEvent::InitialSession, None);

        let mut first = emitter.auth_state_changes();
        let mut second = emitter.auth_state_changes();

        let session = session_expiring_in("t", 60);
        emitter.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        emitter.emit(AuthChangeEvent::TokenRefreshed, Some(session.clone()));
        emitter.emit(AuthChangeEvent::SignedOut, None);

        for stream in [&mut first, &mut second] {
            let events: Vec<_> = [
                next(stream).await,
                next(stream).await,
                next(stream).await,
                next(stream).await,
            ]
            .into_iter()
            .map(|c| c.event)
            .collect();
            assert_eq!(
                events,
                vec![
                    AuthChangeEvent::InitialSession,
                    AuthChangeEvent::SignedIn,
                    AuthChangeEvent::TokenRefreshed,
                    AuthChangeEvent::SignedOut,
                ]
            );
            let extra = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
            assert!(extra.is_err());
        }
    }

    #[tokio::test]
    async fn callback_listener_receives_events() {
        let emitter = AuthEventEmitter::new();
        emitter.emit(AuthChangeEvent::InitialSession, None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = emitter.on_auth_state_change(move |event, session| {
            let _ = tx.send((event, session.map(|s| s.access_token.clone())));
        });
        emitter.emit(AuthChangeEvent::SignedIn, Some(session_expiring_in("abc", 60)));

        assert_eq!(rx.recv().await, Some((AuthChangeEvent::InitialSession, None)));
        assert_eq!(
            rx.recv().await,
            Some((AuthChangeEvent::SignedIn, Some("abc".to_string())))
        );

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert_eq!(emitter.listener_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_cancels_pending_replay() {
        let emitter = AuthEventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let subscription = emitter.on_auth_state_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subscription.unsubscribe();

        emitter.emit(AuthChangeEvent::InitialSession, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[tokio::test]
    async fn dropping_stream_detaches_listener() {
        let emitter = AuthEventEmitter::new();
        let changes = emitter.auth_state_changes();
        assert_eq!(emitter.listener_count(), 1);
        drop(changes);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_streams_and_ignores_new_events() {
        let emitter = AuthEventEmitter::new();
        emitter.emit(AuthChangeEvent::InitialSession, None);
        let mut changes = emitter.auth_state_changes();
        assert_eq!(next(&mut changes).await.event, AuthChangeEvent::InitialSession);

        emitter.shutdown();
        emitter.emit(AuthChangeEvent::SignedIn, Some(session_expiring_in("t", 60)));
        assert!(changes.next().await.is_none());

        let mut after = emitter.auth_state_changes();
        assert!(after.next().await.is_none());
    }
}
