//! In-memory session cache with coalesced token refresh.
//!
//! All mutations of the current session go through one async mutex. A
//! refresh runs as a detached task whose outcome is shared by every caller
//! that asked for a session while it was in flight, so a refresh token is
//! never spent twice concurrently and a caller giving up does not cancel
//! the exchange for the others.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use supabase_client_core::platform::{self, SpawnHandle};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::events::AuthEventEmitter;
use crate::storage::{SessionStorage, StoredSession};
use crate::types::{AuthChangeEvent, Session, User};

/// Refresh is triggered this long before the access token actually expires.
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Performs the network exchange of a refresh token for a new session.
#[async_trait]
pub trait SessionRefresher: Send + Sync {
    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Session, AuthError>>>;

/// Owner of the current session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    state: Mutex<ManagerState>,
    storage: SessionStorage,
    emitter: AuthEventEmitter,
    refresher: RwLock<Option<Arc<dyn SessionRefresher>>>,
    expiry_margin: Duration,
    /// Task of the in-flight refresh, by id. Kept outside `state` so it can
    /// be aborted from synchronous teardown.
    refresh_task: std::sync::Mutex<Option<(u64, SpawnHandle)>>,
}

#[derive(Default)]
struct ManagerState {
    current: Option<Session>,
    loaded: bool,
    /// Bumped by every commit so a slower refresh cannot overwrite it.
    generation: u64,
    next_refresh_id: u64,
    in_flight: Option<InFlight>,
}

struct InFlight {
    id: u64,
    future: RefreshFuture,
}

impl SessionManager {
    pub fn new(storage: SessionStorage, emitter: AuthEventEmitter, expiry_margin: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(ManagerState::default()),
                storage,
                emitter,
                refresher: RwLock::new(None),
                expiry_margin,
                refresh_task: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Install the component that performs refresh network calls.
    pub fn set_session_refresher(&self, refresher: Arc<dyn SessionRefresher>) {
        let mut slot = self
            .inner
            .refresher
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(refresher);
    }

    pub fn expiry_margin(&self) -> Duration {
        self.inner.expiry_margin
    }

    /// A session that is valid for at least the expiry margin.
    ///
    /// Refreshes when the cached session is (nearly) expired. Concurrent
    /// callers share one refresh and observe the same outcome.
    pub async fn session(&self) -> Result<Session, AuthError> {
        let refresh = {
            let mut state = self.inner.state.lock().await;
            self.inner.load(&mut state)?;
            let current = state.current.as_ref().ok_or(AuthError::SessionMissing)?;
            if !current.expires_within(self.inner.expiry_margin) {
                return Ok(current.clone());
            }
            self.inner.refresh_future(&mut state, None)?
        };
        refresh.await
    }

    /// The cached (or persisted) session without any validity check.
    pub async fn current(&self) -> Result<Option<Session>, AuthError> {
        let mut state = self.inner.state.lock().await;
        self.inner.load(&mut state)?;
        Ok(state.current.clone())
    }

    /// Refresh now, joining a refresh that is already in flight.
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        let refresh = {
            let mut state = self.inner.state.lock().await;
            self.inner.load(&mut state)?;
            self.inner.refresh_future(&mut state, None)?
        };
        refresh.await
    }

    /// Refresh using an explicit refresh token, through the same single slot.
    pub async fn refresh_with(&self, refresh_token: impl Into<String>) -> Result<Session, AuthError> {
        let refresh = {
            let mut state = self.inner.state.lock().await;
            self.inner.load(&mut state)?;
            self.inner
                .refresh_future(&mut state, Some(refresh_token.into()))?
        };
        refresh.await
    }

    /// Replace the session in memory and in storage.
    ///
    /// A refresh already in flight will not overwrite this session.
    pub async fn update(&self, session: Session) -> Result<(), AuthError> {
        self.commit(session, None).await
    }

    pub(crate) async fn update_with_event(
        &self,
        session: Session,
        event: AuthChangeEvent,
    ) -> Result<(), AuthError> {
        self.commit(session, Some(event)).await
    }

    /// Forget the session in memory and in storage. Idempotent.
    pub async fn remove(&self) -> Result<(), AuthError> {
        self.clear(None).await
    }

    pub(crate) async fn remove_with_event(&self, event: AuthChangeEvent) -> Result<(), AuthError> {
        self.clear(Some(event)).await
    }

    /// Swap the user on the current session and emit `userUpdated`.
    pub(crate) async fn replace_user(&self, user: User) -> Result<Option<Session>, AuthError> {
        let mut state = self.inner.state.lock().await;
        self.inner.load(&mut state)?;
        let Some(current) = state.current.as_mut() else {
            return Ok(None);
        };
        current.user = user;
        let session = current.clone();

        let persisted = self.inner.storage.set(&StoredSession::new(session.clone()));
        self.inner
            .emitter
            .emit(AuthChangeEvent::UserUpdated, Some(session.clone()));
        persisted?;
        Ok(Some(session))
    }

    /// Emit an event in commit order with the other session mutations.
    pub(crate) async fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        let _state = self.inner.state.lock().await;
        self.inner.emitter.emit(event, session);
    }

    /// Abort the in-flight refresh. Its waiters receive [`AuthError::Cancelled`].
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.in_flight = None;
        self.inner.cancel_refresh();
    }

    /// Synchronous form of [`shutdown`](Self::shutdown) for teardown paths
    /// that cannot await. A later call starts a fresh refresh.
    pub fn cancel_refresh(&self) {
        self.inner.cancel_refresh();
    }

    #[cfg(test)]
    pub(crate) fn refresh_in_flight(&self) -> bool {
        self.inner.task_slot().is_some()
    }

    async fn commit(&self, session: Session, event: Option<AuthChangeEvent>) -> Result<(), AuthError> {
        let session = session.with_expiry_filled();
        let mut state = self.inner.state.lock().await;
        state.loaded = true;
        state.generation += 1;
        state.in_flight = None;
        state.current = Some(session.clone());

        let persisted = self.inner.storage.set(&StoredSession::new(session.clone()));
        if let Err(e) = &persisted {
            warn!(error = %e, "Failed to persist session");
        }
        if let Some(event) = event {
            self.inner.emitter.emit(event, Some(session));
        }
        persisted.map_err(AuthError::from)
    }

    async fn clear(&self, event: Option<AuthChangeEvent>) -> Result<(), AuthError> {
        let mut state = self.inner.state.lock().await;
        state.loaded = true;
        state.generation += 1;
        state.in_flight = None;
        state.current = None;

        let cleared = self.inner.storage.clear();
        if let Err(e) = &cleared {
            warn!(error = %e, "Failed to remove persisted session");
        }
        if let Some(event) = event {
            self.inner.emitter.emit(event, None);
        }
        cleared.map_err(AuthError::from)
    }
}

impl ManagerInner {
    fn task_slot(&self) -> std::sync::MutexGuard<'_, Option<(u64, SpawnHandle)>> {
        self.refresh_task.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_refresh(&self) {
        let task = self.task_slot().take();
        if let Some((id, task)) = task {
            debug!(id, "Cancelling in-flight session refresh");
            task.abort();
        }
    }

    fn load(&self, state: &mut ManagerState) -> Result<(), AuthError> {
        if state.loaded {
            return Ok(());
        }
        let stored = self.storage.get()?;
        debug!(found = stored.is_some(), "Loaded persisted session");
        state.current = stored.map(|stored| stored.session);
        state.loaded = true;
        Ok(())
    }

    fn refresher(&self) -> Option<Arc<dyn SessionRefresher>> {
        self.refresher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The shared refresh future, starting one if none is in flight.
    /// Must be called with the state lock held.
    fn refresh_future(
        self: &Arc<Self>,
        state: &mut ManagerState,
        refresh_token: Option<String>,
    ) -> Result<RefreshFuture, AuthError> {
        if let Some(in_flight) = &state.in_flight {
            let running = self.task_slot().as_ref().map(|(id, _)| *id) == Some(in_flight.id);
            if running {
                debug!(id = in_flight.id, "Joining in-flight session refresh");
                return Ok(in_flight.future.clone());
            }
            // Aborted by `cancel_refresh`; its waiters already saw `Cancelled`.
            state.in_flight = None;
        }

        let refresh_token = match refresh_token {
            Some(token) => token,
            None => state
                .current
                .as_ref()
                .map(|s| s.refresh_token.clone())
                .ok_or(AuthError::SessionMissing)?,
        };
        let refresher = self.refresher().ok_or_else(|| {
            AuthError::InvalidConfig("no session refresher installed".to_string())
        })?;

        state.next_refresh_id += 1;
        let id = state.next_refresh_id;
        let generation = state.generation;
        debug!(id, "Starting session refresh");

        let (tx, rx) = oneshot::channel();
        let task = platform::spawn(run_refresh(
            Arc::clone(self),
            refresher,
            refresh_token,
            generation,
            id,
            tx,
        ));
        let future = async move { rx.await.unwrap_or(Err(AuthError::Cancelled)) }
            .boxed()
            .shared();
        *self.task_slot() = Some((id, task));
        state.in_flight = Some(InFlight {
            id,
            future: future.clone(),
        });
        Ok(future)
    }
}

async fn run_refresh(
    inner: Arc<ManagerInner>,
    refresher: Arc<dyn SessionRefresher>,
    refresh_token: String,
    generation: u64,
    id: u64,
    tx: oneshot::Sender<Result<Session, AuthError>>,
) {
    let outcome = refresher.refresh_session(&refresh_token).await;

    let mut state = inner.state.lock().await;
    if state.in_flight.as_ref().map(|f| f.id) == Some(id) {
        state.in_flight = None;
    }
    {
        let mut slot = inner.task_slot();
        if slot.as_ref().map(|(running, _)| *running) == Some(id) {
            slot.take();
        }
    }

    let result = if state.generation != generation {
        // A newer commit won; hand waiters whatever is current now.
        debug!(id, "Discarding stale refresh result");
        state.current.clone().ok_or(AuthError::SessionMissing)
    } else {
        match outcome {
            Ok(session) => {
                let session = session.with_expiry_filled();
                state.generation += 1;
                state.current = Some(session.clone());
                debug!(id, "Session refreshed");
                let persisted = inner.storage.set(&StoredSession::new(session.clone()));
                inner
                    .emitter
                    .emit(AuthChangeEvent::TokenRefreshed, Some(session.clone()));
                match persisted {
                    Ok(()) => Ok(session),
                    Err(e) => {
                        warn!(error = %e, "Refreshed session could not be persisted");
                        Err(e.into())
                    }
                }
            }
            Err(e) if e.is_session_revoked() => {
                warn!(error = %e, "Refresh token rejected, signing out");
                state.generation += 1;
                state.current = None;
                if let Err(clear_err) = inner.storage.clear() {
                    warn!(error = %clear_err, "Failed to remove persisted session");
                }
                inner.emitter.emit(AuthChangeEvent::SignedOut, None);
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed");
                Err(e)
            }
        }
    };
    drop(state);
    let _ = tx.send(result);
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("storage", &self.inner.storage)
            .field("expiry_margin", &self.inner.expiry_margin)
            .finish_non_exhaustive()
    }
}
