//! Async runtime helpers shared by the service crates.
//!
//! Thin wrappers over tokio so background work (socket loops, refresh tasks,
//! replay deliveries) is spawned and cancelled the same way everywhere.

use std::future::Future;
use std::time::Duration;

// ── Spawn ────────────────────────────────────────────────────────────────────

/// Spawn a future as a background task on the current tokio runtime.
pub fn spawn<F>(future: F) -> SpawnHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    SpawnHandle {
        handle: tokio::spawn(future),
    }
}

// ── SpawnHandle ──────────────────────────────────────────────────────────────

/// Handle to a spawned background task, allowing cancellation.
///
/// Dropping the handle detaches the task; call [`SpawnHandle::abort`] to
/// stop it.
#[derive(Debug)]
pub struct SpawnHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle {
    /// Abort the spawned task.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Whether the task has run to completion (or was aborted).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to end. Panics and cancellation are swallowed.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

// ── Sleep ────────────────────────────────────────────────────────────────────

/// Sleep for the given duration.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

// ── Timeout ──────────────────────────────────────────────────────────────────

/// Error returned when a timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError;

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimeoutError {}

/// Run a future with a timeout.
pub async fn timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn timeout_expires() {
        let start = Instant::now();
        let result = timeout(Duration::from_millis(50), sleep(Duration::from_secs(5))).await;
        assert_eq!(result, Err(TimeoutError));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn timeout_passes_value_through() {
        let result = timeout(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn abort_stops_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = spawn(async move {
            sleep(Duration::from_secs(30)).await;
            let _ = tx.send(());
        });
        handle.abort();
        assert!(rx.await.is_err());
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
    }
}
