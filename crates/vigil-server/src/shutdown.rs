//! Shutdown signalling and background-task tracking.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the server-wide cancellation token and every background task
/// spawned under it.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Fresh coordinator with no tracked tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Child token; cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Track a task so [`Self::drain`] waits for it.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Track several tasks.
    pub fn track_all(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks.lock().extend(handles);
    }

    /// Number of tracked tasks not yet drained.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Signal shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown, then wait up to `timeout` for tracked tasks.
    ///
    /// Tasks still running at the deadline are aborted. Returns `true` when
    /// everything finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.shutdown();
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            return true;
        }
        info!(tasks = handles.len(), ?timeout, "draining background tasks");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "shutdown deadline hit, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.tracked(), 0);
    }

    #[test]
    fn child_tokens_follow_shutdown() {
        let coord = ShutdownCoordinator::new();
        let a = coord.token();
        let b = coord.token();
        coord.shutdown();
        coord.shutdown();
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn drain_waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        coord.track(tokio::spawn(async move { token.cancelled().await }));
        assert_eq!(coord.tracked(), 1);

        assert!(coord.drain(Duration::from_secs(1)).await);
        assert_eq!(coord.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_stuck_tasks() {
        let coord = ShutdownCoordinator::new();
        coord.track(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));
        assert!(!coord.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn drain_with_nothing_tracked() {
        let coord = ShutdownCoordinator::new();
        assert!(coord.drain(Duration::from_millis(1)).await);
        assert!(coord.is_shutting_down());
    }
}
