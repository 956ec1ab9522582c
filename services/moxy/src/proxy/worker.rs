//! Cancellable background tasks.
//!
//! Every execution unit of the proxy (acceptor loops and relay pumps) runs as
//! a [`Worker`]. Stopping one is always "signal, then join": the worker's
//! cancellation token is cancelled, which unblocks any pending accept, read
//! or write raced against it, and the caller then waits for the task to exit
//! so that its sockets have been dropped by the time `kill_and_wait` returns.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Handle to a spawned, cancellable task.
pub struct Worker {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    terminate_timeout: Duration,
}

impl Worker {
    /// Spawn `task` with `cancel` as its cancellation signal.
    ///
    /// The task receives a clone of the token and must return promptly once
    /// it is cancelled.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        cancel: CancellationToken,
        terminate_timeout: Duration,
        task: F,
    ) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(cancel.clone()));
        Self {
            name: name.into(),
            cancel,
            handle: Some(handle),
            terminate_timeout,
        }
    }

    /// Whether the task has exited (or was already joined).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the task and wait until it has fully exited.
    ///
    /// A task that does not exit within the terminate timeout is aborted and
    /// then awaited. Calling this on a finished or already joined worker is a
    /// no-op.
    pub async fn kill_and_wait(&mut self) {
        self.cancel.cancel();

        let Some(mut handle) = self.handle.take() else {
            return;
        };

        let result = match tokio::time::timeout(self.terminate_timeout, &mut handle).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    worker = %self.name,
                    timeout_ms = self.terminate_timeout.as_millis() as u64,
                    "Worker did not stop in time, aborting"
                );
                handle.abort();
                handle.await
            }
        };

        match result {
            Ok(()) => debug!(worker = %self.name, "Worker stopped"),
            Err(e) if e.is_cancelled() => debug!(worker = %self.name, "Worker aborted"),
            Err(e) => error!(worker = %self.name, error = %e, "Worker panicked"),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // An unjoined worker must not outlive its owner.
        if self.handle.is_some() {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_kill_and_wait_waits_for_exit() {
        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);

        let mut worker = Worker::spawn(
            "test",
            CancellationToken::new(),
            Duration::from_secs(1),
            |cancel| async move {
                cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            },
        );

        assert!(!worker.is_finished());
        worker.kill_and_wait().await;
        assert!(exited.load(Ordering::SeqCst));
        assert!(worker.is_finished());
    }

    #[tokio::test]
    async fn test_kill_and_wait_is_idempotent() {
        let mut worker = Worker::spawn(
            "done",
            CancellationToken::new(),
            Duration::from_secs(1),
            |_cancel| async {},
        );

        worker.kill_and_wait().await;
        worker.kill_and_wait().await;
        assert!(worker.is_finished());
    }

    #[tokio::test]
    async fn test_unresponsive_worker_is_aborted() {
        let mut worker = Worker::spawn(
            "stuck",
            CancellationToken::new(),
            Duration::from_millis(50),
            |_cancel| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            },
        );

        tokio::time::timeout(Duration::from_secs(2), worker.kill_and_wait())
            .await
            .expect("kill_and_wait must not hang");
        assert!(worker.is_finished());
    }

    #[tokio::test]
    async fn test_panicking_worker_is_joined() {
        let mut worker = Worker::spawn(
            "panics",
            CancellationToken::new(),
            Duration::from_secs(1),
            |_cancel| async {
                panic!("boom");
            },
        );

        worker.kill_and_wait().await;
        assert!(worker.is_finished());
    }

    #[tokio::test]
    async fn test_parent_token_cancels_child_worker() {
        let parent = CancellationToken::new();
        let mut worker = Worker::spawn(
            "child",
            parent.child_token(),
            Duration::from_secs(1),
            |cancel| async move {
                cancel.cancelled().await;
            },
        );

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !worker.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("child should observe parent cancellation");
        worker.kill_and_wait().await;
    }
}
