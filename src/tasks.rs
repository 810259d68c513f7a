//! Background task handles with cooperative shutdown.
//!
//! Long-lived loops in this crate (membership listener forwarding, affinity
//! refill) run as named tokio tasks wired to a shutdown signal. Shutdown is
//! graceful first and forceful second: signal, wait out a grace period, then
//! abort, and always await termination, so callers that need "no work after
//! shutdown returns" get exactly that.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A named background task owned by the component that spawned it.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn a named task.
    ///
    /// The closure receives a shutdown receiver and must exit promptly once
    /// it fires, typically via `tokio::select!` around its work loop.
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(task(shutdown_rx));
        debug!(task = name, "spawned background task");
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    /// True once the task's future has returned or been aborted.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal shutdown and wait for the task to terminate.
    ///
    /// A task that does not observe the signal within `grace` is aborted.
    /// In every case the task has fully terminated by the time this returns.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.shutdown_tx.send(());
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => {
                debug!(task = self.name, "task shutdown complete");
            }
            Ok(Err(e)) => {
                warn!(task = self.name, error = %e, "task panicked during shutdown");
            }
            Err(_) => {
                warn!(task = self.name, "task did not respond to shutdown, aborting");
                self.handle.abort();
                let _ = (&mut self.handle).await;
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            debug!(task = self.name, "aborting task on drop");
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_signals_task() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();

        let task = BackgroundTask::spawn("cooperative", move |mut shutdown| async move {
            let _ = shutdown.recv().await;
            stopped_clone.store(true, Ordering::SeqCst);
        });

        task.shutdown(Duration::from_secs(1)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stubborn_task() {
        let task = BackgroundTask::spawn("stubborn", |_shutdown| async {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let start = std::time::Instant::now();
        task.shutdown(Duration::from_millis(100)).await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_drop_aborts_task() {
        let ran_to_completion = Arc::new(AtomicBool::new(false));
        let flag = ran_to_completion.clone();

        {
            let _task = BackgroundTask::spawn("dropped", move |_shutdown| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ran_to_completion.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_is_finished() {
        let task = BackgroundTask::spawn("quick", |_shutdown| async {});
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(task.is_finished());
        task.shutdown(Duration::from_millis(100)).await;
    }
}
