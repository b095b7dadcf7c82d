//! Owned background task handles with an explicit stop lifecycle

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Handle to a spawned background loop (reaper, listener, announcer).
///
/// The loop watches the paired shutdown channel and exits on signal; the
/// task's lifetime is tied to this handle rather than to process exit.
/// Dropping the handle without calling [`stop`](Self::stop) aborts the task.
#[derive(Debug)]
pub struct BackgroundTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Wraps a spawned task and its shutdown channel.
    pub fn new(shutdown: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self { shutdown, handle }
    }

    /// Signals the loop to exit and waits for it to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = (&mut self.handle).await {
            if !e.is_cancelled() {
                warn!("Background task ended abnormally: {e}");
            }
        }
    }

    /// Returns whether the task has already finished on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Creates the shutdown channel a background loop selects on.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_ends_the_loop() {
        let (tx, mut rx) = shutdown_channel();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(3600)) => {}
                }
            }
        });

        let task = BackgroundTask::new(tx, handle);
        assert!(!task.is_finished());
        task.stop().await;
    }
}
