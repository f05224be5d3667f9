//! Guarded background tasks.
//!
//! Listener loops, broker drains, and server tasks must not outlive
//! their owner. [`TaskGuard`] aborts the wrapped task when dropped, so
//! every exit path releases the task without an explicit cancel.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

/// A spawned task that is aborted when the guard is dropped.
pub struct TaskGuard<T> {
    name: &'static str,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> TaskGuard<T> {
    /// Spawns `future` on the current runtime under this guard.
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            name,
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Aborts the task without waiting for it.
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    /// True once the task has finished (or was aborted).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the task to finish and returns its output, or `None`
    /// if the task was aborted or panicked.
    pub async fn join(mut self) -> Option<T> {
        let handle = self.handle.take()?;
        match handle.await {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(task = self.name, error = %err, "guarded task did not complete");
                None
            }
        }
    }

    /// Aborts the task and waits for it to unwind.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(task = self.name, "aborted guarded task on drop");
        }
    }
}
