//! Background worker threads and their control handles.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub mod reaper;

pub use reaper::IdempotencyReaper;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a named thread running `body`; `body` must return once the
    /// receiver yields (or disconnects).
    pub(crate) fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(mpsc::Receiver<()>) + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(shutdown_rx))?;

        Ok(Self {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop without waiting for it.
    pub fn signal(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the worker thread to exit.
    pub fn join(mut self) {
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(self) {
        self.signal();
        self.join();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }
}

/// Non-blocking shutdown check.
pub(crate) fn shutdown_requested(shutdown: &mpsc::Receiver<()>) -> bool {
    matches!(
        shutdown.try_recv(),
        Ok(()) | Err(mpsc::TryRecvError::Disconnected)
    )
}

/// Sleep for `duration`, waking early on shutdown. Returns `true` when the
/// worker should stop.
pub(crate) fn sleep_or_shutdown(shutdown: &mpsc::Receiver<()>, duration: Duration) -> bool {
    match shutdown.recv_timeout(duration) {
        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
        Err(mpsc::RecvTimeoutError::Timeout) => false,
    }
}
