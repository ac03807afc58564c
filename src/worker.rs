//! Process-wide background worker for dead-row cleanup.
//!
//! Acquire submits cleanup here so a slow scan cannot hold the acquire
//! transaction hostage. The queue is unbounded and the threads never join:
//! a caller that stops waiting leaves its job running to completion in the
//! background.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{LazyLock, Mutex};
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send>;

static QUEUE: LazyLock<Mutex<mpsc::Sender<Job>>> = LazyLock::new(|| {
    let (tx, rx) = mpsc::channel::<Job>();
    thread::Builder::new()
        .name("turnstile-janitor".into())
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                // The thread must outlive any one job.
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    tracing::error!("cleanup job panicked");
                }
            }
        })
        .expect("spawn janitor thread");
    Mutex::new(tx)
});

/// Handle to a submitted job's result.
pub(crate) struct JobHandle<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Wait up to `timeout` for the result. `None` means the job is still
    /// running; it is not cancelled.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

pub(crate) fn submit<T, F>(f: F) -> JobHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let job: Job = Box::new(move || {
        let _ = done_tx.send(f());
    });
    QUEUE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .send(job)
        .expect("janitor thread alive for process lifetime");
    JobHandle { rx: done_rx }
}
