//! Fixed size pool of worker threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, warn};

use crate::DhtError;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
/// Runs submitted jobs on a shared, bounded set of threads.
///
/// A panicking job is logged and does not take its worker down.
pub struct Executor {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Spawns `threads` workers (at least one) named `{name}-{index}`.
    pub fn new(name: &str, threads: usize) -> std::io::Result<Executor> {
        let (sender, receiver) = flume::unbounded::<Job>();

        let workers = (0..threads.max(1))
            .map(|index| {
                let receiver = receiver.clone();

                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || work(receiver))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!(?name, threads = workers.len(), "Started executor");

        Ok(Executor {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    // === Public Methods ===

    /// Queues a job, fails with [DhtError::Shutdown] after [Self::shutdown].
    pub fn execute<F>(&self, job: F) -> Result<(), DhtError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);

        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(job)).map_err(|_| DhtError::Shutdown),
            None => Err(DhtError::Shutdown),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the workers.
    ///
    /// When called from one of the workers, the workers are left to exit on their own.
    pub fn shutdown(&self) {
        if self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_none()
        {
            return;
        }

        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));

        let current = thread::current().id();
        if workers.iter().any(|worker| worker.thread().id() == current) {
            return;
        }

        for worker in workers {
            let _ = worker.join();
        }

        debug!(name = ?self.name, "Executor shutdown");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown()
    }
}

fn work(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            warn!(
                thread = ?thread::current().name(),
                panic = panic_message(panic.as_ref()),
                "Job panicked"
            );
        }
    }
}

/// Best effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
