//! Listeners for the results of futures.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use crate::DhtError;

/// Receives the outcome of a [crate::DhtFuture].
///
/// Exactly one of the two methods is called once per completed future,
/// neither is called if the future was cancelled.
/// Callbacks run on the completing thread with no lock held.
pub trait DhtFutureListener<V>: Send + Sync {
    fn handle_result(&self, result: &V);

    fn handle_exception(&self, error: &DhtError);
}

impl<V: Clone + Send> DhtFutureListener<V> for flume::Sender<Result<V, DhtError>> {
    fn handle_result(&self, result: &V) {
        let _ = self.send(Ok(result.clone()));
    }

    fn handle_exception(&self, error: &DhtError) {
        let _ = self.send(Err(error.clone()));
    }
}

/// Listeners interested in every operation of one manager.
pub struct EventChannel<V> {
    listeners: Mutex<Vec<Arc<dyn DhtFutureListener<V>>>>,
}

impl<V> std::fmt::Debug for EventChannel<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventChannel({} listeners)", self.len())
    }
}

impl<V> Default for EventChannel<V> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<V> EventChannel<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn DhtFutureListener<V>>) {
        self.lock().push(listener);
    }

    /// Removes a listener previously added, compared by pointer.
    pub fn remove_listener(&self, listener: &Arc<dyn DhtFutureListener<V>>) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();

        listeners.retain(|l| !Arc::ptr_eq(l, listener));

        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn fire_result(&self, result: &V) {
        for listener in self.snapshot() {
            listener.handle_result(result);
        }
    }

    pub(crate) fn fire_exception(&self, error: &DhtError) {
        for listener in self.snapshot() {
            listener.handle_exception(error);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn DhtFutureListener<V>>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn DhtFutureListener<V>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Listener running a closure once with the outcome.
///
/// A cancelled future never notifies its listeners, it drops them. If the
/// closure has not run by then, it runs with [DhtError::Cancelled].
pub(crate) struct OnComplete<V, F>
where
    F: FnOnce(Result<V, DhtError>),
{
    callback: Mutex<Option<F>>,
    _value: PhantomData<fn(V)>,
}

impl<V, F> OnComplete<V, F>
where
    F: FnOnce(Result<V, DhtError>),
{
    pub(crate) fn new(callback: F) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
            _value: PhantomData,
        }
    }

    fn take(&self) -> Option<F> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<V, F> DhtFutureListener<V> for OnComplete<V, F>
where
    V: Clone,
    F: FnOnce(Result<V, DhtError>) + Send,
{
    fn handle_result(&self, result: &V) {
        if let Some(callback) = self.take() {
            callback(Ok(result.clone()))
        }
    }

    fn handle_exception(&self, error: &DhtError) {
        if let Some(callback) = self.take() {
            callback(Err(error.clone()))
        }
    }
}

impl<V, F> Drop for OnComplete<V, F>
where
    F: FnOnce(Result<V, DhtError>),
{
    fn drop(&mut self) {
        if let Some(callback) = self.take() {
            callback(Err(DhtError::Cancelled))
        }
    }
}
