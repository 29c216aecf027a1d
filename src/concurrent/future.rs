//! Result of an outstanding operation.

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::events::{DhtFutureListener, EventChannel};
use crate::DhtError;

type Listener<V> = Arc<dyn DhtFutureListener<V>>;
type Deregister = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, PartialEq)]
/// How a [DhtFuture] completed.
pub enum Outcome<V> {
    Success(V),
    Failure(DhtError),
    Cancelled,
}

impl<V> Outcome<V> {
    fn into_result(self) -> Result<V, DhtError> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(error) => Err(error),
            Outcome::Cancelled => Err(DhtError::Cancelled),
        }
    }
}

enum State<V> {
    Pending,
    /// Won the race to complete, running the deregister hook.
    Completing,
    Done(Outcome<V>),
}

struct Inner<V> {
    state: Mutex<State<V>>,
    done: Condvar,
    /// `None` once drained by the completion.
    listeners: Mutex<Option<Vec<Listener<V>>>>,
    deregister: Mutex<Option<Deregister>>,
    events: Option<Arc<EventChannel<V>>>,
}

/// Handle to the eventual result of an operation.
///
/// Cloning returns another handle to the same operation.
///
/// Completion happens exactly once, either through the operation finishing
/// or through [DhtFuture::cancel]. The owner's deregister hook runs before any
/// listener is notified, and listeners are never called with a lock held.
pub struct DhtFuture<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for DhtFuture<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Debug for DhtFuture<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match &*lock(&self.inner.state) {
            State::Pending | State::Completing => "pending",
            State::Done(Outcome::Success(_)) => "success",
            State::Done(Outcome::Failure(_)) => "failure",
            State::Done(Outcome::Cancelled) => "cancelled",
        };

        write!(f, "DhtFuture({state})")
    }
}

impl<V: Clone + Send + 'static> Default for DhtFuture<V> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<V: Clone + Send + 'static> DhtFuture<V> {
    /// Creates a pending future, reporting to `events` as well as its own listeners.
    pub fn new(events: Option<Arc<EventChannel<V>>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending),
                done: Condvar::new(),
                listeners: Mutex::new(Some(Vec::new())),
                deregister: Mutex::new(None),
                events,
            }),
        }
    }

    /// Creates a future that already failed.
    pub fn failed(error: DhtError) -> Self {
        let future = Self::new(None);
        future.fail(error);
        future
    }

    // === Getters ===

    pub fn is_done(&self) -> bool {
        matches!(*lock(&self.inner.state), State::Done(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*lock(&self.inner.state), State::Done(Outcome::Cancelled))
    }

    /// Returns `true` if both handles refer to the same operation.
    pub fn ptr_eq(&self, other: &DhtFuture<V>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // === Public Methods ===

    /// Registers a listener.
    ///
    /// If the future is already done, the listener is notified right away on
    /// the calling thread.
    pub fn add_listener<L>(&self, listener: L)
    where
        L: DhtFutureListener<V> + 'static,
    {
        let listener: Listener<V> = Arc::new(listener);

        {
            let mut listeners = lock(&self.inner.listeners);
            if let Some(listeners) = listeners.as_mut() {
                listeners.push(listener);
                return;
            }
        }

        // Drained, so the outcome is already set.
        let outcome = match &*lock(&self.inner.state) {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending | State::Completing => None,
        };

        if let Some(outcome) = outcome {
            notify(&listener, &outcome);
        }
    }

    /// Blocks the calling thread until the future is done.
    pub fn get(&self) -> Result<V, DhtError> {
        let state = lock(&self.inner.state);

        let state = self
            .inner
            .done
            .wait_while(state, |state| !matches!(state, State::Done(_)))
            .unwrap_or_else(PoisonError::into_inner);

        outcome_of(&state).into_result()
    }

    /// Like [Self::get], returns `None` if the future is still pending after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Result<V, DhtError>> {
        let state = lock(&self.inner.state);

        let (state, _) = self
            .inner
            .done
            .wait_timeout_while(state, timeout, |state| !matches!(state, State::Done(_)))
            .unwrap_or_else(PoisonError::into_inner);

        match &*state {
            State::Done(_) => Some(outcome_of(&state).into_result()),
            _ => None,
        }
    }

    /// Cancels the future, returns `false` if it was already done.
    ///
    /// No listener is notified, blocked [Self::get] calls return [DhtError::Cancelled].
    /// The operation itself keeps running, its result is discarded.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    #[cfg(feature = "async")]
    /// Awaits the outcome from async code.
    pub async fn recv_async(&self) -> Result<V, DhtError> {
        let (sender, receiver) = flume::bounded(1);
        self.add_listener(sender);

        // A cancelled future drops the sender without sending.
        receiver
            .recv_async()
            .await
            .unwrap_or(Err(DhtError::Cancelled))
    }

    // === Crate Methods ===

    /// Sets the hook the owner uses to forget about this future.
    ///
    /// Must be set before the future can complete.
    pub(crate) fn set_deregister<F>(&self, deregister: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.inner.deregister) = Some(Box::new(deregister));
    }

    /// Address of the shared state, stable for the lifetime of the future.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn succeed(&self, value: V) -> bool {
        self.complete(Outcome::Success(value))
    }

    pub(crate) fn fail(&self, error: DhtError) -> bool {
        self.complete(Outcome::Failure(error))
    }

    pub(crate) fn complete_with(&self, result: Result<V, DhtError>) -> bool {
        match result {
            Ok(value) => self.succeed(value),
            Err(error) => self.fail(error),
        }
    }

    // === Private Methods ===

    fn complete(&self, outcome: Outcome<V>) -> bool {
        {
            let mut state = lock(&self.inner.state);
            if !matches!(*state, State::Pending) {
                return false;
            }
            *state = State::Completing;
        }

        let deregister = lock(&self.inner.deregister).take();
        if let Some(deregister) = deregister {
            deregister();
        }

        *lock(&self.inner.state) = State::Done(outcome.clone());
        self.inner.done.notify_all();

        let listeners = lock(&self.inner.listeners).take().unwrap_or_default();

        for listener in &listeners {
            notify(listener, &outcome);
        }

        if let Some(events) = &self.inner.events {
            match &outcome {
                Outcome::Success(value) => events.fire_result(value),
                Outcome::Failure(error) => events.fire_exception(error),
                Outcome::Cancelled => {}
            }
        }

        true
    }
}

fn notify<V>(listener: &Listener<V>, outcome: &Outcome<V>) {
    match outcome {
        Outcome::Success(value) => listener.handle_result(value),
        Outcome::Failure(error) => listener.handle_exception(error),
        Outcome::Cancelled => {}
    }
}

fn outcome_of<V: Clone>(state: &State<V>) -> Outcome<V> {
    match state {
        State::Done(outcome) => outcome.clone(),
        // Only called once the state is done.
        State::Pending | State::Completing => Outcome::Cancelled,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct Counter {
        results: AtomicUsize,
        exceptions: AtomicUsize,
    }

    impl DhtFutureListener<u32> for Arc<Counter> {
        fn handle_result(&self, _: &u32) {
            self.results.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_exception(&self, _: &DhtError) {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Counter {
        fn counts(&self) -> (usize, usize) {
            (
                self.results.load(Ordering::SeqCst),
                self.exceptions.load(Ordering::SeqCst),
            )
        }
    }

    #[test]
    fn listener_added_after_success() {
        let future = DhtFuture::<u32>::default();
        future.succeed(7);

        let counter = Arc::new(Counter::default());
        future.add_listener(counter.clone());

        assert_eq!(counter.counts(), (1, 0));
        assert_eq!(future.get(), Ok(7));
    }

    #[test]
    fn listener_added_after_failure() {
        let future = DhtFuture::<u32>::failed(DhtError::NoContacts);

        let counter = Arc::new(Counter::default());
        future.add_listener(counter.clone());

        assert_eq!(counter.counts(), (0, 1));
        assert_eq!(future.get(), Err(DhtError::NoContacts));
    }

    #[test]
    fn listener_added_after_cancel() {
        let future = DhtFuture::<u32>::default();
        assert!(future.cancel());

        let counter = Arc::new(Counter::default());
        future.add_listener(counter.clone());

        assert_eq!(counter.counts(), (0, 0));
        assert!(future.is_cancelled());
        assert_eq!(future.get(), Err(DhtError::Cancelled));
    }

    #[test]
    fn listener_added_before_completion() {
        let future = DhtFuture::<u32>::default();

        let counter = Arc::new(Counter::default());
        future.add_listener(counter.clone());
        assert_eq!(counter.counts(), (0, 0));

        future.succeed(1);
        assert_eq!(counter.counts(), (1, 0));

        // Completes only once
        assert!(!future.succeed(2));
        assert!(!future.cancel());
        assert_eq!(counter.counts(), (1, 0));
        assert_eq!(future.get(), Ok(1));
    }

    #[test]
    fn cancel_before_completion_is_silent() {
        let events = Arc::new(EventChannel::new());
        let global = Arc::new(Counter::default());
        events.add_listener(Arc::new(global.clone()));

        let future = DhtFuture::<u32>::new(Some(events));
        let local = Arc::new(Counter::default());
        future.add_listener(local.clone());

        future.cancel();
        future.succeed(1);

        assert_eq!(local.counts(), (0, 0));
        assert_eq!(global.counts(), (0, 0));
    }

    #[test]
    fn event_channel_receives_every_outcome() {
        let events = Arc::new(EventChannel::new());
        let global = Arc::new(Counter::default());
        events.add_listener(Arc::new(global.clone()));

        DhtFuture::<u32>::new(Some(events.clone())).succeed(1);
        DhtFuture::<u32>::new(Some(events.clone())).fail(DhtError::NoContacts);

        assert_eq!(global.counts(), (1, 1));
    }

    #[test]
    fn deregister_runs_once_before_listeners() {
        let future = DhtFuture::<u32>::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let order = order.clone();
            future.set_deregister(move || order.lock().unwrap().push("deregister"));
        }

        struct Recorder(Arc<Mutex<Vec<&'static str>>>);
        impl DhtFutureListener<u32> for Recorder {
            fn handle_result(&self, _: &u32) {
                self.0.lock().unwrap().push("result");
            }
            fn handle_exception(&self, _: &DhtError) {
                self.0.lock().unwrap().push("exception");
            }
        }

        future.add_listener(Recorder(order.clone()));
        future.succeed(1);
        future.cancel();

        assert_eq!(*order.lock().unwrap(), vec!["deregister", "result"]);
    }

    #[test]
    fn get_blocks_until_done() {
        let future = DhtFuture::<u32>::default();

        let completer = {
            let future = future.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                future.succeed(42);
            })
        };

        assert_eq!(future.get(), Ok(42));
        completer.join().unwrap();
    }

    #[test]
    fn get_timeout() {
        let future = DhtFuture::<u32>::default();

        assert_eq!(future.get_timeout(Duration::from_millis(10)), None);

        future.fail(DhtError::Shutdown);
        assert_eq!(
            future.get_timeout(Duration::from_millis(10)),
            Some(Err(DhtError::Shutdown))
        );
    }

    #[test]
    fn listener_may_call_back_into_the_future() {
        let future = DhtFuture::<u32>::default();

        struct Reentrant(DhtFuture<u32>, flume::Sender<Result<u32, DhtError>>);
        impl DhtFutureListener<u32> for Reentrant {
            fn handle_result(&self, _: &u32) {
                // No lock is held while notifying
                let _ = self.1.send(self.0.get());
                self.0.add_listener(self.1.clone());
            }
            fn handle_exception(&self, _: &DhtError) {}
        }

        let (tx, rx) = flume::unbounded();
        future.add_listener(Reentrant(future.clone(), tx));
        future.succeed(3);

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Ok(3), Ok(3)]);
    }

    #[cfg(feature = "async")]
    #[test]
    fn recv_async() {
        let future = DhtFuture::<u32>::default();
        future.succeed(5);

        assert_eq!(futures::executor::block_on(future.recv_async()), Ok(5));

        let cancelled = DhtFuture::<u32>::default();
        cancelled.cancel();

        assert_eq!(
            futures::executor::block_on(cancelled.recv_async()),
            Err(DhtError::Cancelled)
        );
    }
}
