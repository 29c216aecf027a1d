//! Request managers, deduplicating concurrent operations on the same key.

mod bootstrap;
mod lookup;
mod ping;
mod store;

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::concurrent::{panic_message, DhtFuture, EventChannel, Executor};
use crate::handler::ResponseHandler;
use crate::statistics::{NetworkStatistics, RequestCounters};
use crate::DhtError;

pub use bootstrap::{BootstrapEvent, BootstrapListener, BootstrapPhase, Bootstrapper};
pub use lookup::{FindValueManager, LookupManager};
pub use ping::{PingKind, PingManager};
pub use store::{StoreKey, StoreManager};

type Futures<K, V> = Arc<Mutex<HashMap<K, DhtFuture<V>>>>;

/// Picks a manager's counters out of [NetworkStatistics].
type CountersOf = fn(&NetworkStatistics) -> &RequestCounters;

/// Runs at most one operation per key at a time.
///
/// Requesting a key that is still in flight returns the very same [DhtFuture].
/// A future leaves the map when it completes, before any listener hears of it,
/// so the next request for its key starts a new operation.
pub struct FutureManager<K, V> {
    name: &'static str,
    futures: Futures<K, V>,
    events: Arc<EventChannel<V>>,
    executor: Arc<Executor>,
    statistics: Arc<NetworkStatistics>,
    counters: CountersOf,
}

impl<K, V> Debug for FutureManager<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureManager")
            .field("name", &self.name)
            .field("events", &self.events)
            .finish()
    }
}

impl<K, V> FutureManager<K, V>
where
    K: Debug + Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    pub(crate) fn new(
        name: &'static str,
        executor: Arc<Executor>,
        statistics: Arc<NetworkStatistics>,
        counters: CountersOf,
    ) -> Self {
        Self {
            name,
            futures: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(EventChannel::new()),
            executor,
            statistics,
            counters,
        }
    }

    // === Getters ===

    /// Listeners notified of every operation of this manager.
    pub fn events(&self) -> &Arc<EventChannel<V>> {
        &self.events
    }

    /// The future of the operation in flight for `key`.
    pub fn get(&self, key: &K) -> Option<DhtFuture<V>> {
        lock(&self.futures).get(key).cloned()
    }

    /// Number of operations in flight.
    pub fn len(&self) -> usize {
        lock(&self.futures).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Public Methods ===

    /// Returns the future in flight for `key`, or starts a new operation
    /// with the handler `build` returns.
    ///
    /// `build` runs with the map locked and must not call back into this manager.
    pub fn request<F>(&self, key: K, build: F) -> DhtFuture<V>
    where
        F: FnOnce() -> Box<dyn ResponseHandler<V>>,
    {
        let (future, handler) = {
            let mut futures = lock(&self.futures);

            if let Some(future) = futures.get(&key) {
                trace!(manager = self.name, ?key, "Joining operation in flight");
                return future.clone();
            }

            let handler = build();
            let future = DhtFuture::new(Some(self.events.clone()));

            let map = Arc::downgrade(&self.futures);
            let deregister_key = key.clone();
            let future_key = future.key();

            future.set_deregister(move || {
                let Some(map) = map.upgrade() else {
                    return;
                };

                let mut futures = lock(&map);
                if futures
                    .get(&deregister_key)
                    .is_some_and(|future| future.key() == future_key)
                {
                    futures.remove(&deregister_key);
                }
            });

            futures.insert(key.clone(), future.clone());

            (future, handler)
        };

        (self.counters)(&self.statistics).record_sent();

        let statistics = self.statistics.clone();
        let counters = self.counters;
        let name = self.name;
        let running = future.clone();

        let submitted = self.executor.execute(move || {
            let result = catch_unwind(AssertUnwindSafe(|| handler.run())).unwrap_or_else(|panic| {
                Err(DhtError::Panicked(panic_message(panic.as_ref())))
            });

            match &result {
                Ok(_) => counters(&statistics).record_ok(),
                Err(error) => {
                    counters(&statistics).record_failed();
                    debug!(manager = name, ?key, ?error, "Operation failed");
                }
            }

            running.complete_with(result);
        });

        if let Err(error) = submitted {
            (self.counters)(&self.statistics).record_failed();
            future.fail(error);
        }

        future
    }
}

fn lock<K, V>(futures: &Mutex<HashMap<K, DhtFuture<V>>>) -> MutexGuard<'_, HashMap<K, DhtFuture<V>>> {
    futures.lock().unwrap_or_else(PoisonError::into_inner)
}
