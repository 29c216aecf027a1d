use std::sync::Arc;

use tracing::debug;

use super::FutureManager;
use crate::common::{Id, Value, ValueEntity};
use crate::concurrent::DhtFuture;
use crate::context::Context;
use crate::handler::{HandlerFactory, StoreResult};

/// An entity's primary key, secondary key and value.
pub type StoreKey = (Id, Id, Value);

#[derive(Debug)]
/// Publishes entities, one per [StoreKey] at a time.
///
/// Storing the same value again joins the publication in flight, a different
/// value under the same keys (a delete included) is published on its own.
pub struct StoreManager {
    context: Arc<Context>,
    handlers: Arc<dyn HandlerFactory>,
    futures: FutureManager<StoreKey, StoreResult>,
}

impl StoreManager {
    pub fn new(context: Arc<Context>, handlers: Arc<dyn HandlerFactory>) -> Self {
        Self {
            futures: FutureManager::new(
                "store",
                context.executor().clone(),
                context.statistics().clone(),
                |statistics| &statistics.stores,
            ),
            context,
            handlers,
        }
    }

    pub fn futures(&self) -> &FutureManager<StoreKey, StoreResult> {
        &self.futures
    }

    /// Stores `value` under `key` as a local entity, then publishes it.
    ///
    /// An empty value deletes our entity, locally and on the nodes accepting it.
    pub fn put(&self, key: Id, value: Value) -> DhtFuture<StoreResult> {
        let entity = ValueEntity::local(key, self.context.local_contact(), value);

        if !self.context.database().store(entity.clone()) {
            debug!(%key, "Local store refused our own entity");
        }

        self.store(entity)
    }

    /// Publishes `entity` on the nodes closest to its primary key.
    pub fn store(&self, entity: ValueEntity) -> DhtFuture<StoreResult> {
        let key = (
            *entity.primary_key(),
            *entity.secondary_key(),
            entity.value().clone(),
        );

        self.futures
            .request(key, || self.handlers.store(&self.context, entity))
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    use flume::Receiver;

    use super::*;
    use crate::common::Contact;
    use crate::handler::{LookupResult, PingResult, ResponseHandler, ValueResult};
    use crate::io::Transport;
    use crate::{Config, DhtError, ValueType};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Debug)]
    struct Null;

    impl Transport for Null {
        fn send_to(&self, _: SocketAddr, _: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn local_address(&self) -> SocketAddr {
            "127.0.0.1:4000".parse().unwrap()
        }
    }

    /// Publishes nowhere, remembering what it was asked to publish.
    #[derive(Debug, Default)]
    struct Publisher {
        /// The first publication waits for the receiver.
        gate: Option<Receiver<()>>,
        published: Mutex<Vec<Value>>,
    }

    impl HandlerFactory for Publisher {
        fn ping(&self, _: &Arc<Context>, _: SocketAddr, _: Contact) -> Box<dyn ResponseHandler<PingResult>> {
            Box::new(|| Err::<PingResult, _>(DhtError::Shutdown))
        }

        fn lookup(&self, _: &Arc<Context>, _: Id, _: usize) -> Box<dyn ResponseHandler<LookupResult>> {
            Box::new(|| Err::<LookupResult, _>(DhtError::Shutdown))
        }

        fn find_value(&self, _: &Arc<Context>, _: Id) -> Box<dyn ResponseHandler<ValueResult>> {
            Box::new(|| Err::<ValueResult, _>(DhtError::Shutdown))
        }

        fn store(&self, _: &Arc<Context>, entity: ValueEntity) -> Box<dyn ResponseHandler<StoreResult>> {
            let mut published = self.published.lock().unwrap();
            let gate = published.is_empty().then(|| self.gate.clone()).flatten();
            published.push(entity.value().clone());

            Box::new(move || {
                if let Some(gate) = gate {
                    let _ = gate.recv();
                }

                Ok(StoreResult {
                    entity,
                    locations: Vec::new(),
                    failures: Vec::new(),
                })
            })
        }
    }

    fn manager(publisher: Publisher) -> (StoreManager, Arc<Publisher>) {
        let config = Config {
            executor_threads: 2,
            ..Default::default()
        };
        let context = Arc::new(Context::new(config, Arc::new(Null)).unwrap());
        let publisher = Arc::new(publisher);

        (StoreManager::new(context, publisher.clone()), publisher)
    }

    #[test]
    fn same_value_joins_the_publication_in_flight() {
        let (release, gate) = flume::bounded::<()>(0);
        let (manager, publisher) = manager(Publisher {
            gate: Some(gate),
            ..Default::default()
        });

        let key = Id::random();
        let first = manager.put(key, Value::text("a"));
        let second = manager.put(key, Value::text("a"));

        assert!(first.ptr_eq(&second));
        assert_eq!(*publisher.published.lock().unwrap(), vec![Value::text("a")]);

        drop(release);
        assert!(first.get_timeout(TIMEOUT).is_some());
    }

    #[test]
    fn new_value_is_published_while_the_old_one_is_in_flight() {
        let (release, gate) = flume::bounded::<()>(0);
        let (manager, publisher) = manager(Publisher {
            gate: Some(gate),
            ..Default::default()
        });

        let key = Id::random();
        let first = manager.put(key, Value::text("v1"));
        let second = manager.put(key, Value::text("v2"));
        let delete = manager.put(key, Value::empty(ValueType::TEXT));

        assert!(!first.ptr_eq(&second));
        assert!(!second.ptr_eq(&delete));

        let published = second.get_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(published.entity.value(), &Value::text("v2"));

        let deleted = delete.get_timeout(TIMEOUT).unwrap().unwrap();
        assert!(deleted.entity.is_empty());

        assert_eq!(
            *publisher.published.lock().unwrap(),
            vec![
                Value::text("v1"),
                Value::text("v2"),
                Value::empty(ValueType::TEXT)
            ]
        );

        // The first one is still blocked
        assert!(!first.is_done());
        drop(release);
        assert!(first.get_timeout(TIMEOUT).is_some());
    }
}
