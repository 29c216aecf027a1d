//! AsyncDht node.

use std::net::SocketAddr;

use crate::common::{Id, Value};
use crate::handler::{LookupResult, PingResult, StoreResult, ValueResult};
use crate::manager::BootstrapEvent;
use crate::{Dht, DhtError};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// The blocking [Dht] this node wraps.
    pub fn as_blocking(&self) -> &Dht {
        &self.0
    }

    // === Public Methods ===

    pub fn shutdown(&self) {
        self.0.shutdown();
    }

    /// Bootstraps from [crate::Config::bootstrap] and waits until done.
    ///
    /// Returns true if the bootstraping was successful.
    pub async fn bootstrapped(&self) -> bool {
        let (sender, receiver) = flume::unbounded();
        self.0.bootstrap(sender);

        while let Ok(event) = receiver.recv_async().await {
            match event {
                BootstrapEvent::PhaseOneComplete(_) => {}
                BootstrapEvent::PhaseTwoComplete { .. } => return self.0.is_bootstrapped(),
                BootstrapEvent::NoBootstrapHost(_) => return false,
            }
        }

        false
    }

    pub async fn ping(&self, address: SocketAddr) -> Result<PingResult, DhtError> {
        self.0.ping(address).recv_async().await
    }

    pub async fn lookup(&self, lookup_id: Id) -> Result<LookupResult, DhtError> {
        self.0.lookup(lookup_id).recv_async().await
    }

    pub async fn get(&self, key: Id) -> Result<ValueResult, DhtError> {
        self.0.get(key).recv_async().await
    }

    pub async fn put(&self, key: Id, value: Value) -> Result<StoreResult, DhtError> {
        self.0.put(key, value).recv_async().await
    }
}
