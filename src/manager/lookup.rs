use std::sync::Arc;

use super::FutureManager;
use crate::common::Id;
use crate::concurrent::DhtFuture;
use crate::context::Context;
use crate::handler::{HandlerFactory, LookupResult, ValueResult};

#[derive(Debug)]
/// FIND_NODE lookups, one per lookup id at a time.
pub struct LookupManager {
    context: Arc<Context>,
    handlers: Arc<dyn HandlerFactory>,
    futures: FutureManager<Id, LookupResult>,
}

impl LookupManager {
    pub fn new(context: Arc<Context>, handlers: Arc<dyn HandlerFactory>) -> Self {
        Self {
            futures: FutureManager::new(
                "lookup",
                context.executor().clone(),
                context.statistics().clone(),
                |statistics| &statistics.lookups,
            ),
            context,
            handlers,
        }
    }

    pub fn futures(&self) -> &FutureManager<Id, LookupResult> {
        &self.futures
    }

    /// Looks up the [crate::Config::k] nodes closest to `lookup_id`.
    pub fn lookup(&self, lookup_id: Id) -> DhtFuture<LookupResult> {
        self.lookup_count(lookup_id, self.context.config().k)
    }

    /// Looks up the `count` nodes closest to `lookup_id`.
    ///
    /// Joining a lookup in flight returns its result, whatever count it was started with.
    pub fn lookup_count(&self, lookup_id: Id, count: usize) -> DhtFuture<LookupResult> {
        self.futures.request(lookup_id, || {
            self.handlers.lookup(&self.context, lookup_id, count)
        })
    }
}

#[derive(Debug)]
/// FIND_VALUE lookups, one per key at a time.
pub struct FindValueManager {
    context: Arc<Context>,
    handlers: Arc<dyn HandlerFactory>,
    futures: FutureManager<Id, ValueResult>,
}

impl FindValueManager {
    pub fn new(context: Arc<Context>, handlers: Arc<dyn HandlerFactory>) -> Self {
        Self {
            futures: FutureManager::new(
                "find value",
                context.executor().clone(),
                context.statistics().clone(),
                |statistics| &statistics.find_values,
            ),
            context,
            handlers,
        }
    }

    pub fn futures(&self) -> &FutureManager<Id, ValueResult> {
        &self.futures
    }

    pub fn get(&self, key: Id) -> DhtFuture<ValueResult> {
        self.futures
            .request(key, || self.handlers.find_value(&self.context, key))
    }
}
