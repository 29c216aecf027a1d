//! The work behind each request manager's futures.

mod lookup;
mod network;

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::common::{Contact, Id, ValueEntity};
use crate::context::Context;
use crate::DhtError;

pub use network::NetworkHandlers;

/// One operation, run once on an executor thread.
pub trait ResponseHandler<V>: Send {
    fn run(self: Box<Self>) -> Result<V, DhtError>;
}

impl<V, F> ResponseHandler<V> for F
where
    F: FnOnce() -> Result<V, DhtError> + Send,
{
    fn run(self: Box<Self>) -> Result<V, DhtError> {
        (*self)()
    }
}

/// Builds the [ResponseHandler]s the managers run.
///
/// Building must be cheap, it happens while the manager's dedup map is locked.
/// The work itself belongs in [ResponseHandler::run].
pub trait HandlerFactory: Debug + Send + Sync {
    /// Pings `to`, announcing `sender` as the requester.
    fn ping(
        &self,
        context: &Arc<Context>,
        to: SocketAddr,
        sender: Contact,
    ) -> Box<dyn ResponseHandler<PingResult>>;

    /// Looks up the `count` nodes closest to `lookup_id`.
    fn lookup(
        &self,
        context: &Arc<Context>,
        lookup_id: Id,
        count: usize,
    ) -> Box<dyn ResponseHandler<LookupResult>>;

    fn find_value(&self, context: &Arc<Context>, key: Id) -> Box<dyn ResponseHandler<ValueResult>>;

    /// Publishes `entity` on the nodes closest to its primary key.
    fn store(
        &self,
        context: &Arc<Context>,
        entity: ValueEntity,
    ) -> Box<dyn ResponseHandler<StoreResult>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    /// The node that answered.
    pub contact: Contact,
    /// Our address as the remote node sees it.
    pub external_address: SocketAddr,
    /// Remote estimate of the network size.
    pub estimated_size: u32,
    pub round_trip: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    pub lookup_id: Id,
    /// Nodes that answered, closest first.
    pub path: Vec<Contact>,
    /// Store tokens handed out by the nodes in [Self::path].
    pub tokens: HashMap<Id, Bytes>,
    /// Requests that failed or timed out.
    pub failures: usize,
    pub elapsed: Duration,
    /// Other nodes claiming the local id, see [crate::Dht::collision_ping].
    pub collisions: Vec<Contact>,
    pub(crate) found_new_nodes: bool,
}

impl LookupResult {
    /// Returns `true` if some node answering was not in the routing table
    /// when the lookup started.
    pub fn found_new_nodes(&self) -> bool {
        self.found_new_nodes
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueResult {
    pub key: Id,
    /// Empty if no node had a value under [Self::key].
    pub entities: Vec<ValueEntity>,
    /// The request load reported by the node the values came from.
    pub request_load: f32,
    /// Nodes queried before finding the values, closest first.
    pub path: Vec<Contact>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreResult {
    pub entity: ValueEntity,
    /// Nodes that accepted the entity.
    pub locations: Vec<Contact>,
    /// Nodes that refused it or did not answer.
    pub failures: Vec<Contact>,
}

impl StoreResult {
    pub fn is_stored(&self) -> bool {
        !self.locations.is_empty()
    }
}
