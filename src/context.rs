//! Everything a running node shares between its components.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, trace};

use crate::common::{Contact, Id, Vendor, Version, FIREWALLED_FLAG, SHUTDOWN_FLAG};
use crate::concurrent::Executor;
use crate::config::Config;
use crate::db::{BanList, HostFilter, ValueStore};
use crate::io::{Dispatcher, Transport};
use crate::messages::{Message, MessageBody, PROTOCOL_VERSION};
use crate::routing::{KademliaTable, RouteTable};
use crate::server::Server;
use crate::statistics::{NetworkStatistics, SizeEstimator};
use crate::Result;

#[derive(Debug)]
/// Local identity and collaborators of a node.
///
/// Built once, then shared behind an [Arc] by the managers, the handlers and
/// the receive loop. Only the local id may change afterwards, see
/// [Context::change_local_id].
pub struct Context {
    config: Config,
    local_contact: RwLock<Contact>,
    route_table: Arc<dyn RouteTable>,
    host_filter: Arc<dyn HostFilter>,
    database: Arc<ValueStore>,
    executor: Arc<Executor>,
    dispatcher: Arc<Dispatcher>,
    server: Server,
    statistics: Arc<NetworkStatistics>,
    size_estimator: SizeEstimator,
}

impl Context {
    /// Creates a context with a [KademliaTable] and a [BanList].
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Context> {
        let id = config.id.unwrap_or_else(Id::random);
        let route_table = Arc::new(KademliaTable::new(id, config.k));

        Self::with_collaborators(config, transport, route_table, Arc::new(BanList::default()))
    }

    /// Creates a context around custom collaborators.
    ///
    /// The local id is the route table's, [Config::id] is ignored.
    pub fn with_collaborators(
        config: Config,
        transport: Arc<dyn Transport>,
        route_table: Arc<dyn RouteTable>,
        host_filter: Arc<dyn HostFilter>,
    ) -> Result<Context> {
        let statistics = Arc::new(NetworkStatistics::default());

        let flags = if config.firewalled { FIREWALLED_FLAG } else { 0 };
        let local_contact = Contact::new(route_table.local_id(), transport.local_address())
            .with_vendor(Vendor::KADNODE, PROTOCOL_VERSION)
            .with_flags(flags);

        let executor = Arc::new(Executor::new("kadnode", config.executor_threads)?);
        let dispatcher =
            Dispatcher::new(transport, config.request_timeout, statistics.clone())?;

        debug!(id = %local_contact.id(), address = ?local_contact.address(), "Created node context");

        Ok(Context {
            database: Arc::new(ValueStore::new(
                config.database.clone(),
                host_filter.clone(),
            )),
            server: Server::new(config.response_cache_size),
            config,
            local_contact: RwLock::new(local_contact),
            route_table,
            host_filter,
            executor,
            dispatcher,
            statistics,
            size_estimator: SizeEstimator::default(),
        })
    }

    // === Getters ===

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The contact other nodes know this node by.
    pub fn local_contact(&self) -> Contact {
        self.local_contact
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn local_id(&self) -> Id {
        *self.local_contact().id()
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_contact().address()
    }

    pub fn version(&self) -> Version {
        self.local_contact().version()
    }

    pub fn route_table(&self) -> &Arc<dyn RouteTable> {
        &self.route_table
    }

    pub fn host_filter(&self) -> &Arc<dyn HostFilter> {
        &self.host_filter
    }

    pub fn database(&self) -> &Arc<ValueStore> {
        &self.database
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        &self.statistics
    }

    pub fn size_estimator(&self) -> &SizeEstimator {
        &self.size_estimator
    }

    /// Estimated number of nodes in the network.
    ///
    /// The local part of the estimate is recomputed from the routing table
    /// once it is stale.
    pub fn estimated_size(&self) -> u64 {
        if self.size_estimator.is_stale() {
            let local_id = self.local_id();
            let closest = self.route_table.closest(&local_id, self.config.k);

            self.size_estimator.update_estimated_size(&local_id, &closest);
        }

        self.size_estimator.size()
    }

    // === Public Methods ===

    /// Processes one received datagram.
    ///
    /// Requests are answered right away, responses are handed to whoever
    /// waits for them. Anything malformed or filtered is dropped.
    pub fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) {
        let message = match Message::from_bytes(from, bytes) {
            Ok(message) => message,
            Err(error) => {
                NetworkStatistics::increment(&self.statistics.malformed_messages);
                debug!(?from, ?error, "Dropping malformed message");

                return;
            }
        };

        if !self.host_filter.allow(&message) {
            NetworkStatistics::increment(&self.statistics.filtered_messages);
            trace!(?from, "Dropping message from a filtered host");

            return;
        }

        NetworkStatistics::increment(&self.statistics.messages_received);

        self.update_route_table(from, message.sender());

        if message.is_request() {
            if let Some(response) = self.server.handle_request(self, from, &message) {
                self.dispatcher.send_response(from, &response);
            }
        } else {
            self.dispatcher.handle_response(from, message);
        }
    }

    /// Stops the worker threads, operations in flight are not interrupted.
    pub fn shutdown(&self) {
        self.executor.shutdown();
    }

    /// Pings the `k` closest contacts with [SHUTDOWN_FLAG] set, so they drop
    /// this node from their routing tables. Nobody waits for the responses.
    pub fn announce_shutdown(&self) {
        let local = self.local_contact();
        let sender = local.clone().with_flags(local.flags() | SHUTDOWN_FLAG);

        let closest = self.route_table.closest(local.id(), self.config.k);

        for contact in &closest {
            let request = Message::request(sender.clone(), MessageBody::PingRequest);
            self.dispatcher.send_unanswered(contact.address(), &request);
        }

        debug!(contacts = closest.len(), "Announced shutdown");
    }

    /// Picks a new random local id, after another node turned out to use ours.
    ///
    /// The routing table is rebuilt around the new id and the database is
    /// purged, the values it holds were placed by their distance to the old id.
    pub fn change_local_id(&self) -> Id {
        let id = Id::random();

        let previous = {
            let mut local = self
                .local_contact
                .write()
                .unwrap_or_else(PoisonError::into_inner);

            let previous = *local.id();
            *local = Contact::new(id, local.address())
                .with_vendor(local.vendor(), local.version())
                .with_instance_id(local.instance_id())
                .with_flags(local.flags());

            previous
        };

        self.route_table.rebuild(id);
        self.database.clear();
        self.size_estimator.reset_local();

        info!(%previous, %id, "Changed local id");

        id
    }

    // === Private Methods ===

    fn update_route_table(&self, from: SocketAddr, sender: &Contact) {
        if sender.is_shutdown() {
            trace!(?from, id = %sender.id(), "Sender is shutting down");
            self.route_table.remove(sender.id());

            return;
        }

        if sender.is_firewalled() || sender.is_collision_ping_sender(&self.local_id()) {
            return;
        }

        self.route_table.add(sender.clone().with_address(from));
    }
}
