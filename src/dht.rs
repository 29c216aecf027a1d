//! Dht node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::common::{Contact, Id, Value, ValueEntity};
use crate::concurrent::DhtFuture;
use crate::config::Config;
use crate::context::Context;
use crate::db::{BanList, DatabaseSettings, HostFilter, ValueStore};
use crate::handler::{
    HandlerFactory, LookupResult, NetworkHandlers, PingResult, StoreResult, ValueResult,
};
use crate::io::{Transport, UdpTransport};
use crate::manager::{
    BootstrapEvent, BootstrapListener, Bootstrapper, FindValueManager, LookupManager,
    PingManager, StoreManager,
};
use crate::routing::{KademliaTable, RouteTable};
use crate::statistics::NetworkStatistics;
use crate::Result;

#[derive(Debug, Clone)]
/// Dht node.
///
/// Every operation returns a [DhtFuture] right away. Clones share the same node,
/// which shuts down once the last clone is dropped or [Dht::shutdown] is called.
pub struct Dht(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    context: Arc<Context>,
    ping: Arc<PingManager>,
    lookup: Arc<LookupManager>,
    find_value: FindValueManager,
    store: StoreManager,
    bootstrapper: Bootstrapper,
    running: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
/// Dht node builder
pub struct DhtBuilder {
    config: Config,
    route_table: Option<Arc<dyn RouteTable>>,
    host_filter: Option<Arc<dyn HostFilter>>,
    handlers: Option<Arc<dyn HandlerFactory>>,
}

impl DhtBuilder {
    /// Set bootstrapping nodes
    pub fn bootstrap(mut self, bootstrap: &[SocketAddr]) -> Self {
        self.config.bootstrap = bootstrap.to_vec();
        self
    }

    /// Set the address to bind the UDP socket to.
    pub fn bind_address(mut self, address: SocketAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    /// Set the port to listen on, on all interfaces.
    pub fn port(mut self, port: u16) -> Self {
        self.config.bind_address.set_port(port);
        self
    }

    /// Set an explicit node id.
    pub fn id(mut self, id: Id) -> Self {
        self.config.id = Some(id);
        self
    }

    /// Announce this node as unreachable for unsolicited traffic.
    pub fn firewalled(mut self, firewalled: bool) -> Self {
        self.config.firewalled = firewalled;
        self
    }

    pub fn k(mut self, k: usize) -> Self {
        self.config.k = k;
        self
    }

    pub fn alpha(mut self, alpha: usize) -> Self {
        self.config.alpha = alpha;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.config.request_timeout = request_timeout;
        self
    }

    pub fn max_bootstrap_failures(mut self, max_bootstrap_failures: usize) -> Self {
        self.config.max_bootstrap_failures = max_bootstrap_failures;
        self
    }

    pub fn refresh_all_buckets(mut self, refresh_all_buckets: bool) -> Self {
        self.config.refresh_all_buckets = refresh_all_buckets;
        self
    }

    pub fn executor_threads(mut self, executor_threads: usize) -> Self {
        self.config.executor_threads = executor_threads;
        self
    }

    pub fn response_cache_size(mut self, response_cache_size: usize) -> Self {
        self.config.response_cache_size = response_cache_size;
        self
    }

    /// Set the value store limits.
    pub fn database(mut self, settings: DatabaseSettings) -> Self {
        self.config.database = settings;
        self
    }

    /// Use a custom routing table, whose local id becomes the node id.
    pub fn route_table(mut self, route_table: Arc<dyn RouteTable>) -> Self {
        self.route_table = Some(route_table);
        self
    }

    pub fn host_filter(mut self, host_filter: Arc<dyn HostFilter>) -> Self {
        self.host_filter = Some(host_filter);
        self
    }

    /// Run operations with custom handlers instead of [NetworkHandlers].
    pub fn handlers(mut self, handlers: Arc<dyn HandlerFactory>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Create a Dht node listening on a UDP socket.
    pub fn build(self) -> Result<Dht> {
        let transport = Arc::new(UdpTransport::bind(self.config.bind_address)?);

        let dht = self.build_with_transport(transport.clone())?;

        let context = Arc::downgrade(&dht.0.context);
        let running = dht.0.running.clone();

        thread::Builder::new()
            .name("kadnode-udp".to_string())
            .spawn(move || receive(transport, context, running))?;

        Ok(dht)
    }

    /// Create a Dht node sending through `transport`.
    ///
    /// Received datagrams must be handed to [Context::handle_datagram].
    pub fn build_with_transport(self, transport: Arc<dyn Transport>) -> Result<Dht> {
        let config = self.config;

        let route_table = self.route_table.unwrap_or_else(|| {
            Arc::new(KademliaTable::new(
                config.id.unwrap_or_else(Id::random),
                config.k,
            ))
        });
        let host_filter = self
            .host_filter
            .unwrap_or_else(|| Arc::new(BanList::default()));
        let handlers = self
            .handlers
            .unwrap_or_else(|| Arc::new(NetworkHandlers));

        let context = Arc::new(Context::with_collaborators(
            config,
            transport,
            route_table,
            host_filter,
        )?);

        let ping = Arc::new(PingManager::new(context.clone(), handlers.clone()));
        let lookup = Arc::new(LookupManager::new(context.clone(), handlers.clone()));

        info!(id = %context.local_id(), address = ?context.local_address(), "Dht node started");

        Ok(Dht(Arc::new(Inner {
            bootstrapper: Bootstrapper::new(context.clone(), ping.clone(), lookup.clone()),
            find_value: FindValueManager::new(context.clone(), handlers.clone()),
            store: StoreManager::new(context.clone(), handlers),
            ping,
            lookup,
            context,
            running: Arc::new(AtomicBool::new(true)),
        })))
    }
}

impl Dht {
    /// Create a new Dht node with default configurations.
    pub fn new(config: Config) -> Result<Self> {
        DhtBuilder {
            config,
            ..Default::default()
        }
        .build()
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    pub fn context(&self) -> &Arc<Context> {
        &self.0.context
    }

    pub fn local_contact(&self) -> Contact {
        self.0.context.local_contact()
    }

    /// The local id, which changes if bootstrapping finds another node using it.
    pub fn id(&self) -> Id {
        self.0.context.local_id()
    }

    /// Estimated number of nodes in the network, this one included.
    pub fn size(&self) -> u64 {
        self.0.context.estimated_size()
    }

    /// Returns the address the server is listening to.
    pub fn local_address(&self) -> SocketAddr {
        self.0.context.local_address()
    }

    pub fn route_table(&self) -> &Arc<dyn RouteTable> {
        self.0.context.route_table()
    }

    pub fn database(&self) -> &Arc<ValueStore> {
        self.0.context.database()
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        self.0.context.statistics()
    }

    pub fn ping_manager(&self) -> &PingManager {
        &self.0.ping
    }

    pub fn lookup_manager(&self) -> &LookupManager {
        &self.0.lookup
    }

    pub fn find_value_manager(&self) -> &FindValueManager {
        &self.0.find_value
    }

    pub fn store_manager(&self) -> &StoreManager {
        &self.0.store
    }

    pub fn bootstrapper(&self) -> &Bootstrapper {
        &self.0.bootstrapper
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.0.bootstrapper.is_bootstrapped()
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.0.bootstrapper.is_bootstrapping()
    }

    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::Acquire)
    }

    // === Public Methods ===

    pub fn shutdown(&self) {
        self.0.shutdown();
    }

    pub fn ping(&self, address: SocketAddr) -> DhtFuture<PingResult> {
        self.0.ping.ping(address)
    }

    pub fn ping_contact(&self, contact: &Contact) -> DhtFuture<PingResult> {
        self.0.ping.ping_contact(contact)
    }

    /// Pings `target` as a firewalled node with our inverted id.
    ///
    /// A response from a node with our own id means the id is taken.
    pub fn collision_ping(&self, target: &Contact) -> Result<DhtFuture<PingResult>> {
        let sender = Contact::collision_ping_sender(&self.local_contact());

        self.0.ping.collision_ping(target, sender)
    }

    /// Looks up the nodes closest to `lookup_id`.
    pub fn lookup(&self, lookup_id: Id) -> DhtFuture<LookupResult> {
        self.0.lookup.lookup(lookup_id)
    }

    /// Looks up the values stored under `key` on the network.
    pub fn get(&self, key: Id) -> DhtFuture<ValueResult> {
        self.0.find_value.get(key)
    }

    /// Stores `value` locally under `key`, then on the closest nodes.
    ///
    /// An empty value deletes it.
    pub fn put(&self, key: Id, value: Value) -> DhtFuture<StoreResult> {
        self.0.store.put(key, value)
    }

    /// Publishes an entity as is, without touching the local store.
    pub fn store(&self, entity: ValueEntity) -> DhtFuture<StoreResult> {
        self.0.store.store(entity)
    }

    /// Bootstraps from [Config::bootstrap].
    pub fn bootstrap<L>(&self, listener: L)
    where
        L: BootstrapListener + 'static,
    {
        self.bootstrap_from(self.0.context.config().bootstrap.clone(), listener)
    }

    /// Bootstraps from `hosts`, then from the routing table's contacts.
    pub fn bootstrap_from<L>(&self, hosts: Vec<SocketAddr>, listener: L)
    where
        L: BootstrapListener + 'static,
    {
        self.0.bootstrapper.bootstrap(hosts, Arc::new(listener))
    }

    /// Bootstraps from [Config::bootstrap] and blocks until done.
    ///
    /// Returns `true` if a bootstrap host answered and the self lookup succeeded.
    pub fn bootstrapped(&self) -> bool {
        let (sender, receiver) = flume::unbounded();
        self.bootstrap(sender);

        while let Ok(event) = receiver.recv() {
            match event {
                BootstrapEvent::PhaseOneComplete(_) => {}
                BootstrapEvent::PhaseTwoComplete { .. } => return self.is_bootstrapped(),
                BootstrapEvent::NoBootstrapHost(_) => return false,
            }
        }

        false
    }
}

impl Inner {
    fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.bootstrapper.cancel();
            self.context.announce_shutdown();
            self.context.shutdown();

            debug!(id = %self.context.local_id(), "Dht node shutdown");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive(transport: Arc<UdpTransport>, context: Weak<Context>, running: Arc<AtomicBool>) {
    let mut buf = UdpTransport::buffer();

    while running.load(Ordering::Acquire) {
        match transport.recv_from(&mut buf) {
            Ok(Some((len, from))) => {
                let Some(context) = context.upgrade() else {
                    break;
                };

                context.handle_datagram(from, &buf[..len]);
            }
            Ok(None) => {}
            Err(error) => trace!(?error, "Receive failed"),
        }
    }

    debug!(address = ?transport.local_address(), "Receive loop done");
}

/// Create a testnet of Dht nodes to run tests against instead of the real network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<SocketAddr>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Starts `count` nodes on localhost, all bootstrapped from the first one.
    pub fn new(count: usize) -> Result<Testnet> {
        let mut nodes: Vec<Dht> = Vec::with_capacity(count);
        let mut bootstrap = Vec::new();

        for i in 0..count {
            if i == 0 {
                let node = Dht::builder()
                    .bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
                    .build()?;

                bootstrap.push(node.local_address());
                nodes.push(node);
            } else {
                let node = Dht::builder()
                    .bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
                    .bootstrap(&bootstrap)
                    .build()?;

                node.bootstrapped();
                nodes.push(node);
            }
        }

        Ok(Testnet { bootstrap, nodes })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;

    #[test]
    fn shutdown() {
        let dht = Dht::builder()
            .bind_address("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap();

        let clone = dht.clone();
        assert!(dht.is_running());

        clone.shutdown();

        assert!(!dht.is_running());
        assert_eq!(
            dht.ping("127.0.0.1:1".parse().unwrap()).get(),
            Err(crate::DhtError::Shutdown)
        );
    }

    #[test]
    fn bootstrap_without_hosts() {
        let dht = Dht::builder()
            .bind_address("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap();

        assert!(!dht.bootstrapped());
        assert!(!dht.is_bootstrapping());
    }

    #[test]
    fn ping_over_udp() {
        let testnet = Testnet::new(2).unwrap();
        let a = &testnet.nodes[0];
        let b = &testnet.nodes[1];

        let pong = b.ping(a.local_address()).get().unwrap();

        assert_eq!(pong.contact.id(), &a.id());
        assert_eq!(pong.external_address, b.local_address());
        assert!(a.route_table().closest(&b.id(), 1).iter().any(|c| c.id() == &b.id()));
    }

    #[test]
    fn collision_ping_of_self_is_refused() {
        let dht = Dht::builder()
            .bind_address("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap();

        let local = dht.local_contact();

        assert!(matches!(
            dht.collision_ping(&local),
            Err(Error::InvalidCollisionPing(_))
        ));

        // A sender that is not a collision ping sender
        assert!(matches!(
            dht.ping_manager()
                .collision_ping(&Contact::random("127.0.0.1:1".parse().unwrap()), local),
            Err(Error::InvalidCollisionPing(_))
        ));
    }

    #[test]
    fn put_get_over_udp() {
        let testnet = Testnet::new(5).unwrap();

        let a = Dht::builder()
            .bind_address("127.0.0.1:0".parse().unwrap())
            .bootstrap(&testnet.bootstrap)
            .build()
            .unwrap();
        assert!(a.bootstrapped());

        let b = Dht::builder()
            .bind_address("127.0.0.1:0".parse().unwrap())
            .bootstrap(&testnet.bootstrap)
            .build()
            .unwrap();
        assert!(b.bootstrapped());

        let key = Id::from_data(b"kadnode");

        let stored = a.put(key, Value::text("hello")).get().unwrap();
        assert!(stored.is_stored());
        assert!(a.database().contains(&key, &a.id()));

        let found = b.get(key).get().unwrap();
        assert_eq!(found.entities.len(), 1);
        assert_eq!(found.entities[0].value(), &Value::text("hello"));
        assert_eq!(found.entities[0].creator().id(), &a.id());
    }
}
