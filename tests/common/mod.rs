//! In-memory network of nodes, datagrams delivered by a single thread.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use flume::Sender;
use kadnode::io::Transport;
use kadnode::{Context, Dht, DhtBuilder};

pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(300);
pub const TIMEOUT: Duration = Duration::from_secs(10);

type Datagram = (SocketAddr, SocketAddr, Vec<u8>);

#[derive(Debug, Default)]
struct Registry {
    nodes: HashMap<SocketAddr, Weak<Context>>,
    /// Datagrams sent to each address, delivered or not.
    sent: HashMap<SocketAddr, usize>,
    offline: HashSet<SocketAddr>,
    next_host: u16,
}

#[derive(Debug, Clone)]
pub struct Network {
    registry: Arc<Mutex<Registry>>,
    datagrams: Sender<Datagram>,
}

#[derive(Debug)]
struct MemoryTransport {
    address: SocketAddr,
    network: Network,
}

impl Transport for MemoryTransport {
    fn send_to(&self, to: SocketAddr, bytes: &[u8]) -> io::Result<()> {
        {
            let mut registry = self.network.registry.lock().unwrap();
            *registry.sent.entry(to).or_default() += 1;
        }

        self.network
            .datagrams
            .send((self.address, to, bytes.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "network is down"))
    }

    fn local_address(&self) -> SocketAddr {
        self.address
    }
}

impl Network {
    pub fn new() -> Network {
        let (datagrams, receiver) = flume::unbounded::<Datagram>();
        let registry = Arc::new(Mutex::new(Registry::default()));

        let weak = Arc::downgrade(&registry);
        thread::spawn(move || {
            while let Ok((from, to, bytes)) = receiver.recv() {
                let Some(registry) = weak.upgrade() else {
                    break;
                };

                let target = {
                    let registry = registry.lock().unwrap();
                    if registry.offline.contains(&to) || registry.offline.contains(&from) {
                        None
                    } else {
                        registry.nodes.get(&to).and_then(Weak::upgrade)
                    }
                };

                if let Some(context) = target {
                    context.handle_datagram(from, &bytes);
                }
            }
        });

        Network {
            registry,
            datagrams,
        }
    }

    /// A fresh address, each on its own host.
    pub fn address(&self) -> SocketAddr {
        let mut registry = self.registry.lock().unwrap();
        registry.next_host += 1;

        let host = registry.next_host;
        SocketAddr::from(([10, 0, (host >> 8) as u8, host as u8], 6881))
    }

    pub fn builder() -> DhtBuilder {
        Dht::builder()
            .request_timeout(REQUEST_TIMEOUT)
            .executor_threads(4)
    }

    pub fn node(&self) -> Dht {
        self.node_with(Self::builder())
    }

    pub fn node_with(&self, builder: DhtBuilder) -> Dht {
        let address = self.address();
        let transport = Arc::new(MemoryTransport {
            address,
            network: self.clone(),
        });

        let dht = builder.build_with_transport(transport).unwrap();

        self.registry
            .lock()
            .unwrap()
            .nodes
            .insert(address, Arc::downgrade(dht.context()));

        dht
    }

    /// `count` nodes, each bootstrapped from the first.
    pub fn nodes(&self, count: usize) -> Vec<Dht> {
        let first = self.node();
        let bootstrap = [first.local_address()];

        let mut nodes = vec![first];
        for _ in 1..count {
            let node = self.node_with(Self::builder().bootstrap(&bootstrap));
            assert!(node.bootstrapped());
            nodes.push(node);
        }

        nodes
    }

    /// Drops every datagram to and from `address`.
    pub fn set_offline(&self, address: SocketAddr) {
        self.registry.lock().unwrap().offline.insert(address);
    }

    pub fn sent_to(&self, address: SocketAddr) -> usize {
        self.registry
            .lock()
            .unwrap()
            .sent
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Delivers raw bytes, as if `from` sent them.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
        self.datagrams.send((from, to, bytes)).unwrap();
    }
}
