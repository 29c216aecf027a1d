mod common;

use common::{Network, TIMEOUT};
use kadnode::manager::BootstrapEvent;
use kadnode::statistics::NetworkStatistics;
use kadnode::Dht;

fn events(dht: &Dht, hosts: Vec<std::net::SocketAddr>) -> Vec<BootstrapEvent> {
    let (sender, receiver) = flume::unbounded();
    dht.bootstrap_from(hosts, sender);

    let mut events = Vec::new();
    while let Ok(event) = receiver.recv_timeout(TIMEOUT) {
        let done = !matches!(event, BootstrapEvent::PhaseOneComplete(_));
        events.push(event);
        if done {
            break;
        }
    }

    events
}

#[test]
fn nothing_to_bootstrap_from() {
    let network = Network::new();
    let node = network.node();

    assert_eq!(
        events(&node, vec![]),
        vec![BootstrapEvent::NoBootstrapHost(vec![])]
    );
    assert!(!node.is_bootstrapped());
    assert!(!node.is_bootstrapping());
}

#[test]
fn first_answering_host_is_enough() {
    let network = Network::new();
    let first = network.node();
    let second = network.node();
    let node = network.node();

    let events = events(&node, vec![first.local_address(), second.local_address()]);

    assert!(matches!(events[0], BootstrapEvent::PhaseOneComplete(_)));
    assert!(matches!(
        events[1],
        BootstrapEvent::PhaseTwoComplete { .. }
    ));
    assert!(node.is_bootstrapped());
    assert!(node.bootstrapper().time().is_some());

    // Never pinged, and unknown to the first host so no lookup reached it either
    assert_eq!(network.sent_to(second.local_address()), 0);
}

#[test]
fn dead_hosts_are_skipped() {
    let network = Network::new();
    let dead = network.address();
    let alive = network.node();
    let node = network.node();

    let events = events(&node, vec![dead, alive.local_address()]);

    assert!(matches!(
        events.last(),
        Some(BootstrapEvent::PhaseTwoComplete { .. })
    ));
    assert!(node.is_bootstrapped());
    assert_eq!(network.sent_to(dead), 1);
    assert_eq!(
        NetworkStatistics::get(&node.statistics().bootstrap_ping_failures),
        1
    );
    assert!(node
        .route_table()
        .contacts()
        .iter()
        .any(|contact| contact.id() == &alive.id()));
}

#[test]
fn every_host_dead() {
    let network = Network::new();
    let dead = vec![network.address(), network.address()];
    let node = network.node();

    assert_eq!(
        events(&node, dead.clone()),
        vec![BootstrapEvent::NoBootstrapHost(dead)]
    );
    assert!(!node.is_bootstrapped());
}

#[test]
fn network_grows_through_bootstrap() {
    let network = Network::new();
    let nodes = network.nodes(8);

    // Later nodes learned about earlier ones through their self lookups
    let last = nodes.last().unwrap();
    assert!(last.route_table().len() >= 2);

    let first = &nodes[0];
    assert_eq!(first.route_table().len(), nodes.len() - 1);
}
