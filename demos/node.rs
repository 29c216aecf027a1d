use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use kadnode::manager::BootstrapEvent;
use kadnode::{Dht, Id, Value};

use clap::Parser;

use tracing::{info, Level};
use tracing_subscriber;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,
    /// Nodes to bootstrap from
    #[arg(long)]
    bootstrap: Vec<SocketAddr>,
    /// Store this value under the key, after bootstrapping
    #[arg(long, requires = "key")]
    put: Option<String>,
    /// Key to look up, hashed into an id
    #[arg(long)]
    key: Option<String>,
    /// Keep running and print statistics this often, in seconds
    #[arg(long)]
    stats: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let dht = Dht::builder()
        .bind_address(cli.bind)
        .bootstrap(&cli.bootstrap)
        .build()
        .expect("Failed to create DHT node");

    info!(id = %dht.id(), address = ?dht.local_address(), "Node is running");

    let (sender, events) = flume::unbounded();
    dht.bootstrap(sender);

    for event in events.iter() {
        match event {
            BootstrapEvent::PhaseOneComplete(elapsed) => {
                println!("Self lookup done in {:?}", elapsed)
            }
            BootstrapEvent::PhaseTwoComplete {
                found_new_nodes,
                elapsed,
            } => {
                println!(
                    "Bootstrapped in {:?}, found new nodes: {}",
                    elapsed, found_new_nodes
                );
                break;
            }
            BootstrapEvent::NoBootstrapHost(failed) => {
                println!("No bootstrap host answered, tried: {:?}", failed);
                break;
            }
        }
    }

    println!("Routing table: {} contacts", dht.route_table().len());

    if let Some(key) = cli.key.as_deref() {
        let key = Id::from_data(key);

        if let Some(value) = cli.put {
            put(&dht, key, value);
        }

        get(&dht, key);
    }

    if let Some(interval) = cli.stats {
        loop {
            thread::sleep(Duration::from_secs(interval));

            println!("\n=== Statistics ===\n{}", dht.statistics());
            println!(
                "values: {}, keys: {}",
                dht.database().value_count(),
                dht.database().key_count()
            );
        }
    }
}

fn put(dht: &Dht, key: Id, value: String) {
    let start = Instant::now();

    match dht.put(key, Value::text(value)).get() {
        Ok(result) => {
            println!(
                "Stored {} at {} nodes in {:?}",
                key,
                result.locations.len(),
                start.elapsed()
            );
            for contact in result.locations {
                println!("   {:?}", contact);
            }
        }
        Err(error) => println!("Store failed: {}", error),
    }
}

fn get(dht: &Dht, key: Id) {
    let start = Instant::now();

    match dht.get(key).get() {
        Ok(result) if result.entities.is_empty() => {
            println!("Nothing stored under {} ({:?})", key, start.elapsed())
        }
        Ok(result) => {
            println!(
                "Found {} values under {} in {:?}, request load {:.2}",
                result.entities.len(),
                key,
                start.elapsed(),
                result.request_load
            );
            for entity in result.entities {
                println!("   {:?}", entity);
            }
        }
        Err(error) => println!("Lookup failed: {}", error),
    }
}
