use std::time::Duration;

use clap::Parser;
use kadnode::{Address, Contact, Dht, NodeEvent};
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
/// Run a standalone Kademlia node.
struct Cli {
    /// UDP port to listen on, random if omitted
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Hostname other nodes should reach this node at, requires --port
    #[arg(long)]
    hostname: Option<String>,

    /// Contacts to join through, as `idHex@hostname:port`
    #[arg(short, long)]
    bootstrap: Vec<Contact>,

    /// Seconds between status reports
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Log every message
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::TRACE
        } else {
            Level::INFO
        })
        .with_thread_names(true)
        .init();

    let mut builder = Dht::builder();
    builder.port(cli.port);

    if let Some(hostname) = cli.hostname {
        builder.address(Address::new(hostname, cli.port));
    }

    let dht = builder.build().expect("Failed to create Dht node");

    run(dht, cli.bootstrap, cli.interval)
}

fn run(dht: Dht, bootstrap: Vec<Contact>, interval: u64) {
    let contact = dht.contact().expect("Dht was shutdown");
    info!("Listening as {contact}");

    let events = dht.subscribe().expect("Dht was shutdown");

    for seed in bootstrap {
        match dht.join(seed.clone()) {
            Ok(()) => info!("Joined through {seed}"),
            Err(error) => info!("Failed to join through {seed}: {error}"),
        }
    }

    let (tx_interrupted, rx_interrupted) = flume::bounded::<()>(1);

    ctrlc::set_handler(move || {
        println!();
        println!("Received Ctrl+C! Shutting down...");
        let _ = tx_interrupted.send(());
    })
    .expect("Error setting Ctrl-C handler");

    loop {
        if rx_interrupted
            .recv_timeout(Duration::from_secs(interval))
            .is_ok()
        {
            break;
        }

        for event in events.try_iter() {
            if let NodeEvent::Error(error) = event {
                info!("Node error: {error}");
            }
        }

        let info = dht.info().expect("Dht was shutdown");

        info!("=== Kadnode Status ===");
        info!("Id: {}", info.id());
        info!("Address: {}", info.address());
        info!("Routing table: {} contacts", info.routing_table_size());
        info!("Pending calls: {}", info.pending_calls());
        info!("Stored items: {}", info.stored_items());
    }

    let bootstrap = dht.to_bootstrap().expect("Dht was shutdown");

    let mut dht = dht;
    dht.shutdown();

    println!("Known contacts, to bootstrap from next time:");
    for contact in bootstrap {
        println!("   {contact}");
    }
}
