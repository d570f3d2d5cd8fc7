//! mDNS Browse Example
//!
//! Lists the service types announced on the local network, or the instances
//! of one service type.
//!
//! # Usage
//!
//! Enumerate service types:
//! ```
//! cargo run --package gopi-mdns --example mdns_browse
//! ```
//!
//! Look up one service type:
//! ```
//! cargo run --package gopi-mdns --example mdns_browse -- --service _googlecast._tcp
//! ```

use std::time::Duration;

use clap::Parser;
use gopi_mdns::{Delivery, Event, MdnsConfig, MdnsNode};

#[derive(Parser, Debug)]
#[command(name = "mDNS Browse")]
#[command(version = "0.1.0")]
#[command(about = "Browse DNS-SD services with gopi-mdns")]
struct Args {
    /// Service type to look up, e.g. _http._tcp; enumerates types when omitted
    #[arg(long)]
    service: Option<String>,

    /// Domain to browse in
    #[arg(long, default_value = "local.")]
    zone: String,

    /// Restrict to one network interface
    #[arg(long)]
    interface: Option<String>,

    /// How long to collect answers, in milliseconds
    #[arg(long, default_value = "2000")]
    timeout: u64,

    /// Also print every decoded packet
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = MdnsConfig::default().with_zone(args.zone);
    if let Some(interface) = args.interface {
        config = config.with_interface(interface);
    }
    let node = MdnsNode::start(config)?;
    log::info!("Bound on {:?} in zone {}", node.local_addrs(), node.zone());

    let tracer = if args.verbose {
        let events = node.subscribe(Delivery::DropOldest)?;
        Some(tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let Event::Message(msg) = event {
                    log::info!("packet from {} on interface {}", msg.from, msg.if_index);
                    log::info!("{}", msg.message);
                }
            }
        }))
    } else {
        None
    };

    let deadline = Duration::from_millis(args.timeout);
    let result = match &args.service {
        Some(service) => {
            log::info!("Looking up {service} for {}ms", args.timeout);
            node.lookup(service, deadline).await
        }
        None => {
            log::info!("Enumerating service types for {}ms", args.timeout);
            node.enumerate_services(deadline).await
        }
    };

    let records = match result {
        Ok(records) => records,
        Err(err) => {
            log::warn!("Browse ended early: {}", err.error);
            err.partial
        }
    };
    for record in &records {
        match args.service {
            Some(_) => println!("{record}"),
            None => println!("{}", record.instance),
        }
    }
    log::info!("{} result(s)", records.len());

    if let Some(tracer) = tracer {
        tracer.abort();
        let _ = tracer.await;
    }
    node.stop().await?;
    Ok(())
}
