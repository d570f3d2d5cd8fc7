//! mDNS Register Example
//!
//! Registers one service instance, answers questions for it until Ctrl-C,
//! then withdraws it with a goodbye.
//!
//! # Usage
//!
//! ```
//! cargo run --package gopi-mdns --example mdns_register -- --name "Test Service" --port 9999
//! ```
//!
//! Then browse for it from another terminal:
//! ```
//! cargo run --package gopi-mdns --example mdns_browse -- --service _gopi._tcp
//! ```

use clap::Parser;
use gopi_mdns::{MdnsConfig, MdnsNode, ServiceRecord};

#[derive(Parser, Debug)]
#[command(name = "mDNS Register")]
#[command(version = "0.1.0")]
#[command(about = "Register a DNS-SD service with gopi-mdns")]
struct Args {
    /// Service type
    #[arg(long, default_value = "_gopi._tcp")]
    service: String,

    /// Instance name; any UTF-8 text
    #[arg(long, default_value = "Test Service")]
    name: String,

    /// Host name the SRV record points at
    #[arg(long, default_value = "gopi")]
    host: String,

    /// Service port
    #[arg(long, default_value = "9999")]
    port: u16,

    /// TXT entries, key=value
    #[arg(long)]
    txt: Vec<String>,

    /// Domain to register in
    #[arg(long, default_value = "local.")]
    zone: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let node = MdnsNode::start(MdnsConfig::default().with_zone(args.zone.clone()))?;
    let record = ServiceRecord::new(node.zone(), &args.service, &args.name, &args.host, args.port)?
        .with_txt(args.txt);
    log::info!("Registering {record}");
    node.register(vec![record])?;
    log::info!("Responder is {}; press Ctrl-C to stop", node.responder_state()?);

    tokio::signal::ctrl_c().await?;

    log::info!("Withdrawing");
    node.stop().await?;
    Ok(())
}
