//! Chromecast Discovery Example
//!
//! Looks up `_googlecast._tcp` devices, prints what is found and keeps
//! reporting changes (new devices, renames, app switches) until Ctrl-C.
//!
//! # Usage
//!
//! ```
//! cargo run --package gopi-mdns --example cast_discover
//! ```
//!
//! Print the device list once and exit:
//! ```
//! cargo run --package gopi-mdns --example cast_discover -- --once
//! ```

use std::time::Duration;

use clap::Parser;
use gopi_mdns::{CastFlags, Delivery, Event, MdnsConfig, MdnsNode};

#[derive(Parser, Debug)]
#[command(name = "Cast Discover")]
#[command(version = "0.1.0")]
#[command(about = "Discover Chromecast devices with gopi-mdns")]
struct Args {
    /// Restrict to one network interface
    #[arg(long)]
    interface: Option<String>,

    /// How long each lookup collects answers, in milliseconds
    #[arg(long, default_value = "2000")]
    timeout: u64,

    /// Seconds between lookups while watching
    #[arg(long, default_value = "30")]
    interval: u64,

    /// Print the devices once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = MdnsConfig::default();
    if let Some(interface) = args.interface {
        config = config.with_interface(interface);
    }
    let node = MdnsNode::start(config)?;
    let deadline = Duration::from_millis(args.timeout);

    if args.once {
        let devices = node.cast_devices(deadline).await?;
        for device in &devices {
            println!("{device:#?}");
        }
        log::info!("{} device(s)", devices.len());
        node.stop().await?;
        return Ok(());
    }

    let events = node.subscribe(Delivery::DropOldest)?;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if let Err(err) = node.cast_devices(deadline).await {
                    log::warn!("cast lookup failed: {}", err.error);
                }
            }
            event = events.recv() => match event {
                Ok(Event::Cast(cast)) => {
                    if cast.flags.contains(CastFlags::REMOVED) {
                        println!("- {}", cast.device);
                    } else if cast.flags.contains(CastFlags::DISCOVERY) {
                        println!("+ {}", cast.device);
                    } else {
                        println!("~ {} ({:?})", cast.device, cast.flags);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!("event bus: {err}");
                    break;
                }
            },
        }
    }

    drop(events);
    node.stop().await?;
    Ok(())
}
