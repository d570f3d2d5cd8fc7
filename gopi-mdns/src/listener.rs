use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, trace};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::event::{DnsMessageEvent, Event};
use crate::message::decode;
use shared::TaggedBytesMut;
use shared::error::{Error, Result};

/// Counters kept by a [`Listener`]; readable at any time.
#[derive(Debug, Default)]
pub struct ListenerStats {
    packets: AtomicU64,
    decode_errors: AtomicU64,
    emitted: AtomicU64,
}

impl ListenerStats {
    /// Datagrams taken off the transport.
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Datagrams that failed to decode or broke mDNS header rules.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Messages published on the bus.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

/// Pump from the transport to the bus: decode every datagram and publish it
/// as [`Event::Message`]. Bad packets are counted and skipped.
pub struct Listener {
    bus: EventBus<Event>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub fn new(bus: EventBus<Event>) -> Self {
        Listener {
            bus,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until cancelled, until the transport side closes `inbound`, or
    /// until the bus is closed.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<TaggedBytesMut>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("mdns listener started");
        loop {
            let datagram = tokio::select! {
                _ = cancel.cancelled() => break,
                datagram = inbound.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => break,
                },
            };
            match self.handle(datagram).await {
                Ok(()) => {}
                Err(Error::ErrBusClosed) => {
                    debug!("mdns listener: bus closed");
                    break;
                }
                Err(err) => debug!("mdns listener: {err}"),
            }
        }
        info!(
            "mdns listener stopped: {} packets, {} decode errors, {} emitted",
            self.stats.packets(),
            self.stats.decode_errors(),
            self.stats.emitted()
        );
        Ok(())
    }

    async fn handle(&self, datagram: TaggedBytesMut) -> Result<()> {
        self.stats.packets.fetch_add(1, Ordering::Relaxed);
        let message = match decode(&datagram.message) {
            Ok(message) => message,
            Err(err) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "mdns listener: dropped {} bytes from {} on interface {}: {err}",
                    datagram.message.len(),
                    datagram.transport.peer_addr,
                    datagram.transport.if_index
                );
                return Ok(());
            }
        };
        trace!(
            "mdns listener: {} questions, {} records from {}",
            message.questions.len(),
            message.records().count(),
            datagram.transport.peer_addr
        );

        let event = Event::Message(Arc::new(DnsMessageEvent {
            message,
            if_index: datagram.transport.if_index,
            from: datagram.transport.peer_addr,
        }));
        self.bus.emit(event, false).await?;
        self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
