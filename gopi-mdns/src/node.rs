//! The node runtime: every component wired together over one event bus.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Delivery, EventBus, Subscription};
use crate::cast::{CastDevice, CastManager};
use crate::config::MdnsConfig;
use crate::discovery::{Discovery, QueryError};
use crate::event::Event;
use crate::listener::{Listener, ListenerStats};
use crate::record::{ServiceRecord, is_global_unicast};
use crate::responder::{Responder, ResponderState};
use crate::sink::PacketSink;
#[cfg(not(windows))]
use crate::transport::MulticastTransport;
use shared::TaggedBytesMut;
use shared::error::Result;

struct Task {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Task {
    async fn stop(self) {
        self.cancel.cancel();
        match self.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("{} stopped with error: {err}", self.name),
            Err(err) => warn!("{} task failed: {err}", self.name),
        }
    }
}

struct Tasks {
    listener: Task,
    responder: Task,
    cast: Task,
}

/// A running mDNS node: transport, listener, query engine, responder and
/// cast manager sharing one bus.
///
/// ```rust,ignore
/// use std::time::Duration;
/// use gopi_mdns::{MdnsConfig, MdnsNode, ServiceRecord};
///
/// let node = MdnsNode::start(MdnsConfig::default())?;
/// node.register(vec![ServiceRecord::new("local.", "_gopi._tcp", "TestSvc", "h", 9999)?])?;
/// let found = node.lookup("_gopi._tcp", Duration::from_secs(1)).await?;
/// node.stop().await?;
/// ```
pub struct MdnsNode {
    zone: String,
    bus: EventBus<Event>,
    #[cfg(not(windows))]
    transport: Option<Arc<MulticastTransport>>,
    local_addrs: Vec<IpAddr>,
    stats: Arc<ListenerStats>,
    discovery: Discovery,
    responder: Arc<Responder>,
    cast: Arc<CastManager>,
    cancel: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl MdnsNode {
    /// Binds the multicast sockets and starts every component.
    ///
    /// Must be called from within a tokio runtime.
    #[cfg(not(windows))]
    pub fn start(config: MdnsConfig) -> Result<Self> {
        config.validate()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.bus_capacity);
        let transport = Arc::new(MulticastTransport::bind(&config, inbound_tx)?);
        let mut local_addrs: Vec<IpAddr> = transport
            .interfaces()
            .iter()
            .flat_map(|iface| iface.addrs.iter().copied())
            .filter(is_global_unicast)
            .collect();
        local_addrs.sort();
        local_addrs.dedup();

        let mut node = Self::assemble(config, transport.clone(), inbound_rx)?;
        node.transport = Some(transport);
        node.local_addrs = local_addrs;
        Ok(node)
    }

    /// Starts every component on top of an existing transport: `sink`
    /// carries outbound packets and `inbound` delivers received datagrams.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(
        config: MdnsConfig,
        sink: Arc<dyn PacketSink>,
        inbound: mpsc::Receiver<TaggedBytesMut>,
    ) -> Result<Self> {
        Self::assemble(config, sink, inbound)
    }

    fn assemble(
        config: MdnsConfig,
        sink: Arc<dyn PacketSink>,
        inbound: mpsc::Receiver<TaggedBytesMut>,
    ) -> Result<Self> {
        config.validate()?;
        let zone = config.canonical_zone()?;
        let cancel = CancellationToken::new();
        let bus = EventBus::from_config(&config);

        let listener = Listener::new(bus.clone());
        let stats = listener.stats();
        let discovery = Discovery::new(&config, bus.clone(), sink.clone(), cancel.child_token())?;
        let responder = Arc::new(Responder::new(&config, sink)?);
        let cast = Arc::new(CastManager::new(&config, bus.clone(), discovery.clone())?);

        // Subscribe before anything runs so no early packet is missed.
        let responder_events = bus.subscribe(Delivery::Blocking)?;
        let cast_events = bus.subscribe(Delivery::Blocking)?;

        let listener = {
            let task_cancel = cancel.child_token();
            Task {
                name: "listener",
                cancel: task_cancel.clone(),
                handle: tokio::spawn(listener.run(inbound, task_cancel)),
            }
        };
        let responder_task = {
            let task_cancel = cancel.child_token();
            let responder = Arc::clone(&responder);
            Task {
                name: "responder",
                cancel: task_cancel.clone(),
                handle: tokio::spawn(async move {
                    responder.run(responder_events, task_cancel).await
                }),
            }
        };
        let cast_task = {
            let task_cancel = cancel.child_token();
            let cast = Arc::clone(&cast);
            Task {
                name: "cast manager",
                cancel: task_cancel.clone(),
                handle: tokio::spawn(async move { cast.run(cast_events, task_cancel).await }),
            }
        };

        info!("mdns node started in zone {zone}");
        Ok(MdnsNode {
            zone,
            bus,
            #[cfg(not(windows))]
            transport: None,
            local_addrs: vec![],
            stats,
            discovery,
            responder,
            cast,
            cancel,
            tasks: Mutex::new(Some(Tasks {
                listener,
                responder: responder_task,
                cast: cast_task,
            })),
        })
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Global unicast addresses of the bound interfaces.
    pub fn local_addrs(&self) -> &[IpAddr] {
        &self.local_addrs
    }

    pub fn bus(&self) -> &EventBus<Event> {
        &self.bus
    }

    /// Subscribes to every event of the node. The handle must be dropped
    /// before [`MdnsNode::stop`] can complete.
    pub fn subscribe(&self, delivery: Delivery) -> Result<Subscription<Event>> {
        self.bus.subscribe(delivery)
    }

    pub fn listener_stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    pub fn responder_state(&self) -> Result<ResponderState> {
        self.responder.state()
    }

    /// Replaces the registered services and announces them. Records without
    /// addresses get the node's own addresses.
    pub fn register(&self, records: Vec<ServiceRecord>) -> Result<()> {
        let records = records
            .into_iter()
            .map(|record| {
                if record.addrs.is_empty() {
                    record.with_addrs(self.local_addrs.iter().copied())
                } else {
                    record
                }
            })
            .collect();
        self.responder.register(records)
    }

    /// Withdraws every registered service.
    pub fn deregister(&self) -> Result<()> {
        self.responder.deregister()
    }

    pub async fn enumerate_services(
        &self,
        deadline: Duration,
    ) -> std::result::Result<Vec<ServiceRecord>, QueryError> {
        self.discovery.enumerate_services(deadline).await
    }

    pub async fn lookup(
        &self,
        service: &str,
        deadline: Duration,
    ) -> std::result::Result<Vec<ServiceRecord>, QueryError> {
        self.discovery.lookup(service, deadline).await
    }

    pub fn cast(&self) -> &CastManager {
        &self.cast
    }

    pub async fn cast_devices(
        &self,
        deadline: Duration,
    ) -> std::result::Result<Vec<CastDevice>, QueryError> {
        self.cast.devices(deadline).await
    }

    /// Shuts the node down: cast manager, responder (which sends its
    /// goodbyes), outstanding queries, listener, bus, then transport.
    /// Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(tasks) = self.tasks.lock()?.take() else {
            return Ok(());
        };
        info!("mdns node stopping");

        tasks.cast.stop().await;
        tasks.responder.stop().await;
        self.discovery.shutdown().await;
        tasks.listener.stop().await;
        self.bus.close().await?;
        self.close_transport().await?;
        self.cancel.cancel();

        info!("mdns node stopped");
        Ok(())
    }

    #[cfg(not(windows))]
    async fn close_transport(&self) -> Result<()> {
        match &self.transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    #[cfg(windows)]
    async fn close_transport(&self) -> Result<()> {
        Ok(())
    }
}

impl Drop for MdnsNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
