//! Integration tests for gopi-mdns
//!
//! Several nodes are wired to an in-memory multicast segment: every packet a
//! node sends is delivered to every other node, tagged with the receiving
//! node's interface index. No sockets are involved.

use bytes::BytesMut;
use gopi_mdns::message::{
    DNSCLASS_INET, DnsClass, DnsType, Header, Message, Name, PtrResource, Question, Resource,
    decode, encode,
};
use gopi_mdns::{
    CastFlags, CastEvent, Delivery, DnsMessageEvent, Event, MdnsConfig, MdnsNode, PacketSink,
    Query, ServiceRecord, Subscription, quote, unquote,
};
use sansio::Protocol;
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// One packet as it left a node.
#[derive(Debug, Clone)]
struct Sent {
    from: usize,
    if_index: u32,
    payload: Vec<u8>,
}

impl Sent {
    fn message(&self) -> Message {
        decode(&self.payload).unwrap()
    }
}

struct Port {
    addr: SocketAddr,
    if_index: u32,
    inbound: mpsc::Sender<TaggedBytesMut>,
}

/// An in-memory link shared by every attached node.
#[derive(Default)]
struct LoopbackNetwork {
    ports: Mutex<Vec<Port>>,
    sent: Mutex<Vec<Sent>>,
}

impl LoopbackNetwork {
    /// Starts a node attached to the link. Packets reach it tagged with
    /// `if_index`.
    fn attach(self: &Arc<Self>, if_index: u32, config: MdnsConfig) -> Result<MdnsNode> {
        let (tx, rx) = mpsc::channel(256);
        let mut ports = self.ports.lock()?;
        let port = ports.len();
        ports.push(Port {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10 + port as u8)), 5353),
            if_index,
            inbound: tx,
        });
        drop(ports);

        let sink = Arc::new(Endpoint {
            network: Arc::clone(self),
            port,
        });
        MdnsNode::with_transport(config, sink, rx)
    }

    /// Delivers a raw payload to one node as if it came from `from`.
    fn inject(&self, port: usize, from: SocketAddr, payload: &[u8]) -> Result<()> {
        let ports = self.ports.lock()?;
        let port = &ports[port];
        port.inbound
            .try_send(TaggedBytesMut {
                now: Instant::now(),
                transport: TransportContext {
                    local_addr: port.addr,
                    peer_addr: from,
                    if_index: port.if_index,
                },
                message: BytesMut::from(payload),
            })
            .map_err(|err| Error::Other(err.to_string()))
    }

    /// Packets sent by `port` so far.
    fn sent_by(&self, port: usize) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|sent| sent.from == port)
            .cloned()
            .collect()
    }
}

struct Endpoint {
    network: Arc<LoopbackNetwork>,
    port: usize,
}

impl PacketSink for Endpoint {
    fn send(&self, payload: &[u8], if_index: u32) -> Result<()> {
        decode(payload)?;
        self.network.sent.lock()?.push(Sent {
            from: self.port,
            if_index,
            payload: payload.to_vec(),
        });

        let ports = self.network.ports.lock()?;
        let from = ports[self.port].addr;
        for (i, port) in ports.iter().enumerate() {
            if i == self.port {
                continue;
            }
            let _ = port.inbound.try_send(TaggedBytesMut {
                now: Instant::now(),
                transport: TransportContext {
                    local_addr: port.addr,
                    peer_addr: from,
                    if_index: port.if_index,
                },
                message: BytesMut::from(payload),
            });
        }
        Ok(())
    }
}

fn config() -> MdnsConfig {
    MdnsConfig::default().with_bus_capacity(256)
}

fn test_service() -> ServiceRecord {
    ServiceRecord::new("local.", "_gopi._tcp", "TestSvc", "h.local.", 9999)
        .unwrap()
        .with_addrs([IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))])
}

fn cast_service(app: &str, state: &str) -> ServiceRecord {
    ServiceRecord::new("local.", "_googlecast._tcp", "Chromecast-X", "cc", 8009)
        .unwrap()
        .with_txt([
            "id=X".to_owned(),
            "fn=Kitchen".to_owned(),
            "md=Chromecast".to_owned(),
            format!("rs={app}"),
            format!("st={state}"),
        ])
        .with_addrs([IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40))])
}

fn ptr_question(name: &str, class: DnsClass) -> Vec<u8> {
    let mut msg = Message {
        questions: vec![Question {
            name: Name::new(name).unwrap(),
            typ: DnsType::Ptr,
            class,
        }],
        ..Default::default()
    };
    encode(&mut msg).unwrap()
}

async fn next_cast(events: &Subscription<Event>) -> CastEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Event::Cast(cast) = events.recv().await.unwrap() {
                return cast;
            }
        }
    })
    .await
    .expect("cast event")
}

#[tokio::test(start_paused = true)]
async fn test_enumerate_services_without_responders() -> Result<()> {
    let network = Arc::new(LoopbackNetwork::default());
    let node = network.attach(2, config())?;

    let started = tokio::time::Instant::now();
    let records = node
        .enumerate_services(Duration::from_millis(500))
        .await
        .unwrap();
    assert!(records.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(500));

    let sent = network.sent_by(0);
    assert_eq!(sent.len(), 3);
    for packet in &sent {
        let message = packet.message();
        assert!(!message.header.response);
        assert_eq!(message.questions.len(), 1);
        let question = &message.questions[0];
        assert_eq!(question.name.data, "_services._dns-sd._udp.local.");
        assert_eq!(question.typ, DnsType::Ptr);
        assert!(!question.unicast_response());
    }

    node.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_register_and_lookup_round_trip() -> Result<()> {
    let network = Arc::new(LoopbackNetwork::default());
    let a = network.attach(2, config())?;
    let b = network.attach(3, config())?;

    a.register(vec![test_service()])?;

    let records = b
        .lookup("_gopi._tcp.local.", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.instance, "TestSvc._gopi._tcp.local.");
    assert_eq!(record.service, "_gopi._tcp.local.");
    assert_eq!(record.host, "h.local.");
    assert_eq!(record.port, 9999);
    assert_eq!(record.addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))]);
    assert_eq!(record.if_index, 3);

    // Every answer went back out on the interface the question came from.
    let answers: Vec<Sent> = network
        .sent_by(0)
        .into_iter()
        .filter(|sent| sent.if_index != 0)
        .collect();
    assert!(!answers.is_empty());
    assert!(answers.iter().all(|sent| sent.if_index == 2));

    a.deregister()?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let records = b
        .lookup("_gopi._tcp.local.", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(records.is_empty());

    b.stop().await?;
    a.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_enumerate_services_finds_registered_types() -> Result<()> {
    let network = Arc::new(LoopbackNetwork::default());
    let a = network.attach(2, config())?;
    let b = network.attach(3, config())?;

    a.register(vec![test_service(), cast_service("", "0")])?;

    let records = b
        .enumerate_services(Duration::from_millis(500))
        .await
        .unwrap();
    let mut types: Vec<&str> = records.iter().map(|r| r.instance.as_str()).collect();
    types.sort();
    assert_eq!(types, vec!["_googlecast._tcp.local.", "_gopi._tcp.local."]);

    b.stop().await?;
    a.stop().await?;
    Ok(())
}

#[test]
fn test_quote_corner_cases() {
    assert_eq!(quote("Not\\"), "Not\\\\");
    assert_eq!(quote("a b"), "a\\ b");
    assert_eq!(quote("Test's Test"), "Test\\039s\\ Test");
    assert_eq!(unquote("Test\\039s\\ Test").unwrap(), "Test's Test");
    assert!(matches!(unquote("Not\\"), Err(Error::ErrParse(_))));
}

#[tokio::test(start_paused = true)]
async fn test_cast_discovery_then_app_change() -> Result<()> {
    let network = Arc::new(LoopbackNetwork::default());
    let device = network.attach(2, config())?;
    let watcher = network.attach(3, config())?;
    let events = watcher.subscribe(Delivery::Blocking)?;

    device.register(vec![cast_service("", "0")])?;
    let devices = watcher.cast_devices(Duration::from_millis(500)).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "X");
    assert_eq!(devices[0].name, "Kitchen");

    let first = next_cast(&events).await;
    assert_eq!(first.flags, CastFlags::DISCOVERY);
    assert_eq!(first.device.app, "");

    device.register(vec![cast_service("YouTube", "1")])?;
    let devices = watcher.cast_devices(Duration::from_millis(500)).await.unwrap();
    assert_eq!(devices[0].app, "YouTube");
    assert_eq!(devices[0].state, 1);

    let second = next_cast(&events).await;
    assert_eq!(second.flags, CastFlags::APP);
    assert_eq!(second.device.app, "YouTube");

    drop(events);
    watcher.stop().await?;
    device.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_malformed_packet_is_counted_and_skipped() -> Result<()> {
    let network = Arc::new(LoopbackNetwork::default());
    let node = network.attach(2, config())?;
    let events = node.subscribe(Delivery::DropOldest)?;
    let peer: SocketAddr = "192.168.1.99:5353".parse().unwrap();

    network.inject(0, peer, &[0xff, 0xff])?;
    network.inject(0, peer, &ptr_question("_gopi._tcp.local.", DNSCLASS_INET))?;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let stats = node.listener_stats();
    assert_eq!(stats.packets(), 2);
    assert_eq!(stats.decode_errors(), 1);
    assert_eq!(stats.emitted(), 1);

    match events.try_recv() {
        Some(Event::Message(msg)) => {
            assert_eq!(msg.from, peer);
            assert_eq!(msg.if_index, 2);
            assert_eq!(msg.message.questions[0].name.data, "_gopi._tcp.local.");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(events.try_recv().is_none());

    drop(events);
    node.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unicast_question_is_not_answered() -> Result<()> {
    let network = Arc::new(LoopbackNetwork::default());
    let node = network.attach(4, config())?;
    node.register(vec![test_service()])?;
    let announced = network.sent_by(0).len();
    let peer: SocketAddr = "192.168.1.99:5353".parse().unwrap();

    let unicast = DnsClass(DNSCLASS_INET.0 | 0x8000);
    network.inject(0, peer, &ptr_question("_gopi._tcp.local.", unicast))?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(node.listener_stats().emitted(), 1);
    assert_eq!(network.sent_by(0).len(), announced);

    // The same question asking for a multicast answer is served.
    network.inject(0, peer, &ptr_question("_gopi._tcp.local.", DNSCLASS_INET))?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let sent = network.sent_by(0);
    assert_eq!(sent.len(), announced + 1);
    assert_eq!(sent[announced].if_index, 4);
    let answer = sent[announced].message();
    assert!(answer.header.response);
    assert_eq!(answer.answers[0].header.typ, DnsType::Ptr);

    node.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_withdraws_registered_services() -> Result<()> {
    let network = Arc::new(LoopbackNetwork::default());
    let node = network.attach(2, config())?;
    node.register(vec![test_service()])?;

    node.stop().await?;
    node.stop().await?;

    let last = network.sent_by(0).pop().unwrap().message();
    assert!(last.header.response);
    assert_eq!(last.answers.len(), 1);
    assert_eq!(last.answers[0].header.ttl, 0);
    assert_eq!(last.answers[0].header.name.data, "_gopi._tcp.local.");
    Ok(())
}

#[test]
fn test_query_driven_by_hand() -> Result<()> {
    let now = Instant::now();
    let mut query = Query::new(
        "_gopi._tcp.local.",
        "local.",
        &MdnsConfig::default(),
        now,
        now + Duration::from_secs(1),
    )?;
    let packet = query.poll_write().unwrap();
    assert_eq!(packet.transport.peer_addr.to_string(), "224.0.0.251:5353");
    assert_eq!(decode(&packet.message)?.questions[0].typ, DnsType::Ptr);

    let answer = Message {
        header: Header {
            response: true,
            authoritative: true,
            ..Default::default()
        },
        answers: vec![Resource::new(
            Name::new("_gopi._tcp.local.")?,
            120,
            Box::new(PtrResource {
                ptr: Name::new("TestSvc._gopi._tcp.local.")?,
            }),
        )],
        ..Default::default()
    };
    query.handle_read(Arc::new(DnsMessageEvent {
        message: answer,
        if_index: 2,
        from: "192.168.1.10:5353".parse().unwrap(),
    }))?;
    let record = query.poll_event().unwrap();
    assert_eq!(record.instance, "TestSvc._gopi._tcp.local.");
    assert_eq!(record.if_index, 2);

    query.handle_timeout(now + Duration::from_secs(1))?;
    assert!(query.is_done());
    assert_eq!(query.poll_timeout(), None);
    assert_eq!(query.records().len(), 1);
    Ok(())
}
