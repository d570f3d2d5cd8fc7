//! Query engine: DNS-SD browsing over the event bus.
//!
//! [`Query`] is the sans-I/O core. It owns the retransmission schedule, the
//! deadline and the reassembly of per-instance [`ServiceRecord`]s from the
//! PTR, SRV, TXT, A and AAAA records of incoming responses. [`Discovery`]
//! drives one `Query` per call: it moves packets to a [`PacketSink`],
//! messages from the bus into the query and timers through tokio.


use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, trace, warn};
use sansio::Protocol;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bus::{Delivery, EventBus};
use crate::config::{MDNS_MULTICAST_IPV4, MdnsConfig};
use crate::event::{DnsMessageEvent, Event};
use crate::message::name::has_name_suffix;
use crate::message::{DNSCLASS_INET, DnsType, Header, Message, Name, Question, encode};
use crate::record::{SERVICE_TYPE_ENUMERATION, ServiceRecord, is_global_unicast, qualify_service};
use crate::sink::PacketSink;
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportMessage};

type RecordKey = (String, String);

/// A failed query, with whatever had been collected before the failure.
#[derive(Debug, PartialEq)]
pub struct QueryError {
    pub partial: Vec<ServiceRecord>,
    pub error: Error,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} record(s) collected)",
            self.error,
            self.partial.len()
        )
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<Error> for QueryError {
    fn from(error: Error) -> Self {
        QueryError {
            partial: vec![],
            error,
        }
    }
}

/// One in-flight PTR query.
///
/// The first packet is queued on construction; the remaining sends happen at
/// `start + c * backoff` for each retransmission `c`, as long as they fall
/// before the deadline. Only responses are read, and only records under the
/// zone are kept.
pub struct Query {
    name: String,
    zone: String,
    port: u16,
    retransmit: usize,
    backoff: Duration,
    start: Instant,
    deadline: Instant,
    sent: usize,
    records: Vec<ServiceRecord>,
    latest: Option<RecordKey>,
    delivered: HashMap<RecordKey, ServiceRecord>,
    write_outs: VecDeque<TaggedBytesMut>,
    event_outs: VecDeque<ServiceRecord>,
    done: bool,
}

impl Query {
    /// Starts a query for `name`, a fully qualified name under `zone`.
    pub fn new(
        name: &str,
        zone: &str,
        config: &MdnsConfig,
        now: Instant,
        deadline: Instant,
    ) -> Result<Self> {
        Name::new(name)?;
        if !has_name_suffix(name, zone) {
            return Err(Error::ErrBadParameter(format!(
                "query {name:?} is outside zone {zone}"
            )));
        }
        let mut query = Query {
            name: name.to_owned(),
            zone: zone.to_owned(),
            port: config.port,
            retransmit: config.query_retransmit.max(1),
            backoff: config.query_backoff,
            start: now,
            deadline,
            sent: 0,
            records: vec![],
            latest: None,
            delivered: HashMap::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
            done: false,
        };
        query.send_question(now)?;
        Ok(query)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of query packets produced so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Whether the deadline passed or the query was closed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Live records collected so far, in discovery order.
    pub fn records(&self) -> Vec<ServiceRecord> {
        self.records
            .iter()
            .filter(|record| !record.is_goodbye())
            .cloned()
            .collect()
    }

    fn next_send(&self) -> Option<Instant> {
        if self.sent >= self.retransmit {
            return None;
        }
        let at = self.start + self.backoff * self.sent as u32;
        (at < self.deadline).then_some(at)
    }

    fn send_question(&mut self, now: Instant) -> Result<()> {
        let mut msg = Message {
            header: Header {
                id: 0,
                recursion_desired: false,
                ..Default::default()
            },
            questions: vec![Question {
                name: Name::new(&self.name)?,
                typ: DnsType::Ptr,
                class: DNSCLASS_INET,
            }],
            ..Default::default()
        };
        let raw = encode(&mut msg)?;

        self.sent += 1;
        trace!(
            "queuing query for {} ({}/{})",
            self.name, self.sent, self.retransmit
        );
        let group = SocketAddr::new(IpAddr::V4(MDNS_MULTICAST_IPV4), self.port);
        self.write_outs.push_back(TransportMessage {
            now,
            transport: TransportContext {
                peer_addr: group,
                if_index: 0,
                ..Default::default()
            },
            message: BytesMut::from(&raw[..]),
        });
        Ok(())
    }

    fn process_message(&mut self, ev: &DnsMessageEvent) {
        if !ev.message.header.response {
            return;
        }

        let mut touched: Vec<RecordKey> = vec![];
        // None until the message carries a PTR. After that, the instance the
        // most recent PTR introduced, or None when it was not one of ours.
        let mut owner: Option<Option<RecordKey>> = None;
        for rr in ev.message.records() {
            let name = &rr.header.name.data;
            if !has_name_suffix(name, &self.zone) {
                trace!("{}: ignoring {name} outside {}", self.name, self.zone);
                continue;
            }
            let ttl = Duration::from_secs(u64::from(rr.header.ttl));

            match rr.header.typ {
                DnsType::Ptr => {
                    let Some(ptr) = rr.ptr() else { continue };
                    if *name != self.name || !has_name_suffix(&ptr.ptr.data, &self.zone) {
                        owner = Some(None);
                        continue;
                    }
                    let key = (name.clone(), ptr.ptr.data.clone());
                    if ttl.is_zero() {
                        self.withdraw(&key, ev.if_index);
                        owner = Some(None);
                        continue;
                    }
                    owner = Some(Some(key.clone()));
                    let record = self.entry(&key);
                    record.ttl = ttl;
                    record.if_index = ev.if_index;
                    self.latest = Some(key.clone());
                    touched.push(key);
                }
                DnsType::Srv => {
                    let Some(srv) = rr.srv() else { continue };
                    let Some(key) = self.target_by_instance(name, owner.as_ref()) else {
                        continue;
                    };
                    if let Some(record) = self.record_mut(&key) {
                        record.host = srv.target.data.clone();
                        record.port = srv.port;
                        record.if_index = ev.if_index;
                        touched.push(key);
                    }
                }
                DnsType::Txt => {
                    let Some(txt) = rr.txt() else { continue };
                    let Some(key) = self.target_by_instance(name, owner.as_ref()) else {
                        continue;
                    };
                    if let Some(record) = self.record_mut(&key) {
                        record.txt = txt.txt.clone();
                        touched.push(key);
                    }
                }
                DnsType::A | DnsType::Aaaa => {
                    let addr = match (rr.a(), rr.aaaa()) {
                        (Some(a), _) => IpAddr::V4(a.addr()),
                        (_, Some(aaaa)) => IpAddr::V6(aaaa.addr()),
                        _ => continue,
                    };
                    if !is_global_unicast(&addr) {
                        trace!("{}: ignoring address {addr}", self.name);
                        continue;
                    }
                    for key in self.targets_by_host(name, owner.as_ref()) {
                        if let Some(record) = self.record_mut(&key)
                            && !record.addrs.contains(&addr)
                        {
                            record.addrs.push(addr);
                            touched.push(key);
                        }
                    }
                }
                _ => {}
            }
        }

        let mut seen = vec![];
        for key in touched {
            if seen.contains(&key) {
                continue;
            }
            if let Some(record) = self.records.iter().find(|r| r.key() == key)
                && self.delivered.get(&key) != Some(record)
            {
                self.delivered.insert(key.clone(), record.clone());
                self.event_outs.push_back(record.clone());
            }
            seen.push(key);
        }
    }

    fn entry(&mut self, key: &RecordKey) -> &mut ServiceRecord {
        let pos = match self.records.iter().position(|r| r.key() == *key) {
            Some(pos) => pos,
            None => {
                self.records.push(ServiceRecord {
                    service: key.0.clone(),
                    instance: key.1.clone(),
                    ..Default::default()
                });
                self.records.len() - 1
            }
        };
        &mut self.records[pos]
    }

    fn record_mut(&mut self, key: &RecordKey) -> Option<&mut ServiceRecord> {
        self.records.iter_mut().find(|r| r.key() == *key)
    }

    // Records with no known owner go to the instance of the PTR before them
    // in the same message, or to the most recent instance when the message
    // has no PTR at all.
    fn fallback(&self, owner: Option<&Option<RecordKey>>) -> Option<RecordKey> {
        match owner {
            Some(current) => current.clone(),
            None => self.latest.clone(),
        }
    }

    fn target_by_instance(
        &self,
        name: &str,
        owner: Option<&Option<RecordKey>>,
    ) -> Option<RecordKey> {
        self.records
            .iter()
            .find(|r| r.instance == name)
            .map(ServiceRecord::key)
            .or_else(|| self.fallback(owner))
    }

    fn targets_by_host(&self, host: &str, owner: Option<&Option<RecordKey>>) -> Vec<RecordKey> {
        let keys: Vec<RecordKey> = self
            .records
            .iter()
            .filter(|r| r.host == host)
            .map(ServiceRecord::key)
            .collect();
        if keys.is_empty() {
            self.fallback(owner).into_iter().collect()
        } else {
            keys
        }
    }

    fn withdraw(&mut self, key: &RecordKey, if_index: u32) {
        let goodbye = match self.records.iter().position(|r| r.key() == *key) {
            Some(pos) => self.records.remove(pos),
            None => ServiceRecord {
                service: key.0.clone(),
                instance: key.1.clone(),
                ..Default::default()
            },
        };
        debug!("{}: {} said goodbye", self.name, key.1);
        if self.latest.as_ref() == Some(key) {
            self.latest = None;
        }
        self.delivered.remove(key);
        self.event_outs.push_back(ServiceRecord {
            ttl: Duration::ZERO,
            if_index,
            ..goodbye
        });
    }
}

impl Protocol<Arc<DnsMessageEvent>, (), ()> for Query {
    type Rout = ();
    type Wout = TaggedBytesMut;
    type Eout = ServiceRecord;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: Arc<DnsMessageEvent>) -> Result<()> {
        if self.done {
            return Err(Error::ErrConnectionClosed);
        }
        self.process_message(&msg);
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
    }

    fn handle_write(&mut self, _msg: ()) -> Result<()> {
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.write_outs.pop_front()
    }

    fn handle_event(&mut self, _evt: ()) -> Result<()> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Self::Time) -> Result<()> {
        if self.done {
            return Err(Error::ErrConnectionClosed);
        }
        if now >= self.deadline {
            debug!(
                "{}: deadline reached after {} send(s), {} record(s)",
                self.name,
                self.sent,
                self.records.len()
            );
            self.done = true;
            return Ok(());
        }
        while let Some(at) = self.next_send() {
            if at > now {
                break;
            }
            self.send_question(now)?;
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        if self.done {
            return None;
        }
        Some(
            self.next_send()
                .map_or(self.deadline, |at| at.min(self.deadline)),
        )
    }

    fn close(&mut self) -> Result<()> {
        self.done = true;
        self.write_outs.clear();
        Ok(())
    }
}

/// Async front end of the query engine.
///
/// Every call subscribes to the bus for its own lifetime and publishes each
/// new or changed record as [`Event::Service`] while it runs.
#[derive(Clone)]
pub struct Discovery {
    config: MdnsConfig,
    zone: String,
    bus: EventBus<Event>,
    sink: Arc<dyn PacketSink>,
    cancel: CancellationToken,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Discovery {
    pub fn new(
        config: &MdnsConfig,
        bus: EventBus<Event>,
        sink: Arc<dyn PacketSink>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let (in_flight, _) = watch::channel(0);
        Ok(Discovery {
            zone: config.canonical_zone()?,
            config: config.clone(),
            bus,
            sink,
            cancel,
            in_flight: Arc::new(in_flight),
        })
    }

    /// Collects the service types announced in the zone. Each record has the
    /// meta-query name as `service` and a discovered service type as
    /// `instance`.
    pub async fn enumerate_services(
        &self,
        deadline: Duration,
    ) -> std::result::Result<Vec<ServiceRecord>, QueryError> {
        let name = format!("{SERVICE_TYPE_ENUMERATION}{}", self.zone);
        self.query(&name, deadline).await
    }

    /// Collects the instances of `service` (`_name._proto`, optionally
    /// qualified) seen before `deadline` elapses.
    pub async fn lookup(
        &self,
        service: &str,
        deadline: Duration,
    ) -> std::result::Result<Vec<ServiceRecord>, QueryError> {
        let name = qualify_service(&self.zone, service)?;
        self.query(&name, deadline).await
    }

    /// Number of queries currently running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Cancels every running query and waits for them to return.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    async fn query(
        &self,
        name: &str,
        deadline: Duration,
    ) -> std::result::Result<Vec<ServiceRecord>, QueryError> {
        if self.cancel.is_cancelled() {
            return Err(Error::ErrCancelled.into());
        }
        let _guard = InFlight::enter(&self.in_flight);
        let sub = self.bus.subscribe(Delivery::Blocking)?;

        let now = tokio::time::Instant::now().into_std();
        let mut query = Query::new(name, &self.zone, &self.config, now, now + deadline)?;
        debug!("query {name} started, deadline {deadline:?}");

        let result = loop {
            self.flush(&mut query).await;
            if query.is_done() {
                break Ok(());
            }
            let Some(wake) = query.poll_timeout() else {
                break Ok(());
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break Err(Error::ErrCancelled),
                event = sub.recv() => match event {
                    Ok(Event::Message(msg)) => {
                        if let Err(err) = query.handle_read(msg) {
                            break Err(err);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => break Err(err),
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    let now = tokio::time::Instant::now().into_std();
                    if let Err(err) = query.handle_timeout(now) {
                        break Err(err);
                    }
                }
            }
        };
        let _ = query.close();
        drop(sub);

        let records = query.records();
        match result {
            Ok(()) => {
                debug!(
                    "query {name} finished: {} record(s), {} send(s)",
                    records.len(),
                    query.sent()
                );
                Ok(records)
            }
            Err(error) => {
                debug!("query {name} failed: {error}");
                Err(QueryError {
                    partial: records,
                    error,
                })
            }
        }
    }

    async fn flush(&self, query: &mut Query) {
        while let Some(packet) = query.poll_write() {
            if let Err(err) = self.sink.send(&packet.message, packet.transport.if_index) {
                warn!("query {}: send failed: {err}", query.name());
            }
        }
        while let Some(record) = query.poll_event() {
            trace!("query {}: {record}", query.name());
            match self.bus.emit(Event::Service(record), true).await {
                Ok(_) => {}
                Err(err) => debug!("query {}: {err}", query.name()),
            }
        }
    }
}

struct InFlight<'a>(&'a watch::Sender<usize>);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|count| *count += 1);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}
