//! Responder: the node's registry of local services.
//!
//! Registration replaces the whole registry and announces it; withdrawal
//! multicasts TTL=0 PTR records. Questions arriving over the bus are answered
//! on the interface they came in on.


use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio_util::sync::CancellationToken;

use crate::bus::Subscription;
use crate::config::MdnsConfig;
use crate::event::{DnsMessageEvent, Event};
use crate::message::{
    AResource, AaaaResource, DnsType, Header, Message, Name, PtrResource, RCode, Resource,
    SrvResource, TxtResource, encode,
};
use crate::record::{SERVICE_TYPE_ENUMERATION, ServiceRecord, strip_zone};
use crate::sink::PacketSink;
use shared::error::{Error, Result};

const SRV_PRIORITY: u16 = 10;
const SRV_WEIGHT: u16 = 1;

/// Lifecycle of the registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ResponderState {
    #[default]
    Empty,
    Registered,
    /// Goodbyes are being sent; nothing new is announced.
    Draining,
}

impl fmt::Display for ResponderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ResponderState::Empty => "empty",
            ResponderState::Registered => "registered",
            ResponderState::Draining => "draining",
        };
        write!(f, "{s}")
    }
}

#[derive(Default)]
struct Registry {
    state: ResponderState,
    records: Vec<ServiceRecord>,
    stopped: bool,
}

/// Answers questions for locally registered services.
pub struct Responder {
    zone: String,
    ttl: u32,
    sink: Arc<dyn PacketSink>,
    registry: RwLock<Registry>,
}

impl Responder {
    pub fn new(config: &MdnsConfig, sink: Arc<dyn PacketSink>) -> Result<Self> {
        config.validate()?;
        Ok(Responder {
            zone: config.canonical_zone()?,
            ttl: config.announce_ttl_secs(),
            sink,
            registry: RwLock::new(Registry::default()),
        })
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn state(&self) -> Result<ResponderState> {
        Ok(self.registry.read()?.state)
    }

    /// Snapshot of the registered records.
    pub fn records(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self.registry.read()?.records.clone())
    }

    /// Replaces the registry with `records` and announces them.
    ///
    /// Instances dropped by the replacement are sent a goodbye first. An
    /// empty list withdraws everything.
    ///
    /// # Errors
    ///
    /// [`Error::ErrBadParameter`] for a record outside the zone, missing a
    /// mandatory field or carrying a non-global address, [`Error::ErrDuplicate`] when two records share an
    /// instance name, [`Error::ErrCancelled`] once the responder has been
    /// stopped. The registry is unchanged on error.
    pub fn register(&self, records: Vec<ServiceRecord>) -> Result<()> {
        for (i, record) in records.iter().enumerate() {
            record.validate(&self.zone)?;
            if records[..i].iter().any(|r| r.instance == record.instance) {
                return Err(Error::ErrDuplicate(record.instance.clone()));
            }
        }
        let ttl = Duration::from_secs(u64::from(self.ttl));
        let records: Vec<ServiceRecord> = records
            .into_iter()
            .map(|record| ServiceRecord {
                ttl,
                if_index: 0,
                ..record
            })
            .collect();

        let mut registry = self.registry.write()?;
        if registry.stopped {
            return Err(Error::ErrCancelled);
        }

        let dropped: Vec<ServiceRecord> = registry
            .records
            .iter()
            .filter(|old| !records.iter().any(|new| new.instance == old.instance))
            .cloned()
            .collect();
        if !dropped.is_empty() {
            registry.state = ResponderState::Draining;
            self.send_goodbyes(&dropped);
        }

        registry.records = records;
        if registry.records.is_empty() {
            registry.state = ResponderState::Empty;
            info!("responder: registry cleared");
            return Ok(());
        }
        registry.state = ResponderState::Registered;
        info!(
            "responder: registered {} instance(s)",
            registry.records.len()
        );
        self.announce(&registry.records);
        Ok(())
    }

    /// Sends a goodbye for every registered instance and empties the
    /// registry.
    pub fn deregister(&self) -> Result<()> {
        let mut registry = self.registry.write()?;
        self.drain(&mut registry);
        Ok(())
    }

    /// Answers the questions of one inbound message. Returns the number of
    /// records sent.
    pub fn handle_message(&self, ev: &DnsMessageEvent) -> Result<usize> {
        let header = &ev.message.header;
        if header.response
            || header.op_code != 0
            || header.rcode != RCode::Success
            || header.truncated
        {
            return Ok(0);
        }

        let registry = self.registry.read()?;
        if registry.state != ResponderState::Registered {
            return Ok(0);
        }

        let mut answers = vec![];
        for question in &ev.message.questions {
            if question.unicast_response() {
                trace!(
                    "responder: skipping unicast question for {}",
                    question.name
                );
                continue;
            }
            let Some(relative) = strip_zone(&question.name.data, &self.zone) else {
                continue;
            };

            if relative == SERVICE_TYPE_ENUMERATION {
                if matches!(question.typ, DnsType::Ptr | DnsType::All) {
                    for service in services(&registry.records) {
                        answers.push(self.ptr(&question.name.data, service, self.ttl)?);
                    }
                }
                continue;
            }

            for record in registry.records.iter().filter(|r| {
                r.service == question.name.data || r.instance == question.name.data
            }) {
                match question.typ {
                    DnsType::Ptr | DnsType::All => answers.extend(self.bundle(record)?),
                    DnsType::Txt => answers.push(self.txt(record)?),
                    DnsType::Srv => {
                        answers.push(self.srv(record)?);
                        answers.extend(self.addrs(record)?);
                    }
                    _ => {}
                }
            }
        }
        drop(registry);

        if answers.is_empty() {
            return Ok(0);
        }
        let count = answers.len();
        debug!(
            "responder: answering {} question(s) from {} with {count} record(s) on interface {}",
            ev.message.questions.len(),
            ev.from,
            ev.if_index
        );
        self.send(answers, ev.if_index);
        Ok(count)
    }

    /// Serves questions from `events` until cancelled or until the bus
    /// closes, then withdraws everything that is still registered.
    pub async fn run(
        &self,
        events: Subscription<Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("responder started in zone {}", self.zone);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(Event::Message(msg)) => {
                    if let Err(err) = self.handle_message(&msg) {
                        debug!("responder: skipped message from {}: {err}", msg.from);
                    }
                }
                Ok(_) => {}
                Err(Error::ErrBusClosed) => {
                    debug!("responder: bus closed");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        drop(events);

        let mut registry = self.registry.write()?;
        registry.stopped = true;
        self.drain(&mut registry);
        info!("responder stopped");
        Ok(())
    }

    fn drain(&self, registry: &mut Registry) {
        if registry.records.is_empty() {
            registry.state = ResponderState::Empty;
            return;
        }
        registry.state = ResponderState::Draining;
        self.send_goodbyes(&registry.records);
        info!(
            "responder: withdrew {} instance(s)",
            registry.records.len()
        );
        registry.records.clear();
        registry.state = ResponderState::Empty;
    }

    fn announce(&self, records: &[ServiceRecord]) {
        let meta = format!("{SERVICE_TYPE_ENUMERATION}{}", self.zone);
        for record in records {
            match self.bundle(record) {
                Ok(answers) => self.send(answers, 0),
                Err(err) => warn!("responder: cannot announce {}: {err}", record.instance),
            }
        }

        let answers: Result<Vec<Resource>> = services(records)
            .map(|service| self.ptr(&meta, service, self.ttl))
            .collect();
        match answers {
            Ok(answers) => self.send(answers, 0),
            Err(err) => warn!("responder: cannot announce service types: {err}"),
        }
    }

    fn send_goodbyes(&self, records: &[ServiceRecord]) {
        let answers: Result<Vec<Resource>> = records
            .iter()
            .map(|record| self.ptr(&record.service, &record.instance, 0))
            .collect();
        match answers {
            Ok(answers) => {
                debug!("responder: sending {} goodbye(s)", answers.len());
                self.send(answers, 0);
            }
            Err(err) => warn!("responder: cannot build goodbyes: {err}"),
        }
    }

    // send encodes one response and hands it to the sink; failures are only
    // logged.
    fn send(&self, answers: Vec<Resource>, if_index: u32) {
        let mut msg = Message {
            header: Header {
                id: 0,
                response: true,
                authoritative: true,
                ..Default::default()
            },
            answers,
            ..Default::default()
        };
        let raw = match encode(&mut msg) {
            Ok(raw) => raw,
            Err(err) => {
                log::error!("responder: failed to encode response: {err}");
                return;
            }
        };
        trace!(
            "responder: sending {} record(s), {} bytes on interface {if_index}",
            msg.answers.len(),
            raw.len()
        );
        if let Err(err) = self.sink.send(&raw, if_index) {
            warn!("responder: send on interface {if_index} failed: {err}");
        }
    }

    // bundle is the full answer set of one instance: PTR, SRV, TXT, then
    // one A or AAAA per address.
    fn bundle(&self, record: &ServiceRecord) -> Result<Vec<Resource>> {
        let mut answers = vec![
            self.ptr(&record.service, &record.instance, self.ttl)?,
            self.srv(record)?,
            self.txt(record)?,
        ];
        answers.extend(self.addrs(record)?);
        Ok(answers)
    }

    fn ptr(&self, owner: &str, target: &str, ttl: u32) -> Result<Resource> {
        Ok(Resource::new(
            Name::new(owner)?,
            ttl,
            Box::new(PtrResource {
                ptr: Name::new(target)?,
            }),
        ))
    }

    fn srv(&self, record: &ServiceRecord) -> Result<Resource> {
        Ok(Resource::new(
            Name::new(&record.instance)?,
            self.ttl,
            Box::new(SrvResource {
                priority: SRV_PRIORITY,
                weight: SRV_WEIGHT,
                port: record.port,
                target: Name::new(&record.host)?,
            }),
        ))
    }

    fn txt(&self, record: &ServiceRecord) -> Result<Resource> {
        Ok(Resource::new(
            Name::new(&record.instance)?,
            self.ttl,
            Box::new(TxtResource {
                txt: record.txt.clone(),
            }),
        ))
    }

    fn addrs(&self, record: &ServiceRecord) -> Result<Vec<Resource>> {
        let host = Name::new(&record.host)?;
        Ok(record
            .addrs
            .iter()
            .map(|addr| match addr {
                IpAddr::V4(v4) => {
                    Resource::new(host.clone(), self.ttl, Box::new(AResource::new(*v4)))
                }
                IpAddr::V6(v6) => {
                    Resource::new(host.clone(), self.ttl, Box::new(AaaaResource::new(*v6)))
                }
            })
            .collect())
    }
}

// services yields each distinct service name once, in registration order.
fn services(records: &[ServiceRecord]) -> impl Iterator<Item = &str> {
    records
        .iter()
        .enumerate()
        .filter(|(i, r)| !records[..*i].iter().any(|p| p.service == r.service))
        .map(|(_, r)| r.service.as_str())
}
