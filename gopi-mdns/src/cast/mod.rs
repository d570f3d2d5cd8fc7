//! Chromecast discovery on top of the query engine.
//!
//! A cast device announces itself as an instance of `_googlecast._tcp` with
//! TXT keys `id` (stable device id), `fn` (friendly name), `md` (model),
//! `rs` (running app) and `st` (app state). [`CastManager`] keeps one
//! [`CastDevice`] per id and reports what changed as [`CastEvent`]s.

#[cfg(test)]
mod cast_test;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info, trace};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, Subscription};
use crate::config::MdnsConfig;
use crate::discovery::{Discovery, QueryError};
use crate::event::Event;
use crate::record::{ServiceRecord, qualify_service};
use shared::error::{Error, Result};

/// DNS-SD service type of cast devices.
pub const CAST_SERVICE: &str = "_googlecast._tcp";

bitflags! {
    /// What changed about a device since it was last seen.
    #[derive(Default)]
    pub struct CastFlags: u32 {
        const NONE = 0;
        /// First sighting.
        const DISCOVERY = 1 << 0;
        /// Friendly name or model changed.
        const NAME = 1 << 1;
        /// Running app or its state changed.
        const APP = 1 << 2;
        /// The device said goodbye.
        const REMOVED = 1 << 3;
    }
}

/// A cast device as seen on the network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CastDevice {
    pub id: String,
    /// Friendly name (`fn`).
    pub name: String,
    /// Model (`md`).
    pub model: String,
    /// Running application (`rs`); empty when idle.
    pub app: String,
    /// Application state (`st`).
    pub state: u32,
    /// Fully qualified instance name the device announced.
    pub instance: String,
    pub host: String,
    pub port: u16,
    pub addrs: Vec<IpAddr>,
}

impl fmt::Display for CastDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} ({})", self.id, self.name, self.model)?;
        if !self.app.is_empty() {
            write!(f, " running {:?} state {}", self.app, self.state)?;
        }
        Ok(())
    }
}

impl CastDevice {
    /// Reads a device out of a `_googlecast._tcp` record.
    ///
    /// # Errors
    ///
    /// [`Error::ErrBadParameter`] when the TXT data carries no `id`.
    pub fn from_record(record: &ServiceRecord) -> Result<Self> {
        let id = record
            .txt_value("id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                Error::ErrBadParameter(format!("{} has no cast id", record.instance))
            })?;
        let txt = |key: &str| record.txt_value(key).unwrap_or_default().to_owned();
        Ok(CastDevice {
            id: id.to_owned(),
            name: txt("fn"),
            model: txt("md"),
            app: txt("rs"),
            state: record
                .txt_value("st")
                .and_then(|st| st.parse().ok())
                .unwrap_or_default(),
            instance: record.instance.clone(),
            host: record.host.clone(),
            port: record.port,
            addrs: record.addrs.clone(),
        })
    }
}

/// A change to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastEvent {
    pub flags: CastFlags,
    pub device: CastDevice,
}

impl fmt::Display for CastEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.flags, self.device)
    }
}

/// Keeps the set of known cast devices up to date.
pub struct CastManager {
    service: String,
    devices: RwLock<HashMap<String, CastDevice>>,
    bus: EventBus<Event>,
    discovery: Discovery,
}

impl CastManager {
    pub fn new(config: &MdnsConfig, bus: EventBus<Event>, discovery: Discovery) -> Result<Self> {
        let zone = config.canonical_zone()?;
        Ok(CastManager {
            service: qualify_service(&zone, CAST_SERVICE)?,
            devices: RwLock::new(HashMap::new()),
            bus,
            discovery,
        })
    }

    /// Folds one record into the device map and returns the resulting
    /// change, if any. Records of other services are ignored.
    pub fn handle_record(&self, record: &ServiceRecord) -> Result<Option<CastEvent>> {
        if record.service != self.service {
            return Ok(None);
        }

        if record.is_goodbye() {
            let mut devices = self.devices.write()?;
            let id = match record.txt_value("id").filter(|id| !id.is_empty()) {
                Some(id) => Some(id.to_owned()),
                None => devices
                    .values()
                    .find(|d| d.instance == record.instance)
                    .map(|d| d.id.clone()),
            };
            return Ok(id.and_then(|id| devices.remove(&id)).map(|device| {
                debug!("cast: {device} removed");
                CastEvent {
                    flags: CastFlags::REMOVED,
                    device,
                }
            }));
        }

        let device = CastDevice::from_record(record)?;
        let mut devices = self.devices.write()?;
        let mut flags = CastFlags::NONE;
        match devices.get_mut(&device.id) {
            None => {
                flags |= CastFlags::DISCOVERY;
                devices.insert(device.id.clone(), device.clone());
            }
            Some(known) => {
                if known.name != device.name || known.model != device.model {
                    flags |= CastFlags::NAME;
                }
                if known.app != device.app || known.state != device.state {
                    flags |= CastFlags::APP;
                }
                *known = device.clone();
            }
        }

        if flags.is_empty() {
            return Ok(None);
        }
        debug!("cast: {device} {flags:?}");
        Ok(Some(CastEvent { flags, device }))
    }

    /// The devices currently known, ordered by id.
    pub fn snapshot(&self) -> Result<Vec<CastDevice>> {
        let mut devices: Vec<CastDevice> = self.devices.read()?.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    pub fn device(&self, id: &str) -> Result<Option<CastDevice>> {
        Ok(self.devices.read()?.get(id).cloned())
    }

    /// Looks up cast devices until `deadline` elapses, folds the results in
    /// and returns the device map.
    pub async fn devices(
        &self,
        deadline: Duration,
    ) -> std::result::Result<Vec<CastDevice>, QueryError> {
        let (records, failure) = match self.discovery.lookup(CAST_SERVICE, deadline).await {
            Ok(records) => (records, None),
            Err(QueryError { partial, error }) => (partial, Some(error)),
        };
        for record in &records {
            self.process(record).await;
        }
        match failure {
            None => Ok(self.snapshot()?),
            Some(error) => Err(QueryError {
                partial: records,
                error,
            }),
        }
    }

    /// Follows [`Event::Service`] records on the bus until cancelled or
    /// until the bus closes.
    pub async fn run(&self, events: Subscription<Event>, cancel: CancellationToken) -> Result<()> {
        info!("cast manager started for {}", self.service);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(Event::Service(record)) => self.process(&record).await,
                Ok(_) => {}
                Err(Error::ErrBusClosed) => break,
                Err(err) => return Err(err),
            }
        }
        info!("cast manager stopped");
        Ok(())
    }

    async fn process(&self, record: &ServiceRecord) {
        match self.handle_record(record) {
            Ok(Some(event)) => {
                if let Err(err) = self.bus.emit(Event::Cast(event), true).await {
                    debug!("cast: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => trace!("cast: skipping {}: {err}", record.instance),
        }
    }
}
