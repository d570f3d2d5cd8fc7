use std::net::Ipv4Addr;
use std::sync::Arc;

use super::*;
use crate::bus::Delivery;
use crate::event::DnsMessageEvent;
use crate::message::{
    AResource, Header, Message, Name, PtrResource, Resource, SrvResource, TxtResource,
};
use crate::sink::PacketSink;

struct NullSink;

impl PacketSink for NullSink {
    fn send(&self, _payload: &[u8], _if_index: u32) -> Result<()> {
        Ok(())
    }
}

fn manager(cancel: CancellationToken) -> (CastManager, EventBus<Event>) {
    let config = MdnsConfig::default();
    let bus = EventBus::from_config(&config);
    let discovery = Discovery::new(&config, bus.clone(), Arc::new(NullSink), cancel).unwrap();
    let manager = CastManager::new(&config, bus.clone(), discovery).unwrap();
    (manager, bus)
}

fn cast_record(id: &str, name: &str, app: &str, state: &str) -> ServiceRecord {
    ServiceRecord::new("local.", CAST_SERVICE, &format!("Chromecast-{id}"), "cc", 8009)
        .unwrap()
        .with_txt([
            format!("id={id}"),
            format!("fn={name}"),
            "md=Chromecast".to_owned(),
            format!("rs={app}"),
            format!("st={state}"),
        ])
        .with_addrs([IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40))])
}

#[test]
fn test_cast_device_from_record() -> Result<()> {
    let device = CastDevice::from_record(&cast_record("X", "Kitchen", "YouTube", "1"))?;
    assert_eq!(device.id, "X");
    assert_eq!(device.name, "Kitchen");
    assert_eq!(device.model, "Chromecast");
    assert_eq!(device.app, "YouTube");
    assert_eq!(device.state, 1);
    assert_eq!(device.instance, "Chromecast-X._googlecast._tcp.local.");
    assert_eq!(device.port, 8009);
    assert_eq!(device.to_string(), "X \"Kitchen\" (Chromecast) running \"YouTube\" state 1");

    let mut anonymous = cast_record("X", "Kitchen", "", "0");
    anonymous.txt.retain(|entry| !entry.starts_with("id="));
    assert!(matches!(
        CastDevice::from_record(&anonymous),
        Err(Error::ErrBadParameter(_))
    ));
    Ok(())
}

#[test]
fn test_cast_discovery_then_app_change() -> Result<()> {
    let (manager, _bus) = manager(CancellationToken::new());

    let first = manager.handle_record(&cast_record("X", "Kitchen", "", "0"))?;
    assert_eq!(first.map(|e| e.flags), Some(CastFlags::DISCOVERY));

    let second = manager.handle_record(&cast_record("X", "Kitchen", "YouTube", "1"))?;
    let second = second.unwrap();
    assert_eq!(second.flags, CastFlags::APP);
    assert_eq!(second.device.app, "YouTube");
    assert_eq!(manager.device("X")?.unwrap().state, 1);
    Ok(())
}

#[test]
fn test_cast_identical_records_are_reported_once() -> Result<()> {
    let (manager, _bus) = manager(CancellationToken::new());
    let record = cast_record("X", "Kitchen", "", "0");

    let flags: Vec<CastFlags> = (0..10)
        .filter_map(|_| manager.handle_record(&record).unwrap())
        .map(|event| event.flags)
        .collect();
    assert_eq!(flags, vec![CastFlags::DISCOVERY]);
    assert_eq!(manager.snapshot()?.len(), 1);
    Ok(())
}

#[test]
fn test_cast_name_and_app_change_together() -> Result<()> {
    let (manager, _bus) = manager(CancellationToken::new());
    manager.handle_record(&cast_record("X", "Kitchen", "", "0"))?;

    let renamed = manager.handle_record(&cast_record("X", "Lounge", "", "0"))?;
    assert_eq!(renamed.unwrap().flags, CastFlags::NAME);

    let both = manager.handle_record(&cast_record("X", "Bedroom", "Netflix", "1"))?;
    assert_eq!(both.unwrap().flags, CastFlags::NAME | CastFlags::APP);

    // Address changes alone are folded in silently.
    let moved = cast_record("X", "Bedroom", "Netflix", "1")
        .with_addrs([IpAddr::V4(Ipv4Addr::new(192, 168, 1, 41))]);
    assert_eq!(manager.handle_record(&moved)?, None);
    assert_eq!(
        manager.device("X")?.unwrap().addrs,
        vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 41))]
    );
    Ok(())
}

#[test]
fn test_cast_goodbye_removes_device() -> Result<()> {
    let (manager, _bus) = manager(CancellationToken::new());
    let record = cast_record("X", "Kitchen", "", "0");
    manager.handle_record(&record)?;

    // A goodbye may come without TXT data; the instance name is enough.
    let goodbye = ServiceRecord {
        service: record.service.clone(),
        instance: record.instance.clone(),
        ..Default::default()
    };
    let event = manager.handle_record(&goodbye)?.unwrap();
    assert_eq!(event.flags, CastFlags::REMOVED);
    assert_eq!(event.device.id, "X");
    assert!(manager.snapshot()?.is_empty());

    assert_eq!(manager.handle_record(&goodbye)?, None);
    Ok(())
}

#[test]
fn test_cast_ignores_other_services() -> Result<()> {
    let (manager, _bus) = manager(CancellationToken::new());
    let other = ServiceRecord::new("local.", "_gopi._tcp", "X", "h", 80)?.with_txt(["id=X"]);
    assert_eq!(manager.handle_record(&other)?, None);
    assert!(manager.snapshot()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cast_run_publishes_changes() -> Result<()> {
    let cancel = CancellationToken::new();
    let (manager, bus) = manager(cancel.clone());
    let manager = Arc::new(manager);
    let watcher = bus.subscribe(Delivery::Blocking)?;
    let events = bus.subscribe(Delivery::Blocking)?;

    let task = {
        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(events, cancel).await })
    };

    bus.emit(Event::Service(cast_record("X", "Kitchen", "", "0")), false)
        .await?;
    let cast = loop {
        match watcher.recv().await? {
            Event::Cast(cast) => break cast,
            _ => continue,
        }
    };
    assert_eq!(cast.flags, CastFlags::DISCOVERY);
    assert_eq!(cast.device.name, "Kitchen");

    cancel.cancel();
    task.await.unwrap()?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cast_devices_merges_lookup() -> Result<()> {
    let (manager, bus) = manager(CancellationToken::new());

    let instance = "Chromecast-X._googlecast._tcp.local.";
    let answers = vec![
        Resource::new(
            Name::new("_googlecast._tcp.local.")?,
            120,
            Box::new(PtrResource {
                ptr: Name::new(instance)?,
            }),
        ),
        Resource::new(
            Name::new(instance)?,
            120,
            Box::new(SrvResource {
                priority: 0,
                weight: 0,
                port: 8009,
                target: Name::new("cc.local.")?,
            }),
        ),
        Resource::new(
            Name::new(instance)?,
            120,
            Box::new(TxtResource {
                txt: vec!["id=X".to_owned(), "fn=Kitchen".to_owned()],
            }),
        ),
        Resource::new(
            Name::new("cc.local.")?,
            120,
            Box::new(AResource::new(Ipv4Addr::new(192, 168, 1, 40))),
        ),
    ];
    {
        let bus = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let msg = DnsMessageEvent {
                message: Message {
                    header: Header {
                        response: true,
                        authoritative: true,
                        ..Default::default()
                    },
                    answers,
                    ..Default::default()
                },
                if_index: 2,
                from: "192.168.1.40:5353".parse().unwrap(),
            };
            bus.emit(Event::Message(Arc::new(msg)), false).await
        });
    }

    let devices = manager.devices(Duration::from_millis(500)).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "X");
    assert_eq!(devices[0].name, "Kitchen");
    assert_eq!(devices[0].host, "cc.local.");
    assert_eq!(devices[0].addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40))]);
    Ok(())
}
