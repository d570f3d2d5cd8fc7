//! Multicast I/O on the mDNS groups.
//!
//! One shared IPv4 socket and one shared IPv6 socket carry every eligible
//! interface. Inbound datagrams are tagged with the interface they arrived on
//! and pushed into a channel; outbound packets pick their interface per send.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::future::join_all;
use log::{debug, info, trace, warn};
use nix::libc;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, SockaddrIn, SockaddrIn6, SockaddrStorage,
    recvmsg, sendmsg,
};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{MDNS_MULTICAST_IPV4, MDNS_MULTICAST_IPV6, MdnsConfig};
use crate::sink::PacketSink;
use crate::socket::{Family, MulticastSocket};
use shared::error::{Error, Result, flatten_errs};
use shared::ifaces::{Interface, multicast_ifaces};
use shared::{TaggedBytesMut, TransportContext};

/// Largest datagram accepted; anything longer is reported truncated.
pub(crate) const MAX_DATAGRAM: usize = 65535;

/// Pause before retrying after a transient receive error.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

struct Binding {
    family: Family,
    socket: Arc<UdpSocket>,
    if_indexes: Vec<u32>,
}

struct Bindings {
    v4: Option<Binding>,
    v6: Option<Binding>,
}

impl Bindings {
    fn iter(&self) -> impl Iterator<Item = &Binding> {
        [&self.v4, &self.v6].into_iter().flatten()
    }
}

/// The real-socket transport.
pub struct MulticastTransport {
    port: u16,
    bindings: Mutex<Option<Bindings>>,
    interfaces: Vec<Interface>,
    closed: AtomicBool,
    cancel: CancellationToken,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl MulticastTransport {
    /// Binds the mDNS groups on every eligible interface and starts one
    /// receive task per socket, feeding `inbound`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`Error::ErrBadInterface`] when no interface is eligible or no group
    /// could be joined.
    pub fn bind(config: &MdnsConfig, inbound: mpsc::Sender<TaggedBytesMut>) -> Result<Self> {
        let interfaces = multicast_ifaces(config.interface.as_deref())?;
        if interfaces.is_empty() {
            return Err(Error::ErrBadInterface);
        }

        let bind = |family: Family| -> Option<Binding> {
            let (indexes, builder): (Vec<u32>, _) = match family {
                Family::V4 => (
                    interfaces.iter().filter(|i| i.has_ipv4()).map(|i| i.index).collect(),
                    MulticastSocket::v4(config.port),
                ),
                Family::V6 => (
                    interfaces.iter().filter(|i| i.has_ipv6()).map(|i| i.index).collect(),
                    MulticastSocket::v6(config.port),
                ),
            };
            if indexes.is_empty() {
                return None;
            }
            let socket = builder
                .with_interfaces(indexes)
                .into_std()
                .and_then(|(std_socket, joined)| {
                    Ok((UdpSocket::from_std(std_socket)?, joined))
                });
            match socket {
                Ok((socket, if_indexes)) => Some(Binding {
                    family,
                    socket: Arc::new(socket),
                    if_indexes,
                }),
                Err(err) => {
                    warn!("mdns {family:?} socket unavailable: {err}");
                    None
                }
            }
        };

        let v4 = bind(Family::V4);
        let v6 = bind(Family::V6);
        if v4.is_none() && v6.is_none() {
            return Err(Error::ErrBadInterface);
        }

        let cancel = CancellationToken::new();
        let mut pumps = vec![];
        for binding in [&v4, &v6].into_iter().flatten() {
            pumps.push(tokio::spawn(receive_pump(
                Arc::clone(&binding.socket),
                binding.family,
                config.port,
                inbound.clone(),
                cancel.child_token(),
            )));
        }

        info!(
            "mdns transport bound on port {}: v4 {:?}, v6 {:?}",
            config.port,
            v4.as_ref().map(|b| &b.if_indexes),
            v6.as_ref().map(|b| &b.if_indexes),
        );

        Ok(MulticastTransport {
            port: config.port,
            bindings: Mutex::new(Some(Bindings { v4, v6 })),
            interfaces,
            closed: AtomicBool::new(false),
            cancel,
            pumps: Mutex::new(pumps),
        })
    }

    /// The eligible interfaces found at startup.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Stops the receive tasks, waits for them to exit and closes both
    /// sockets, leaving the groups and releasing the port. Further sends fail
    /// with [`Error::ErrTransportClosed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let pumps = std::mem::take(&mut *self.pumps.lock()?);
        for res in join_all(pumps).await {
            if let Err(err) = res {
                warn!("mdns receive task failed: {err}");
            }
        }
        // The pumps held the only other references to the sockets.
        let bindings = self.bindings.lock()?.take();
        drop(bindings);
        info!("mdns transport closed");
        Ok(())
    }

    #[cfg(test)]
    fn sockets(&self) -> Vec<std::sync::Weak<UdpSocket>> {
        self.bindings
            .lock()
            .unwrap()
            .iter()
            .flat_map(Bindings::iter)
            .map(|binding| Arc::downgrade(&binding.socket))
            .collect()
    }

    fn send_on(&self, binding: &Binding, payload: &[u8], if_index: u32) -> Result<()> {
        let fd = binding.socket.as_raw_fd();
        let res = match binding.family {
            Family::V4 => send_v4(fd, payload, self.port, if_index),
            Family::V6 => send_v6(fd, payload, self.port, if_index),
        };
        res.map_err(|err| {
            warn!(
                "mdns send on {:?} interface {if_index} failed: {err}",
                binding.family
            );
            Error::from(err)
        })
    }
}

impl PacketSink for MulticastTransport {
    fn send(&self, payload: &[u8], if_index: u32) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrTransportClosed);
        }
        let bindings = self.bindings.lock()?;
        let Some(bindings) = bindings.as_ref() else {
            return Err(Error::ErrTransportClosed);
        };

        let mut errs = vec![];
        let mut matched = false;
        for binding in bindings.iter() {
            for &index in &binding.if_indexes {
                if if_index != 0 && index != if_index {
                    continue;
                }
                matched = true;
                if let Err(err) = self.send_on(binding, payload, index) {
                    errs.push(err);
                }
            }
        }
        if !matched {
            return Err(Error::ErrUnknownInterface(if_index));
        }
        trace!("mdns sent {} bytes on interface {if_index}", payload.len());
        flatten_errs(errs)
    }
}

// The fd is non-blocking: a full send buffer surfaces as WouldBlock and is
// reported like any other per-interface failure.
fn send_v4(fd: RawFd, payload: &[u8], port: u16, if_index: u32) -> io::Result<()> {
    let dst = SockaddrIn::from(SocketAddrV4::new(MDNS_MULTICAST_IPV4, port));
    let info = libc::in_pktinfo {
        ipi_ifindex: if_index as _,
        ipi_spec_dst: libc::in_addr { s_addr: 0 },
        ipi_addr: libc::in_addr { s_addr: 0 },
    };
    sendmsg(
        fd,
        &[IoSlice::new(payload)],
        &[ControlMessage::Ipv4PacketInfo(&info)],
        MsgFlags::empty(),
        Some(&dst),
    )?;
    Ok(())
}

fn send_v6(fd: RawFd, payload: &[u8], port: u16, if_index: u32) -> io::Result<()> {
    // The scope id picks the outgoing link for a link-local group.
    let dst = SockaddrIn6::from(SocketAddrV6::new(MDNS_MULTICAST_IPV6, port, 0, if_index));
    sendmsg::<SockaddrIn6>(
        fd,
        &[IoSlice::new(payload)],
        &[],
        MsgFlags::empty(),
        Some(&dst),
    )?;
    Ok(())
}

struct Received {
    len: usize,
    truncated: bool,
    if_index: u32,
    from: Option<SocketAddr>,
}

fn recv_datagram(fd: RawFd, buf: &mut [u8], cmsg: &mut Vec<u8>) -> io::Result<Received> {
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<SockaddrStorage>(fd, &mut iov, Some(cmsg), MsgFlags::empty())?;

    let mut if_index = 0;
    for c in msg.cmsgs() {
        match c {
            ControlMessageOwned::Ipv4PacketInfo(info) => if_index = info.ipi_ifindex as u32,
            ControlMessageOwned::Ipv6PacketInfo(info) => if_index = info.ipi6_ifindex as u32,
            _ => {}
        }
    }
    let from = msg.address.as_ref().and_then(to_socket_addr);

    Ok(Received {
        len: msg.bytes,
        truncated: msg.flags.contains(MsgFlags::MSG_TRUNC),
        if_index,
        from,
    })
}

fn to_socket_addr(addr: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        Some(SocketAddr::V4(SocketAddrV4::from(*sin)))
    } else {
        addr.as_sockaddr_in6()
            .map(|sin6| SocketAddr::V6(SocketAddrV6::from(*sin6)))
    }
}

// Errors that will repeat on every call: the socket itself is gone.
fn is_fatal_receive_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF | libc::ENOTSOCK | libc::ENOTCONN | libc::EINVAL)
    )
}

async fn receive_pump(
    socket: Arc<UdpSocket>,
    family: Family,
    port: u16,
    inbound: mpsc::Sender<TaggedBytesMut>,
    cancel: CancellationToken,
) {
    let local_addr = match family {
        Family::V4 => SocketAddr::new(MDNS_MULTICAST_IPV4.into(), port),
        Family::V6 => SocketAddr::new(MDNS_MULTICAST_IPV6.into(), port),
    };
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut cmsg = nix::cmsg_space!(libc::in6_pktinfo);

    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.async_io(Interest::READABLE, || {
                recv_datagram(socket.as_raw_fd(), &mut buf, &mut cmsg)
            }) => res,
        };

        let received = match res {
            Ok(received) => received,
            Err(err) if is_fatal_receive_error(&err) => {
                warn!("mdns {family:?} receive failed, stopping: {err}");
                break;
            }
            Err(err) => {
                warn!("mdns {family:?} receive failed: {err}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => continue,
                }
            }
        };
        if received.truncated {
            debug!("mdns {family:?} dropped truncated datagram");
            continue;
        }

        let datagram = TaggedBytesMut {
            now: Instant::now(),
            transport: TransportContext {
                local_addr,
                peer_addr: received.from.unwrap_or(local_addr),
                if_index: received.if_index,
            },
            message: BytesMut::from(&buf[..received.len]),
        };
        trace!(
            "mdns {family:?} received {} bytes on interface {} from {}",
            received.len, datagram.transport.if_index, datagram.transport.peer_addr
        );
        if inbound.send(datagram).await.is_err() {
            debug!("mdns {family:?} inbound channel closed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_receive_errors() {
        for errno in [libc::EBADF, libc::ENOTSOCK, libc::ENOTCONN, libc::EINVAL] {
            assert!(is_fatal_receive_error(&io::Error::from_raw_os_error(errno)));
        }
        for errno in [libc::EINTR, libc::ENOBUFS, libc::ECONNREFUSED] {
            assert!(!is_fatal_receive_error(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_fatal_receive_error(&io::Error::from(io::ErrorKind::WouldBlock)));
    }

    #[tokio::test]
    async fn test_close_releases_sockets() -> Result<()> {
        let port = std::net::UdpSocket::bind("0.0.0.0:0")?.local_addr()?.port();
        let config = MdnsConfig::default().with_port(port);
        let (tx, _rx) = mpsc::channel(16);
        let transport = match MulticastTransport::bind(&config, tx.clone()) {
            Ok(transport) => transport,
            // No multicast capable interface on this host.
            Err(Error::ErrBadInterface) => return Ok(()),
            Err(err) => return Err(err),
        };
        let sockets = transport.sockets();
        assert!(!sockets.is_empty());

        transport.close().await?;
        assert!(sockets.iter().all(|socket| socket.upgrade().is_none()));
        assert_eq!(transport.send(b"x", 0), Err(Error::ErrTransportClosed));
        transport.close().await?;

        let rebound = MulticastTransport::bind(&config, tx)?;
        rebound.close().await?;
        Ok(())
    }
}
