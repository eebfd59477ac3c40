//! Broadcast-based peer discovery.
//!
//! A listening device beacons its connection descriptor to the LAN's
//! broadcast address on a well-known UDP port every few seconds; anyone
//! on the discovery port collects the descriptors it hears. There is no
//! expiry: a peer stays listed until the listener is dropped, and the
//! connect attempt is what proves liveness.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{timeouts, DISCOVERY_PORT};
use crate::url::PeerDescriptor;

#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub descriptor: PeerDescriptor,
    /// Source address of the datagram, which may differ from the host
    /// the beacon advertises.
    pub from: SocketAddr,
}

/// First non-loopback IPv4 address, used to build our own descriptor.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    if_addrs::get_if_addrs().ok()?.into_iter().find_map(|iface| {
        if iface.is_loopback() {
            return None;
        }
        match iface.addr {
            if_addrs::IfAddr::V4(v4) => Some(v4.ip),
            _ => None,
        }
    })
}

/// Subnet broadcast address of the first usable interface. Derived from
/// the netmask when the OS does not report one, with the limited
/// broadcast address as the last resort.
fn broadcast_ipv4() -> Ipv4Addr {
    if let Ok(ifaces) = if_addrs::get_if_addrs() {
        for iface in ifaces {
            if iface.is_loopback() {
                continue;
            }
            if let if_addrs::IfAddr::V4(v4) = iface.addr {
                if let Some(b) = v4.broadcast {
                    return b;
                }
                let ip = u32::from(v4.ip);
                let mask = u32::from(v4.netmask);
                if mask != 0 {
                    return Ipv4Addr::from(ip | !mask);
                }
            }
        }
    }
    Ipv4Addr::BROADCAST
}

/// Periodic beacon task. Dropping the handle stops the beacons.
pub struct Advertiser {
    handle: JoinHandle<()>,
}

impl Advertiser {
    pub fn start(payload: String) -> Self {
        Self::start_to(payload, IpAddr::V4(broadcast_ipv4()), DISCOVERY_PORT)
    }

    /// Beacon to an explicit target, which lets tests stay on loopback.
    pub fn start_to(payload: String, target: IpAddr, port: u16) -> Self {
        let handle = tokio::spawn(async move {
            let sock = match beacon_socket().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "could not open beacon socket, discovery disabled");
                    return;
                }
            };
            info!(%target, port, "advertising {payload}");
            loop {
                if let Err(e) = sock.send_to(payload.as_bytes(), (target, port)).await {
                    debug!(error = %e, "discovery beacon failed");
                }
                tokio::time::sleep(timeouts::BEACON_INTERVAL).await;
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn beacon_socket() -> Result<UdpSocket> {
    let sock = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .context("bind beacon socket")?;
    sock.set_broadcast(true).context("enable broadcast")?;
    Ok(sock)
}

/// Collects descriptors heard on the discovery port, deduplicated by
/// device name (a device that rebinds keeps updating in place).
pub struct DiscoveryListener {
    peers: Arc<Mutex<Vec<DiscoveredPeer>>>,
    rx: mpsc::UnboundedReceiver<DiscoveredPeer>,
    handle: JoinHandle<()>,
}

impl DiscoveryListener {
    pub async fn bind() -> Result<Self> {
        Self::bind_port(DISCOVERY_PORT).await
    }

    pub async fn bind_port(port: u16) -> Result<Self> {
        let std_sock = reusable_udp_socket(port)
            .with_context(|| format!("bind discovery port {port}"))?;
        let sock = UdpSocket::from_std(std_sock).context("register discovery socket")?;
        let peers = Arc::new(Mutex::new(Vec::<DiscoveredPeer>::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        let task_peers = peers.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (n, from) = match sock.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "discovery receive failed");
                        break;
                    }
                };
                let text = String::from_utf8_lossy(&buf[..n]);
                match PeerDescriptor::parse(&text) {
                    Ok(descriptor) => {
                        let peer = DiscoveredPeer { descriptor, from };
                        let mut peers = task_peers.lock();
                        match peers
                            .iter_mut()
                            .find(|p| p.descriptor.name == peer.descriptor.name)
                        {
                            Some(existing) => *existing = peer,
                            None => {
                                debug!(name = %peer.descriptor.name, %from, "discovered peer");
                                peers.push(peer.clone());
                                let _ = tx.send(peer);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(%from, error = %e, "ignoring malformed discovery datagram")
                    }
                }
            }
        });

        Ok(Self { peers, rx, handle })
    }

    /// Everything heard so far.
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.lock().clone()
    }

    /// Next newly discovered peer. Repeat beacons from a known device do
    /// not produce entries here.
    pub async fn next(&mut self) -> Option<DiscoveredPeer> {
        self.rx.recv().await
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Discovery shares its port with other local listeners, so bind with
/// SO_REUSEADDR rather than exclusively.
fn reusable_udp_socket(port: u16) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    sock.bind(&addr.into())?;
    Ok(sock.into())
}
