//! LAN discovery: UDP multicast beacon, parse beacons/responses, maintain peer list and ask
//! the LAN transport to dial peers we are responsible for connecting to.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_core::{decode_frame, encode_frame, DeviceId, Message, PublicKey, TetherCore, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

/// A peer the transport should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub addr: SocketAddr,
}

struct PeerState {
    addr: SocketAddr,
    last_seen: Instant,
}

/// A validated announcement from another device.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Announcement {
    device_id: DeviceId,
    public_key: PublicKey,
    device_name: String,
    addr: SocketAddr,
    is_beacon: bool,
}

pub async fn run_discovery(
    core: Arc<TetherCore>,
    discovery_port: u16,
    transport_port: u16,
    connect_tx: mpsc::UnboundedSender<DialRequest>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port).await?);
    let peers: Arc<Mutex<HashMap<DeviceId, PeerState>>> = Arc::new(Mutex::new(HashMap::new()));
    info!(group = %MULTICAST_GROUP, port = discovery_port, "discovery running");

    let beacon = Message::Beacon {
        protocol_version: PROTOCOL_VERSION,
        device_id: core.device_id(),
        public_key: core.keypair().public_key().clone(),
        device_name: core.config().device_name.clone(),
        listen_port: transport_port,
    };
    let response = Message::DiscoveryResponse {
        protocol_version: PROTOCOL_VERSION,
        device_id: core.device_id(),
        public_key: core.keypair().public_key().clone(),
        device_name: core.config().device_name.clone(),
        listen_port: transport_port,
    };

    let beacon_task = tokio::spawn(beacon_loop(socket.clone(), beacon, discovery_port));
    let recv_task = tokio::spawn(recv_loop(socket, peers.clone(), core, response, connect_tx));
    let timeout_task = tokio::spawn(peer_timeout_loop(peers));

    tokio::select! {
        r = beacon_task => r.map_err(std::io::Error::other)?,
        r = recv_task => r.map_err(std::io::Error::other)?,
        r = timeout_task => r.map_err(std::io::Error::other)?,
    }
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(socket: Arc<UdpSocket>, beacon: Message, discovery_port: u16) -> std::io::Result<()> {
    let frame = encode_frame(&beacon)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, discovery_port));
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<HashMap<DeviceId, PeerState>>>,
    core: Arc<TetherCore>,
    response: Message,
    connect_tx: mpsc::UnboundedSender<DialRequest>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    let my_id = core.device_id();
    let response_frame = encode_frame(&response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok((msg, _)) = decode_frame(&buf[..n]) else {
            continue;
        };
        let Some(peer) = announcement(msg, from, my_id) else {
            continue;
        };
        let is_new = peers
            .lock()
            .await
            .insert(
                peer.device_id,
                PeerState {
                    addr: peer.addr,
                    last_seen: Instant::now(),
                },
            )
            .is_none();
        if is_new {
            info!(device = %peer.device_id, name = %peer.device_name, addr = %peer.addr, "peer discovered");
        }
        if peer.is_beacon {
            if let Err(e) = socket.send_to(&response_frame, from).await {
                debug!(error = %e, "discovery response failed");
            }
        }
        if should_dial(my_id, peer.device_id) && !is_connected(&core, &peer.device_id).await {
            let _ = connect_tx.send(DialRequest {
                device_id: peer.device_id,
                public_key: peer.public_key,
                addr: peer.addr,
            });
        }
    }
}

async fn is_connected(core: &TetherCore, id: &DeviceId) -> bool {
    match core.device(id).await {
        Some(device) => device.is_reachable().await,
        None => false,
    }
}

/// Only one side of each pair dials: the one with the smaller id.
fn should_dial(my_id: DeviceId, peer_id: DeviceId) -> bool {
    my_id < peer_id
}

fn announcement(msg: Message, from: SocketAddr, my_id: DeviceId) -> Option<Announcement> {
    let (is_beacon, protocol_version, device_id, public_key, device_name, listen_port) = match msg {
        Message::Beacon {
            protocol_version,
            device_id,
            public_key,
            device_name,
            listen_port,
        } => (true, protocol_version, device_id, public_key, device_name, listen_port),
        Message::DiscoveryResponse {
            protocol_version,
            device_id,
            public_key,
            device_name,
            listen_port,
        } => (false, protocol_version, device_id, public_key, device_name, listen_port),
    };
    if protocol_version != PROTOCOL_VERSION || device_id == my_id {
        return None;
    }
    if DeviceId::from_public_key(public_key.as_bytes()) != device_id {
        warn!(from = %from, claimed = %device_id, "announcement id does not match its key");
        return None;
    }
    Some(Announcement {
        device_id,
        public_key,
        device_name,
        addr: SocketAddr::new(from.ip(), listen_port),
        is_beacon,
    })
}

async fn peer_timeout_loop(peers: Arc<Mutex<HashMap<DeviceId, PeerState>>>) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        peers.lock().await.retain(|id, state| {
            let alive = now.duration_since(state.last_seen) < PEER_TIMEOUT;
            if !alive {
                debug!(device = %id, addr = %state.addr, "peer stopped announcing");
            }
            alive
        });
    }
}
