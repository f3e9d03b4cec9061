//! LAN transport: TCP listener and dialer, key handshake, encrypted packet frames, and a
//! side connection per payload.
//!
//! Connection layout:
//! 1. both sides send `[version(1) | device_id(16) | public_key(32)]`;
//! 2. each derives the X25519 session key and one key per direction;
//! 3. every frame after that is `len(4, LE) | ChaCha20-Poly1305(plaintext)` with a per-direction
//!    nonce counter; the first plaintext each way is the sender's identity packet.
//!
//! A packet with a payload carries `payloadTransferInfo.port`: the receiver connects there and
//! reads the payload as encrypted frames under a key bound to the packet id and port.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tether_core::identity::{
    decrypt_wire, derive_payload_key, derive_session_key, encrypt_wire, WireCryptoError,
};
use tether_core::wire::{LEN_SIZE, MAX_FRAME_LEN};
use tether_core::{
    decode_packet, encode_packet, Device, DeviceId, FrameDecodeError, FrameEncodeError, Keypair,
    Link, LinkError, LinkId, Packet, Payload, PayloadReader, PublicKey, TetherCore, TransferError,
    TransportKind, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::DialRequest;

const HANDSHAKE_SIZE: usize = 1 + 16 + 32; // version + device_id + public_key
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);
const PAYLOAD_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest wait for the next payload frame before the fetch fails.
const PAYLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const PAYLOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LanError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("timed out")]
    Timeout,
    #[error("crypto error: {0}")]
    Crypto(#[from] WireCryptoError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("payload error: {0}")]
    Payload(#[from] TransferError),
    #[error(transparent)]
    Core(#[from] tether_core::Error),
}

/// Keys for one connection. `session` seeds payload keys; `send`/`recv` protect packet frames.
#[derive(Clone)]
struct SessionKeys {
    session: [u8; 32],
    send: [u8; 32],
    recv: [u8; 32],
}

impl SessionKeys {
    fn derive(keypair: &Keypair, peer: &PublicKey, initiator: bool) -> Self {
        let session = derive_session_key(&keypair.shared_secret(peer));
        let dialer = direction_key(&session, b"dialer");
        let listener = direction_key(&session, b"listener");
        let (send, recv) = if initiator {
            (dialer, listener)
        } else {
            (listener, dialer)
        };
        Self {
            session,
            send,
            recv,
        }
    }
}

fn direction_key(session: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"tether-direction-v1");
    hasher.update(label);
    hasher.update(session);
    hasher.finalize().into()
}

fn handshake_bytes(keypair: &Keypair) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.device_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out
}

/// Check the peer's handshake and return the key it claims. Possession of the matching
/// secret is proven by the first frame decrypting.
fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE]) -> Result<PublicKey, LanError> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(LanError::Handshake(format!(
            "unsupported protocol version {}",
            buf[0]
        )));
    }
    let mut device_id = [0u8; 16];
    device_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    if DeviceId::from_public_key(&public_key) != DeviceId(device_id) {
        return Err(LanError::Handshake("device id does not match key".into()));
    }
    Ok(PublicKey(public_key))
}

async fn handshake(
    stream: &mut TcpStream,
    keypair: &Keypair,
    initiator: bool,
) -> Result<PublicKey, LanError> {
    let ours = handshake_bytes(keypair);
    let mut theirs = [0u8; HANDSHAKE_SIZE];
    if initiator {
        stream.write_all(&ours).await?;
        stream.flush().await?;
        stream.read_exact(&mut theirs).await?;
    } else {
        stream.read_exact(&mut theirs).await?;
        stream.write_all(&ours).await?;
        stream.flush().await?;
    }
    parse_handshake(&theirs)
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &[u8; 32],
    nonce: &mut u64,
    plain: &[u8],
) -> Result<(), LanError> {
    let cipher = encrypt_wire(key, *nonce, plain)?;
    *nonce = nonce.saturating_add(1);
    writer.write_all(&(cipher.len() as u32).to_le_bytes()).await?;
    writer.write_all(&cipher).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decrypt one frame. `None` on a clean end of stream between frames.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    key: &[u8; 32],
    nonce: &mut u64,
) -> Result<Option<Vec<u8>>, LanError> {
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge.into());
    }
    let mut cipher = vec![0u8; len as usize];
    reader.read_exact(&mut cipher).await?;
    let plain = decrypt_wire(key, *nonce, &cipher)?;
    *nonce = nonce.saturating_add(1);
    Ok(Some(plain))
}

/// One authenticated TCP connection to a peer.
pub struct LanLink {
    id: LinkId,
    peer_key: PublicKey,
    peer_addr: SocketAddr,
    session: [u8; 32],
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

impl LanLink {
    /// Give an inbound packet that announces a payload a stream fetched from the sender.
    fn attach_payload(&self, packet: Packet) -> Packet {
        let Some(size) = packet.payload_size() else {
            return packet;
        };
        let port = packet
            .payload_transfer_info()
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok());
        let Some(port) = port else {
            warn!(link = %self.id, packet_type = packet.packet_type(), "payload without a port");
            return packet;
        };
        let key = derive_payload_key(&self.session, packet.id(), port);
        let addr = SocketAddr::new(self.peer_addr.ip(), port);
        let payload = Payload::deferred(
            u64::try_from(size).ok(),
            Box::new(move || open_remote_payload(addr, key, PAYLOAD_IDLE_TIMEOUT).boxed()),
        )
        .with_source_token(self.closed.child_token());
        packet.with_payload(payload)
    }

    /// Serve `payload` on a fresh port and return the packet announcing it.
    async fn offer_payload(&self, packet: &Packet, payload: Arc<Payload>) -> Result<Packet, LinkError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();
        let key = derive_payload_key(&self.session, packet.id(), port);
        tokio::spawn(serve_payload(
            listener,
            self.peer_addr.ip(),
            payload,
            key,
            self.closed.child_token(),
        ));
        let mut info = Map::new();
        info.insert("port".into(), Value::from(port));
        Ok(packet.clone().with_payload_transfer_info(info))
    }
}

#[async_trait]
impl Link for LanLink {
    fn id(&self) -> &LinkId {
        &self.id
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Lan
    }

    fn peer_key(&self) -> &PublicKey {
        &self.peer_key
    }

    async fn send(&self, packet: &Packet) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let packet = match packet.payload() {
            Some(payload) => self.offer_payload(packet, Arc::clone(payload)).await?,
            None => packet.clone(),
        };
        let frame = encode_packet(&packet)?;
        self.outbound.send(frame).map_err(|_| LinkError::Closed)
    }

    fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }
}

async fn open_remote_payload(
    addr: SocketAddr,
    key: [u8; 32],
    idle: Duration,
) -> io::Result<PayloadReader> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "payload connect timed out"))??;
    let chunks = futures::stream::unfold(Some((stream, 0u64)), move |state| async move {
        let Some((mut stream, mut nonce)) = state else {
            return None;
        };
        match timeout(idle, read_frame(&mut stream, &key, &mut nonce)).await {
            Ok(Ok(Some(chunk))) => Some((Ok(VecDeque::from(chunk)), Some((stream, nonce)))),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => Some((
                Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
                None,
            )),
            Err(_) => Some((
                Err(io::Error::new(io::ErrorKind::TimedOut, "payload stalled")),
                None,
            )),
        }
    });
    let reader: PayloadReader = Box::new(StreamReader::new(Box::pin(chunks)));
    Ok(reader)
}

async fn serve_payload(
    listener: TcpListener,
    peer_ip: IpAddr,
    payload: Arc<Payload>,
    key: [u8; 32],
    closed: CancellationToken,
) {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    let accepted = tokio::select! {
        _ = closed.cancelled() => return,
        accepted = timeout(PAYLOAD_ACCEPT_TIMEOUT, accept_from(&listener, peer_ip)) => accepted,
    };
    let stream = match accepted {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(port, error = %e, "payload accept failed");
            return;
        }
        Err(_) => {
            debug!(port, "payload was never fetched");
            return;
        }
    };
    drop(listener);
    tokio::select! {
        _ = closed.cancelled() => debug!(port, "link closed during payload upload"),
        result = upload(stream, &payload, &key) => match result {
            Ok(()) => debug!(port, "payload sent"),
            Err(e) => warn!(port, error = %e, "payload upload failed"),
        },
    }
}

async fn accept_from(listener: &TcpListener, peer_ip: IpAddr) -> io::Result<TcpStream> {
    loop {
        let (stream, from) = listener.accept().await?;
        if from.ip() == peer_ip {
            return Ok(stream);
        }
        debug!(from = %from, "ignoring payload connection from another host");
    }
}

async fn upload(mut stream: TcpStream, payload: &Payload, key: &[u8; 32]) -> Result<(), LanError> {
    let mut reader = payload.open().await?;
    let mut buf = vec![0u8; PAYLOAD_CHUNK];
    let mut nonce = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_frame(&mut stream, key, &mut nonce, &buf[..n]).await?;
    }
    stream.shutdown().await?;
    Ok(())
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    key: [u8; 32],
    mut nonce: u64,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
) {
    loop {
        let plain = tokio::select! {
            _ = closed.cancelled() => break,
            next = outbound.recv() => match next {
                Some(plain) => plain,
                None => break,
            },
        };
        if let Err(e) = write_frame(&mut writer, &key, &mut nonce, &plain).await {
            debug!(error = %e, "write failed");
            break;
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    key: [u8; 32],
    mut nonce: u64,
    inbound: mpsc::UnboundedSender<Packet>,
    link: Arc<LanLink>,
) {
    let closed = link.closed.clone();
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = read_frame(&mut reader, &key, &mut nonce) => frame,
        };
        let plain = match frame {
            Ok(Some(plain)) => plain,
            Ok(None) => {
                debug!(link = %link.id, "peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(link = %link.id, error = %e, "dropping connection");
                break;
            }
        };
        let packet = match decode_packet(&plain) {
            Ok((packet, _)) => link.attach_payload(packet),
            Err(e) => {
                warn!(link = %link.id, error = %e, "malformed packet");
                continue;
            }
        };
        if inbound.send(packet).is_err() {
            break;
        }
    }
    closed.cancel();
}

/// Accepts and dials TCP connections and hands authenticated links to the core.
pub struct LanTransport {
    core: Arc<TetherCore>,
    listen_port: u16,
    dialing: Mutex<HashSet<DeviceId>>,
}

impl LanTransport {
    /// `listen_port` is announced to peers in the identity packet.
    pub fn new(core: Arc<TetherCore>, listen_port: u16) -> Arc<Self> {
        Arc::new(Self {
            core,
            listen_port,
            dialing: Mutex::new(HashSet::new()),
        })
    }

    /// Accept on `listener` and dial every peer pushed to `connect_rx` until the listener fails.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut connect_rx: mpsc::UnboundedReceiver<DialRequest>,
    ) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "lan transport listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.establish(stream, addr, None).await {
                            debug!(peer = %addr, error = %e, "inbound connection failed");
                        }
                    });
                }
                Some(request) = connect_rx.recv() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        let addr = request.addr;
                        if let Err(e) = this.connect(request).await {
                            debug!(peer = %addr, error = %e, "dial failed");
                        }
                    });
                }
            }
        }
    }

    /// Dial a discovered peer. A dial to a device already being dialed is skipped.
    pub async fn connect(self: &Arc<Self>, request: DialRequest) -> Result<Option<Arc<Device>>, LanError> {
        let inserted = self
            .dialing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.device_id);
        if !inserted {
            return Ok(None);
        }
        let result = self.dial(&request).await;
        self.dialing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request.device_id);
        result.map(Some)
    }

    async fn dial(self: &Arc<Self>, request: &DialRequest) -> Result<Arc<Device>, LanError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(request.addr))
            .await
            .map_err(|_| LanError::Timeout)??;
        self.establish(stream, request.addr, Some(&request.public_key))
            .await
    }

    async fn establish(
        self: &Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        expected: Option<&PublicKey>,
    ) -> Result<Arc<Device>, LanError> {
        let initiator = expected.is_some();
        let peer_key = handshake(&mut stream, self.core.keypair(), initiator).await?;
        if let Some(expected) = expected {
            if &peer_key != expected {
                return Err(LanError::Handshake("peer presented a different key".into()));
            }
        }
        stream.set_nodelay(true)?;
        let keys = SessionKeys::derive(self.core.keypair(), &peer_key, initiator);
        let (mut reader, mut writer) = stream.into_split();

        let mut send_nonce = 0u64;
        let mut recv_nonce = 0u64;
        let ours = encode_packet(&self.core.identity_packet(Some(self.listen_port)))?;
        write_frame(&mut writer, &keys.send, &mut send_nonce, &ours).await?;
        let theirs = timeout(
            IDENTITY_TIMEOUT,
            read_frame(&mut reader, &keys.recv, &mut recv_nonce),
        )
        .await
        .map_err(|_| LanError::Timeout)??
        .ok_or_else(|| LanError::Handshake("closed before identity".into()))?;
        let (identity, _) = decode_packet(&theirs)?;

        let closed = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let link = Arc::new(LanLink {
            id: LinkId::generate(),
            peer_key,
            peer_addr: addr,
            session: keys.session,
            outbound: out_tx,
            closed: closed.clone(),
        });
        tokio::spawn(write_loop(writer, keys.send, send_nonce, out_rx, closed));
        tokio::spawn(read_loop(reader, keys.recv, recv_nonce, in_tx, Arc::clone(&link)));

        let device = self.core.add_link(&identity, link.clone(), in_rx).await?;
        info!(device = %device.id(), peer = %addr, link = %link.id, "lan link up");
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::plugins::builtin;
    use tether_core::protocol::PACKET_TYPE_NOTIFICATION;
    use tether_core::{CoreConfig, DeviceEvent, MemoryTrustStore, NotificationSink, NotificationView};
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct CollectSink(Mutex<Vec<NotificationView>>);

    impl CollectSink {
        fn shown(&self) -> Vec<NotificationView> {
            self.0.lock().unwrap().clone()
        }
    }

    impl NotificationSink for CollectSink {
        fn show(&self, view: &NotificationView) {
            self.0.lock().unwrap().push(view.clone());
        }
        fn close(&self, _key: &str) {}
    }

    fn node(name: &str, config: CoreConfig, sink: Arc<CollectSink>) -> Arc<TetherCore> {
        TetherCore::new(
            Keypair::generate(),
            CoreConfig {
                device_name: name.into(),
                ..config
            },
            Arc::new(MemoryTrustStore::new()),
            builtin(sink),
        )
        .unwrap()
    }

    /// Start a listening transport for `core` on an ephemeral loopback port.
    async fn listen(core: Arc<TetherCore>) -> (SocketAddr, mpsc::UnboundedSender<DialRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(LanTransport::new(core, addr.port()).run(listener, rx));
        (addr, tx)
    }

    fn dial_request(core: &TetherCore, addr: SocketAddr) -> DialRequest {
        DialRequest {
            device_id: core.device_id(),
            public_key: core.keypair().public_key().clone(),
            addr,
        }
    }

    async fn wait_for(events: &mut broadcast::Receiver<DeviceEvent>, want: DeviceEvent) {
        timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if event == want => return,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn direction_keys_mirror() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let dialer = SessionKeys::derive(&a, b.public_key(), true);
        let listener = SessionKeys::derive(&b, a.public_key(), false);
        assert_eq!(dialer.session, listener.session);
        assert_eq!(dialer.send, listener.recv);
        assert_eq!(dialer.recv, listener.send);
        assert_ne!(dialer.send, dialer.recv);
    }

    #[test]
    fn handshake_rejects_forged_id() {
        let kp = Keypair::generate();
        let mut bytes = handshake_bytes(&kp);
        assert_eq!(parse_handshake(&bytes).unwrap(), *kp.public_key());
        bytes[1] ^= 0xff;
        assert!(matches!(parse_handshake(&bytes), Err(LanError::Handshake(_))));
        let mut bytes = handshake_bytes(&kp);
        bytes[0] = PROTOCOL_VERSION.wrapping_add(1);
        assert!(matches!(parse_handshake(&bytes), Err(LanError::Handshake(_))));
    }

    #[tokio::test]
    async fn frames_need_the_right_key_and_order() {
        let key = [7u8; 32];
        let (mut a, mut b) = tokio::io::duplex(4096);
        let mut send_nonce = 0;
        write_frame(&mut a, &key, &mut send_nonce, b"first").await.unwrap();
        write_frame(&mut a, &key, &mut send_nonce, b"second").await.unwrap();
        drop(a);

        let mut recv_nonce = 0;
        assert_eq!(
            read_frame(&mut b, &key, &mut recv_nonce).await.unwrap().as_deref(),
            Some(&b"first"[..])
        );
        assert_eq!(
            read_frame(&mut b, &key, &mut recv_nonce).await.unwrap().as_deref(),
            Some(&b"second"[..])
        );
        assert!(read_frame(&mut b, &key, &mut recv_nonce).await.unwrap().is_none());

        let (mut a, mut b) = tokio::io::duplex(4096);
        let mut send_nonce = 0;
        write_frame(&mut a, &key, &mut send_nonce, b"hello").await.unwrap();
        let mut recv_nonce = 0;
        assert!(matches!(
            read_frame(&mut b, &[8u8; 32], &mut recv_nonce).await,
            Err(LanError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn stalled_payload_sender_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let key = [3u8; 32];
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut nonce = 0;
            write_frame(&mut stream, &key, &mut nonce, b"partial").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut reader = open_remote_payload(addr, key, Duration::from_millis(100))
            .await
            .unwrap();
        let mut buf = Vec::new();
        let err = timeout(Duration::from_secs(2), reader.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        server.abort();
    }

    #[tokio::test]
    async fn dial_with_wrong_expected_key_fails() {
        let listener_core = node("desktop", CoreConfig::default(), Arc::default());
        let dialer_core = node("laptop", CoreConfig::default(), Arc::default());
        let (addr, _tx) = listen(listener_core.clone()).await;
        let dialer = LanTransport::new(dialer_core.clone(), 0);

        let mut request = dial_request(&listener_core, addr);
        request.public_key = Keypair::generate().public_key().clone();
        assert!(matches!(
            dialer.connect(request).await,
            Err(LanError::Handshake(_))
        ));
        assert!(dialer_core.devices(false, false).await.is_empty());
    }

    #[tokio::test]
    async fn pair_and_fetch_payload_over_tcp() {
        let cache = tempfile::tempdir().unwrap();
        let desktop_sink = Arc::new(CollectSink::default());
        let desktop = node(
            "desktop",
            CoreConfig {
                icon_cache_dir: cache.path().to_path_buf(),
                ..CoreConfig::default()
            },
            desktop_sink.clone(),
        );
        let phone = node("Phone1", CoreConfig::default(), Arc::default());
        let (desktop_addr, _tx) = listen(desktop.clone()).await;

        let phone_transport = LanTransport::new(phone.clone(), 0);
        let desktop_on_phone = phone_transport
            .connect(dial_request(&desktop, desktop_addr))
            .await
            .unwrap()
            .unwrap();
        assert!(desktop_on_phone.is_reachable().await);
        assert_eq!(desktop_on_phone.name().await, "desktop");
        assert_eq!(
            desktop_on_phone.available_links().await[0].1,
            TransportKind::Lan
        );

        let phone_id = phone.device_id();
        eventually(|| {
            let desktop = desktop.clone();
            async move {
                match desktop.device(&phone_id).await {
                    Some(d) => d.is_reachable().await,
                    None => false,
                }
            }
        })
        .await;
        let phone_on_desktop = desktop.device(&phone_id).await.unwrap();

        let mut desktop_events = phone_on_desktop.subscribe();
        let mut phone_events = desktop_on_phone.subscribe();
        desktop_on_phone.request_pair().await.unwrap();
        wait_for(&mut desktop_events, DeviceEvent::PairingRequest).await;
        phone_on_desktop.accept_pairing().await;
        wait_for(&mut phone_events, DeviceEvent::TrustedChanged(true)).await;

        let icon = b"\x89PNG not really".repeat(10_000);
        desktop_on_phone
            .send_packet(
                &Packet::new(PACKET_TYPE_NOTIFICATION)
                    .with_field("id", "42")
                    .with_field("appName", "Chat")
                    .with_field("text", "over the wire")
                    .with_field("payloadHash", "cafebabe")
                    .with_payload(Payload::from_bytes(icon.clone())),
            )
            .await
            .unwrap();
        eventually(|| {
            let sink = desktop_sink.clone();
            async move { sink.shown().iter().any(|v| v.text.contains("over the wire")) }
        })
        .await;
        let path = cache.path().join("cafebabe");
        let shown = desktop_sink.shown();
        let view = shown.iter().find(|v| v.app_name == "Chat").unwrap();
        assert_eq!(view.icon.as_deref(), Some(path.as_path()));
        assert_eq!(std::fs::read(&path).unwrap(), icon);
    }

    #[tokio::test]
    async fn closing_the_link_makes_device_unreachable() {
        let desktop = node("desktop", CoreConfig::default(), Arc::default());
        let phone = node("Phone1", CoreConfig::default(), Arc::default());
        let (addr, _tx) = listen(desktop.clone()).await;
        let desktop_on_phone = LanTransport::new(phone.clone(), 0)
            .connect(dial_request(&desktop, addr))
            .await
            .unwrap()
            .unwrap();
        let phone_id = phone.device_id();
        eventually(|| {
            let desktop = desktop.clone();
            async move { desktop.device(&phone_id).await.is_some() }
        })
        .await;

        let mut events = desktop_on_phone.subscribe();
        let (link_id, _) = desktop_on_phone.available_links().await.remove(0);
        desktop_on_phone.remove_link(&link_id).await;
        wait_for(&mut events, DeviceEvent::ReachableChanged(false)).await;
        eventually(|| {
            let desktop = desktop.clone();
            async move { desktop.device(&phone_id).await.is_none() }
        })
        .await;
    }
}
