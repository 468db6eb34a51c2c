use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::bandwidth::BandwidthEstimator;
use crate::codec::NodeCodec;
use crate::error::TesseraError;
use crate::message::Command;
use crate::packet::Packet;
use crate::transmit::{ImageSink, LinkInfo, SendToken};

/// Interval between keepalive pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Depth of the user <-> network packet channels.
const CHANNEL_DEPTH: usize = 100;

// ── Link state ───────────────────────────────────────────────────

/// Bandwidth knowledge shared by a connection and its senders.
#[derive(Debug, Default)]
struct LinkState {
    /// KiB/s announced for the peer, 0 if none.
    advertised: AtomicU64,
    measured: Mutex<BandwidthEstimator>,
}

impl LinkState {
    fn info(&self) -> LinkInfo {
        let advertised = self.advertised.load(Ordering::Relaxed);
        if advertised != 0 {
            return LinkInfo::new(advertised);
        }
        let measured = self
            .measured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .estimate_kibps();
        LinkInfo::new(measured)
    }

    fn record(&self, bytes: u64) {
        self.measured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(bytes);
    }
}

// ── Connection ───────────────────────────────────────────────────

/// A framed TCP connection to one peer node.
///
/// Background tasks own the socket: a writer draining the outgoing
/// channel, a reader filling the incoming one and a heartbeat. Pings
/// are consumed by the reader and never surface through [`recv`].
///
/// [`recv`]: Connection::recv
#[derive(Debug)]
pub struct Connection {
    /// Channel to the background writer task.
    tx: mpsc::Sender<Packet>,
    /// Channel from the background reader task.
    rx: mpsc::Receiver<Packet>,
    link: Arc<LinkState>,
    token: SendToken,
    peer: String,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let _ = stream.set_nodelay(true);
        let (mut net_writer, mut net_reader) = Framed::new(stream, NodeCodec).split();

        // User -> Network
        let (user_tx, mut network_rx) = mpsc::channel::<Packet>(CHANNEL_DEPTH);

        // Network -> User
        let (network_tx, user_rx) = mpsc::channel(CHANNEL_DEPTH);

        let link = Arc::new(LinkState::default());

        // Writer task: User -> Network
        let writer_link = Arc::clone(&link);
        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(packet) = network_rx.recv().await {
                let len = packet.encoded_len() as u64;
                if let Err(e) = net_writer.send(packet).await {
                    warn!(peer = %writer_peer, "network write error: {e}");
                    break;
                }
                writer_link.record(len);
            }
            let _ = net_writer.close().await;
            debug!(peer = %writer_peer, "writer task stopped");
        });

        // Reader task: Network -> User
        let reader_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(packet) if matches!(packet.command(), Ok(Command::Ping)) => {
                        trace!(peer = %reader_peer, "heartbeat");
                    }
                    Ok(packet) => {
                        if network_tx.send(packet).await.is_err() {
                            // receiver dropped
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(peer = %reader_peer, "network read error: {e}");
                        break;
                    }
                }
            }
            debug!(peer = %reader_peer, "reader task stopped");
        });

        // Heartbeat, alive while any user-side sender is
        let heartbeat_tx = user_tx.downgrade();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
            let mut interval = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                let Some(tx) = heartbeat_tx.upgrade() else {
                    break;
                };
                if tx.send(Packet::heartbeat()).await.is_err() {
                    break;
                }
            }
        });

        Self {
            tx: user_tx,
            rx: user_rx,
            link,
            token: SendToken::new(),
            peer,
        }
    }

    pub async fn connect(info: &ConnectionInfo) -> Result<Self, TesseraError> {
        let stream = TcpStream::connect(info.to_string()).await?;
        Ok(Self::new(stream))
    }

    pub async fn send(&self, packet: Packet) -> Result<(), TesseraError> {
        self.tx.send(packet).await?;
        Ok(())
    }

    /// Next non-heartbeat packet, `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Cloneable handle usable as a transmit destination.
    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            tx: self.tx.clone(),
            token: self.token.clone(),
            link: Arc::clone(&self.link),
            peer: self.peer.clone(),
            ordered: true,
        }
    }

    /// Announce the peer's bandwidth in KiB/s. `0` falls back to the
    /// measured throughput.
    pub fn set_bandwidth(&self, kibps: u64) {
        self.link.advertised.store(kibps, Ordering::Relaxed);
    }

    pub fn link(&self) -> LinkInfo {
        self.link.info()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

// ── ConnectionSender ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectionSender {
    tx: mpsc::Sender<Packet>,
    token: SendToken,
    link: Arc<LinkState>,
    peer: String,
    /// Whether image payloads take the connection's shared send token.
    ordered: bool,
}

impl ConnectionSender {
    /// Let concurrent transmitters interleave their images on this
    /// connection instead of queueing on the send token.
    pub fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }
}

#[async_trait]
impl ImageSink for ConnectionSender {
    fn name(&self) -> String {
        self.peer.clone()
    }

    fn link(&self) -> LinkInfo {
        self.link.info()
    }

    fn send_token(&self) -> SendToken {
        if self.ordered {
            self.token.clone()
        } else {
            SendToken::new()
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), TesseraError> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| TesseraError::Unreachable {
                node: self.peer.clone(),
                reason: "connection closed".into(),
            })
    }
}

// ── ConnectionInfo ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    ip: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// ── Tests ────────────────────────────────────────────────────────
