//! TCP transport.
//!
//! The offering side binds a listener on an ephemeral port and advertises
//! `ip:port` candidates. Its session description is a random token. The
//! answering side dials the candidates in order and opens with a hello
//! frame naming both tokens; the offerer only activates the connection once
//! the matching answer has been supplied through `accept_answer`.
//!
//! Control frames (`HELLO`, `READY`, `BYE`) share the framing with session
//! frames but never reach the session.

use super::codec::{read_frame, write_frame};
use super::{LinkState, Transport, TransportEvent, TransportEvents};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HELLO_PREFIX: &str = "TALLY/1 HELLO ";
const READY_FRAME: &str = "TALLY/1 READY";
const BYE_FRAME: &str = "TALLY/1 BYE";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Endpoint = mpsc::UnboundedSender<TransportEvent>;

/// Network settings for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address the offering side listens on.
    pub bind_ip: IpAddr,
    /// Addresses to advertise. Empty means: detect the primary interface
    /// and add loopback.
    pub advertise: Vec<IpAddr>,
    /// Per-candidate dial timeout.
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise: Vec::new(),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl TcpConfig {
    /// Listens and advertises on loopback only.
    pub fn loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertise: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Hello {
    offer: String,
    answer: String,
}

#[derive(Default)]
struct Link {
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
    expected_answer: Option<String>,
    pending: Option<(TcpStream, String)>,
}

/// A [`Transport`] over a single TCP connection.
pub struct TcpTransport {
    config: TcpConfig,
    tx: Endpoint,
    rx: Option<TransportEvents>,
    link: Arc<Mutex<Link>>,
    listener: Option<JoinHandle<()>>,
    offer: Option<String>,
    answer: Option<String>,
    dial: Vec<SocketAddr>,
    closed: bool,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            tx,
            rx: Some(rx),
            link: Arc::new(Mutex::new(Link::default())),
            listener: None,
            offer: None,
            answer: None,
            dial: Vec::new(),
            closed: false,
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }

    /// Dials the offerer's candidates in order and sends the hello frame.
    async fn dial_offerer(&self) -> SyncResult<()> {
        let (Some(offer), Some(answer)) = (&self.offer, &self.answer) else {
            return Err(SyncError::TransportFailure("no offer to dial".into()));
        };
        let hello = serde_json::to_string(&Hello {
            offer: offer.clone(),
            answer: answer.clone(),
        })?;

        for addr in &self.dial {
            let connect = TcpStream::connect(addr);
            let stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Candidate {addr} unreachable: {e}");
                    continue;
                }
                Err(_) => {
                    debug!("Candidate {addr} timed out");
                    continue;
                }
            };

            let (read_half, mut write_half) = stream.into_split();
            if let Err(e) = write_frame(&mut write_half, &format!("{HELLO_PREFIX}{hello}")).await {
                debug!("Hello to {addr} failed: {e}");
                continue;
            }

            let mut link = self.link.lock().await;
            if let Some(old) = link.reader.take() {
                old.abort();
            }
            link.writer = Some(write_half);
            link.reader = Some(tokio::spawn(read_loop(read_half, self.tx.clone(), true)));
            info!("Dialed offerer at {addr}");
            return Ok(());
        }

        Err(SyncError::TransportFailure("no candidate reachable".into()))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Ok(mut link) = self.link.try_lock() {
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn take_events(&mut self) -> Option<TransportEvents> {
        self.rx.take()
    }

    async fn create_offer(&mut self) -> SyncResult<String> {
        let listener = TcpListener::bind((self.config.bind_ip, 0))
            .await
            .map_err(|e| SyncError::TransportFailure(format!("bind: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| SyncError::TransportFailure(format!("local addr: {e}")))?
            .port();

        let offer = random_token();
        for ip in candidate_ips(&self.config) {
            self.emit(TransportEvent::Candidate(SocketAddr::new(ip, port).to_string()));
        }
        self.emit(TransportEvent::GatheringComplete);
        info!("Listening for peer on port {port}");

        self.listener = Some(tokio::spawn(accept_loop(
            listener,
            offer.clone(),
            self.link.clone(),
            self.tx.clone(),
        )));
        self.offer = Some(offer.clone());
        Ok(offer)
    }

    async fn accept_offer(&mut self, offer: &str, candidates: &[String]) -> SyncResult<String> {
        self.dial = candidates.iter().filter_map(|c| c.parse().ok()).collect();
        if self.dial.is_empty() {
            return Err(SyncError::TransportFailure(
                "offer has no usable candidates".into(),
            ));
        }
        let answer = random_token();
        self.offer = Some(offer.to_string());
        self.answer = Some(answer.clone());

        self.emit(TransportEvent::GatheringComplete);
        self.emit(TransportEvent::StateChanged(LinkState::Connecting));
        self.dial_offerer().await?;
        Ok(answer)
    }

    async fn accept_answer(&mut self, answer: &str, _candidates: &[String]) -> SyncResult<()> {
        if self.listener.is_none() {
            return Err(SyncError::TransportFailure("no offer outstanding".into()));
        }
        let mut link = self.link.lock().await;
        link.expected_answer = Some(answer.to_string());
        activate(&mut link, &self.tx).await;
        Ok(())
    }

    async fn send(&mut self, frame: String) -> SyncResult<()> {
        let mut link = self.link.lock().await;
        let writer = link
            .writer
            .as_mut()
            .ok_or_else(|| SyncError::TransportFailure("not connected".into()))?;
        write_frame(writer, &frame)
            .await
            .map_err(|e| SyncError::TransportFailure(format!("write: {e}")))
    }

    async fn restart(&mut self) -> SyncResult<()> {
        if self.closed {
            return Ok(());
        }
        if self.listener.is_some() {
            // The answering side redials; the accept loop picks it up.
            debug!("Waiting for peer to redial");
            return Ok(());
        }
        if let Err(e) = self.dial_offerer().await {
            warn!("Redial failed: {e}");
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        let mut link = self.link.lock().await;
        if let Some(mut writer) = link.writer.take() {
            let _ = write_frame(&mut writer, BYE_FRAME).await;
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        link.pending = None;
    }
}

async fn accept_loop(listener: TcpListener, offer: String, link: Arc<Mutex<Link>>, tx: Endpoint) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {e}");
                let _ = tx.send(TransportEvent::StateChanged(LinkState::Failed));
                return;
            }
        };

        let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(frame)) => frame,
            _ => {
                debug!("No hello from {addr}");
                continue;
            }
        };
        let Some(hello) = frame
            .strip_prefix(HELLO_PREFIX)
            .and_then(|json| serde_json::from_str::<Hello>(json).ok())
        else {
            warn!("Dropping connection from {addr}: bad hello");
            continue;
        };
        if hello.offer != offer {
            warn!("Dropping connection from {addr}: hello for another session");
            continue;
        }

        debug!("Hello from {addr}");
        let mut guard = link.lock().await;
        guard.pending = Some((stream, hello.answer));
        activate(&mut guard, &tx).await;
    }
}

/// Promotes the pending connection once its answer token is expected.
async fn activate(link: &mut Link, tx: &Endpoint) {
    let Some(expected) = link.expected_answer.clone() else {
        return;
    };
    let Some((stream, answer)) = link.pending.take() else {
        return;
    };
    if answer != expected {
        warn!("Dropping connection: answer token does not match");
        return;
    }

    let (read_half, mut write_half) = stream.into_split();
    if let Err(e) = write_frame(&mut write_half, READY_FRAME).await {
        warn!("Ready frame failed: {e}");
        let _ = tx.send(TransportEvent::StateChanged(LinkState::Disconnected));
        return;
    }
    if let Some(old) = link.reader.take() {
        old.abort();
    }
    link.writer = Some(write_half);
    // Connected must be queued before any frame the reader forwards.
    let _ = tx.send(TransportEvent::StateChanged(LinkState::Connected));
    link.reader = Some(tokio::spawn(read_loop(read_half, tx.clone(), false)));
}

async fn read_loop(mut reader: OwnedReadHalf, tx: Endpoint, mut awaiting_ready: bool) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) if frame == READY_FRAME => {
                if awaiting_ready {
                    awaiting_ready = false;
                    let _ = tx.send(TransportEvent::StateChanged(LinkState::Connected));
                }
            }
            Ok(frame) if frame == BYE_FRAME => {
                let _ = tx.send(TransportEvent::StateChanged(LinkState::Closed));
                return;
            }
            Ok(frame) => {
                if tx.send(TransportEvent::Frame(frame)).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Link read ended: {e}");
                let _ = tx.send(TransportEvent::StateChanged(LinkState::Disconnected));
                return;
            }
        }
    }
}

fn random_token() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

fn candidate_ips(config: &TcpConfig) -> Vec<IpAddr> {
    if !config.advertise.is_empty() {
        return config.advertise.clone();
    }
    if !config.bind_ip.is_unspecified() {
        return vec![config.bind_ip];
    }
    let mut ips = Vec::new();
    if let Some(primary) = primary_ip() {
        ips.push(primary);
    }
    ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    ips
}

/// The address the OS would route outbound traffic from. Connecting a UDP
/// socket sends no packets.
fn primary_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}
