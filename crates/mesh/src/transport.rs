use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MeshError, Result};
use crate::peer::PeerIdentity;
use crate::wire::{read_frame, write_frame, Frame, PROTOCOL_VERSION};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// What a link reports back to the session manager.
#[derive(Debug)]
pub enum LinkEvent {
    Data {
        peer: PeerIdentity,
        link_id: u64,
        text: String,
    },
    Down {
        peer: PeerIdentity,
        link_id: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct LinkTimings {
    pub keepalive_interval: Duration,
    pub liveness_timeout: Duration,
    pub send_queue: usize,
}

/// Open a TCP connection to `addr` and run the invite handshake.
///
/// Returns the stream once the remote has accepted. The remote must answer
/// as `expected`; anything else is a protocol error.
pub async fn dial(
    addr: SocketAddr,
    local: &PeerIdentity,
    expected: &PeerIdentity,
    service: &str,
    timeout: Duration,
) -> Result<TcpStream> {
    tokio::time::timeout(timeout, invite_handshake(addr, local, expected, service))
        .await
        .map_err(|_| MeshError::HandshakeTimeout(format!("{} at {}", expected, addr)))?
}

async fn invite_handshake(
    addr: SocketAddr,
    local: &PeerIdentity,
    expected: &PeerIdentity,
    service: &str,
) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, &Frame::invite(service, local.clone())).await?;

    match read_frame(&mut stream).await? {
        Some(Frame::Accept { from }) if &from == expected => Ok(stream),
        Some(Frame::Accept { from }) => Err(MeshError::ProtocolError(format!(
            "invited {} but {} answered",
            expected.id(),
            from.id()
        ))),
        Some(Frame::Reject { reason, .. }) => Err(MeshError::HandshakeRejected(reason)),
        Some(other) => Err(MeshError::ProtocolError(format!(
            "unexpected {} frame during handshake",
            other.name()
        ))),
        None => Err(MeshError::HandshakeRejected(
            "connection closed during handshake".to_string(),
        )),
    }
}

/// Read the opening `Invite` of an inbound connection.
pub async fn read_invite(
    stream: &mut TcpStream,
    service: &str,
    timeout: Duration,
) -> Result<PeerIdentity> {
    let frame = tokio::time::timeout(timeout, read_frame(stream))
        .await
        .map_err(|_| MeshError::HandshakeTimeout("no invite received".to_string()))??;

    match frame {
        Some(Frame::Invite {
            protocol_version,
            service: remote_service,
            from,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(MeshError::ProtocolError(format!(
                    "protocol version mismatch: expected {}, got {}",
                    PROTOCOL_VERSION, protocol_version
                )));
            }
            if remote_service != service {
                return Err(MeshError::ProtocolError(format!(
                    "service mismatch: expected {}, got {}",
                    service, remote_service
                )));
            }
            Ok(from)
        }
        Some(other) => Err(MeshError::ProtocolError(format!(
            "expected invite, got {}",
            other.name()
        ))),
        None => Err(MeshError::ProtocolError(
            "connection closed before invite".to_string(),
        )),
    }
}

/// An established session channel with one peer.
pub struct Link {
    id: u64,
    peer: PeerIdentity,
    initiator: String,
    outbound: mpsc::Sender<Frame>,
    detached: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Spawn reader and writer tasks over a handshaken stream.
    ///
    /// `initiator` is the id of the side that sent the invite.
    pub fn spawn(
        stream: TcpStream,
        peer: PeerIdentity,
        initiator: &str,
        timings: LinkTimings,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::channel(timings.send_queue.max(1));
        let detached = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(run_reader(
            read_half,
            peer.clone(),
            id,
            timings.liveness_timeout,
            Arc::clone(&detached),
            events,
        ));
        let writer = tokio::spawn(run_writer(
            write_half,
            rx,
            peer.clone(),
            timings.keepalive_interval,
        ));

        debug!("Link {} to {} up (initiated by {})", id, peer, initiator);

        Self {
            id,
            peer,
            initiator: initiator.to_string(),
            outbound,
            detached,
            reader,
            writer,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    /// Queue a frame without waiting for the socket.
    pub fn try_send(&self, frame: Frame) -> Result<()> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MeshError::TransmissionFailed(format!("send queue to {} is full", self.peer))
            }
            mpsc::error::TrySendError::Closed(_) => {
                MeshError::TransmissionFailed(format!("link to {} is closing", self.peer))
            }
        })
    }

    /// Stop reporting link loss but keep the socket open until the remote
    /// closes it or `timeout` passes. The remote gets the chance to move
    /// to its surviving link before this one disappears, and data it sent
    /// in the meantime is still delivered.
    pub fn drain(self, timeout: Duration) {
        self.detached.store(true, Ordering::SeqCst);
        debug!("Draining superseded link {} to {}", self.id, self.peer);
        tokio::spawn(async move {
            let Link {
                mut reader,
                writer,
                outbound,
                ..
            } = self;
            let _ = tokio::time::timeout(timeout, &mut reader).await;
            drop(outbound);
            reader.abort();
            writer.abort();
        });
    }

    /// Send `Bye` and wait up to `grace` for it to leave, then force-close.
    pub async fn close(self, grace: Duration) {
        self.detached.store(true, Ordering::SeqCst);
        let Link {
            id,
            peer,
            outbound,
            reader,
            mut writer,
            ..
        } = self;

        let _ = outbound.try_send(Frame::Bye);
        drop(outbound);

        if tokio::time::timeout(grace, &mut writer).await.is_err() {
            warn!("Link {} to {} did not close in {:?}, forcing", id, peer, grace);
            writer.abort();
        }
        reader.abort();
    }

    /// Drop the link without any goodbye.
    pub fn abort(self) {
        self.detached.store(true, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
    }
}

async fn run_reader(
    mut read_half: OwnedReadHalf,
    peer: PeerIdentity,
    link_id: u64,
    liveness_timeout: Duration,
    detached: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let reason = loop {
        match tokio::time::timeout(liveness_timeout, read_frame(&mut read_half)).await {
            Ok(Ok(Some(Frame::Data { text }))) => {
                let _ = events.send(LinkEvent::Data {
                    peer: peer.clone(),
                    link_id,
                    text,
                });
            }
            Ok(Ok(Some(Frame::Ping { .. }))) => {}
            Ok(Ok(Some(Frame::Bye))) => break "closed by peer".to_string(),
            Ok(Ok(Some(other))) => {
                debug!("Ignoring {} frame on link {} from {}", other.name(), link_id, peer);
            }
            Ok(Ok(None)) => break "connection closed".to_string(),
            Ok(Err(e)) => break e.to_string(),
            Err(_) => break format!("no traffic for {:?}", liveness_timeout),
        }
    };

    if !detached.load(Ordering::SeqCst) {
        let _ = events.send(LinkEvent::Down {
            peer,
            link_id,
            reason,
        });
    }
}

async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    peer: PeerIdentity,
    keepalive_interval: Duration,
) {
    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seq = 0u64;

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = keepalive.tick() => {
                seq += 1;
                Frame::Ping { seq }
            }
        };

        let is_bye = frame == Frame::Bye;
        match write_frame(&mut write_half, &frame).await {
            Ok(()) => {}
            // Rejected before any byte was written; the stream is intact.
            Err(e @ (MeshError::MessageTooLarge(_) | MeshError::SerializationError(_))) => {
                warn!("Dropping {} to {}: {}", frame.name(), peer, e);
                continue;
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", frame.name(), peer, e);
                break;
            }
        }
        if is_bye {
            break;
        }
    }
}
