use async_trait::async_trait;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::discovery::{multicast_sender, DiscoveryService};
use crate::error::Result;
use crate::peer::PeerIdentity;
use crate::transport::read_invite;
use crate::wire::Beacon;

/// A remote node asking for a session. Resolved by the session manager,
/// which answers on the carried connection.
#[derive(Debug)]
pub struct InboundInvite {
    from: PeerIdentity,
    stream: TcpStream,
}

impl InboundInvite {
    pub fn new(from: PeerIdentity, stream: TcpStream) -> Self {
        Self { from, stream }
    }

    pub fn from(&self) -> &PeerIdentity {
        &self.from
    }

    pub(crate) fn into_stream(self) -> TcpStream {
        self.stream
    }
}

#[derive(Debug)]
pub enum AdvertiserEvent {
    InviteReceived(InboundInvite),
}

/// Makes this node reachable: accepts invites on the session listener and
/// multicasts beacons carrying the listener port.
pub struct Advertiser {
    local: PeerIdentity,
    service: String,
    group: SocketAddrV4,
    announce_interval: Duration,
    handshake_timeout: Duration,
    announce: bool,
    listener: Arc<TcpListener>,
    beacon_socket: Option<Arc<UdpSocket>>,
    event_tx: mpsc::Sender<AdvertiserEvent>,
    accept_task: Option<JoinHandle<()>>,
    announce_task: Option<JoinHandle<()>>,
}

impl Advertiser {
    /// Bind the session listener. The port is fixed from here on so it can
    /// be carried in beacons.
    pub async fn bind(
        local: PeerIdentity,
        config: &MeshConfig,
    ) -> Result<(Self, mpsc::Receiver<AdvertiserEvent>)> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let (event_tx, event_rx) = mpsc::channel(64);

        info!("Session listener bound on {}", listener.local_addr()?);

        Ok((
            Self {
                local,
                service: config.service.clone(),
                group: config.multicast_group,
                announce_interval: config.announce_interval,
                handshake_timeout: config.handshake_timeout,
                announce: config.discovery_enabled,
                listener: Arc::new(listener),
                beacon_socket: None,
                event_tx,
                accept_task: None,
                announce_task: None,
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn beacon(&self) -> Result<Beacon> {
        Ok(Beacon::new(
            &self.service,
            self.local.clone(),
            self.local_addr()?.port(),
        ))
    }

    /// Stop immediately, without a goodbye beacon.
    pub fn abort(&mut self) {
        if let Some(task) = self.announce_task.take() {
            task.abort();
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.beacon_socket = None;
    }

    async fn run_acceptor(
        listener: Arc<TcpListener>,
        service: String,
        handshake_timeout: Duration,
        event_tx: mpsc::Sender<AdvertiserEvent>,
    ) {
        loop {
            let (mut stream, remote) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Session listener accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let service = service.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let _ = stream.set_nodelay(true);
                match read_invite(&mut stream, &service, handshake_timeout).await {
                    Ok(from) => {
                        info!("[+] GOT INVITE: from {} ({})", from, remote);
                        let invite = InboundInvite::new(from, stream);
                        let _ = event_tx.send(AdvertiserEvent::InviteReceived(invite)).await;
                    }
                    Err(e) => debug!("Dropping connection from {}: {}", remote, e),
                }
            });
        }
    }

    async fn run_announcer(
        socket: Arc<UdpSocket>,
        packet: Vec<u8>,
        group: SocketAddrV4,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = socket.send_to(&packet, group).await {
                warn!("Failed to send beacon: {}", e);
            } else {
                debug!("Sent beacon");
            }
        }
    }
}

#[async_trait]
impl DiscoveryService for Advertiser {
    /// Starts accepting invites, then announcing. When the beacon socket
    /// cannot be set up the invite listener keeps running and the error
    /// is returned so the caller can report reduced reachability.
    async fn start(&mut self) -> Result<()> {
        if self.accept_task.is_none() {
            self.accept_task = Some(tokio::spawn(Self::run_acceptor(
                Arc::clone(&self.listener),
                self.service.clone(),
                self.handshake_timeout,
                self.event_tx.clone(),
            )));
        }

        if !self.announce || self.announce_task.is_some() {
            return Ok(());
        }

        let socket = match multicast_sender().await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!("[x] FAILED TO ADVERTISE SERVICE: {}", e);
                return Err(e);
            }
        };
        let packet = self.beacon()?.encode()?;
        self.announce_task = Some(tokio::spawn(Self::run_announcer(
            Arc::clone(&socket),
            packet,
            self.group,
            self.announce_interval,
        )));
        self.beacon_socket = Some(socket);

        info!("Advertising {} as {} on {}", self.service, self.local, self.group);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.announce_task.take() {
            task.abort();
        }
        if let Some(socket) = self.beacon_socket.take() {
            let goodbye = self.beacon()?.goodbye().encode()?;
            if let Err(e) = socket.send_to(&goodbye, self.group).await {
                debug!("Failed to send goodbye beacon: {}", e);
            }
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
            info!("Advertising stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.accept_task.is_some()
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{read_frame, write_frame, Frame};

    #[tokio::test]
    async fn test_invite_surfaces_as_event() {
        let config = MeshConfig::loopback();
        let (mut advertiser, mut events) =
            Advertiser::bind(PeerIdentity::new("bob", "bob"), &config).await.unwrap();
        advertiser.start().await.unwrap();
        advertiser.start().await.unwrap();
        assert!(advertiser.is_running());

        let addr = advertiser.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let alice = PeerIdentity::new("alice", "alice");
        write_frame(&mut stream, &Frame::invite("MESP", alice.clone()))
            .await
            .unwrap();

        let AdvertiserEvent::InviteReceived(invite) =
            tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(invite.from(), &alice);

        let mut inbound = invite.into_stream();
        write_frame(&mut inbound, &Frame::Accept { from: PeerIdentity::new("bob", "bob") })
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut stream).await.unwrap(),
            Some(Frame::Accept { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_closes_listener_loop() {
        let config = MeshConfig::loopback();
        let (mut advertiser, _events) =
            Advertiser::bind(PeerIdentity::new("bob", "bob"), &config).await.unwrap();
        advertiser.start().await.unwrap();
        advertiser.stop().await.unwrap();
        advertiser.stop().await.unwrap();
        assert!(!advertiser.is_running());
    }
}
