use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::discovery::{multicast_listener, DiscoveryService};
use crate::error::Result;
use crate::peer::PeerIdentity;
use crate::wire::{Beacon, MAX_BEACON_SIZE, PROTOCOL_VERSION};

const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Where the browser reads beacon datagrams from.
#[async_trait]
pub(crate) trait BeaconSource: Send + Sync + 'static {
    async fn recv_beacon(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl BeaconSource for UdpSocket {
    async fn recv_beacon(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    PeerFound { peer: PeerIdentity, addr: SocketAddr },
    PeerLost { peer: PeerIdentity },
}

#[derive(Debug, Clone)]
struct Sighting {
    peer: PeerIdentity,
    addr: SocketAddr,
    last_seen: Instant,
}

/// Tracks which peers are currently visible. Fires found once per
/// continuously visible peer and lost on expiry or goodbye.
#[derive(Debug)]
pub(crate) struct SightingTable {
    local_id: String,
    service: String,
    beacon_timeout: Duration,
    seen: HashMap<String, Sighting>,
}

impl SightingTable {
    pub(crate) fn new(local_id: &str, service: &str, beacon_timeout: Duration) -> Self {
        Self {
            local_id: local_id.to_string(),
            service: service.to_string(),
            beacon_timeout,
            seen: HashMap::new(),
        }
    }

    pub(crate) fn observe(&mut self, beacon: Beacon, src: SocketAddr) -> Option<BrowserEvent> {
        if beacon.protocol_version != PROTOCOL_VERSION
            || beacon.service != self.service
            || beacon.peer.id() == self.local_id
        {
            return None;
        }

        if beacon.goodbye {
            return self
                .seen
                .remove(beacon.peer.id())
                .map(|s| BrowserEvent::PeerLost { peer: s.peer });
        }

        let addr = SocketAddr::new(src.ip(), beacon.session_port);
        match self.seen.get_mut(beacon.peer.id()) {
            Some(sighting) => {
                sighting.last_seen = Instant::now();
                sighting.addr = addr;
                None
            }
            None => {
                self.seen.insert(
                    beacon.peer.id().to_string(),
                    Sighting {
                        peer: beacon.peer.clone(),
                        addr,
                        last_seen: Instant::now(),
                    },
                );
                Some(BrowserEvent::PeerFound {
                    peer: beacon.peer,
                    addr,
                })
            }
        }
    }

    pub(crate) fn expire(&mut self, now: Instant) -> Vec<BrowserEvent> {
        let timeout = self.beacon_timeout;
        let expired: Vec<String> = self
            .seen
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.seen.remove(&id))
            .map(|s| BrowserEvent::PeerLost { peer: s.peer })
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Scans the multicast group for beacons of the same service.
pub struct Browser {
    group: SocketAddrV4,
    table: Arc<Mutex<SightingTable>>,
    event_tx: mpsc::Sender<BrowserEvent>,
    listen_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

impl Browser {
    pub fn new(
        local: &PeerIdentity,
        config: &MeshConfig,
        event_tx: mpsc::Sender<BrowserEvent>,
    ) -> Self {
        Self {
            group: config.multicast_group,
            table: Arc::new(Mutex::new(SightingTable::new(
                local.id(),
                &config.service,
                config.beacon_timeout,
            ))),
            event_tx,
            listen_task: None,
            sweep_task: None,
        }
    }

    pub fn abort(&mut self) {
        if let Some(task) = self.sweep_task.take() {
            task.abort();
        }
        if let Some(task) = self.listen_task.take() {
            task.abort();
        }
    }

    async fn run_listener<S: BeaconSource>(
        socket: S,
        table: Arc<Mutex<SightingTable>>,
        event_tx: mpsc::Sender<BrowserEvent>,
    ) {
        let mut buf = [0u8; MAX_BEACON_SIZE];
        loop {
            let (len, src) = match socket.recv_beacon(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Beacon recv error: {}", e);
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let beacon = match Beacon::decode(&buf[..len]) {
                Ok(beacon) => beacon,
                Err(e) => {
                    debug!("Ignoring malformed beacon from {}: {}", src, e);
                    continue;
                }
            };

            let event = table.lock().observe(beacon, src);
            if let Some(event) = event {
                match &event {
                    BrowserEvent::PeerFound { peer, addr } => {
                        info!("[*] FOUND PEER: {} at {}", peer, addr)
                    }
                    BrowserEvent::PeerLost { peer } => info!("[-] LOST PEER: {} (goodbye)", peer),
                }
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }

    async fn run_sweeper(
        table: Arc<Mutex<SightingTable>>,
        event_tx: mpsc::Sender<BrowserEvent>,
        period: Duration,
    ) {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let lost = table.lock().expire(Instant::now());
            for event in lost {
                if let BrowserEvent::PeerLost { peer } = &event {
                    info!("[-] LOST PEER: {}", peer);
                }
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl DiscoveryService for Browser {
    async fn start(&mut self) -> Result<()> {
        if self.listen_task.is_some() {
            return Ok(());
        }

        let socket = match multicast_listener(self.group) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("[x] FAILED TO BROWSE FOR PEERS: {}", e);
                return Err(e);
            }
        };

        let period = (self.table.lock().beacon_timeout / 2).max(Duration::from_millis(100));
        self.listen_task = Some(tokio::spawn(Self::run_listener(
            socket,
            Arc::clone(&self.table),
            self.event_tx.clone(),
        )));
        self.sweep_task = Some(tokio::spawn(Self::run_sweeper(
            Arc::clone(&self.table),
            self.event_tx.clone(),
            period,
        )));

        info!("Browsing for peers on {}", self.group);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.sweep_task.take() {
            task.abort();
        }
        if let Some(task) = self.listen_task.take() {
            task.abort();
            self.table.lock().clear();
            info!("Browsing stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.listen_task.is_some()
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> SocketAddr {
        "192.168.1.20:7077".parse().unwrap()
    }

    fn table() -> SightingTable {
        SightingTable::new("me", "MESP", Duration::from_millis(500))
    }

    #[test]
    fn test_found_fires_once_per_visible_peer() {
        let mut table = table();
        let bob = PeerIdentity::new("bob", "bob");

        let first = table.observe(Beacon::new("MESP", bob.clone(), 4100), src());
        assert_eq!(
            first,
            Some(BrowserEvent::PeerFound {
                peer: bob.clone(),
                addr: "192.168.1.20:4100".parse().unwrap(),
            })
        );

        for _ in 0..3 {
            assert_eq!(table.observe(Beacon::new("MESP", bob.clone(), 4100), src()), None);
        }
    }

    #[test]
    fn test_foreign_and_own_beacons_ignored() {
        let mut table = table();
        assert_eq!(
            table.observe(Beacon::new("OTHER", PeerIdentity::new("bob", "bob"), 1), src()),
            None
        );
        assert_eq!(
            table.observe(Beacon::new("MESP", PeerIdentity::new("me", "me"), 1), src()),
            None
        );
    }

    #[test]
    fn test_expiry_and_rediscovery() {
        let mut table = table();
        let bob = PeerIdentity::new("bob", "bob");
        table.observe(Beacon::new("MESP", bob.clone(), 4100), src());

        assert!(table.expire(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            table.expire(later),
            vec![BrowserEvent::PeerLost { peer: bob.clone() }]
        );

        assert!(matches!(
            table.observe(Beacon::new("MESP", bob, 4100), src()),
            Some(BrowserEvent::PeerFound { .. })
        ));
    }

    #[test]
    fn test_goodbye_reports_loss_immediately() {
        let mut table = table();
        let bob = PeerIdentity::new("bob", "bob");
        table.observe(Beacon::new("MESP", bob.clone(), 4100), src());

        let lost = table.observe(Beacon::new("MESP", bob.clone(), 4100).goodbye(), src());
        assert_eq!(lost, Some(BrowserEvent::PeerLost { peer: bob.clone() }));

        let again = table.observe(Beacon::new("MESP", bob, 4100).goodbye(), src());
        assert_eq!(again, None);
    }

    struct FailingSource {
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl BeaconSource for FailingSource {
        async fn recv_beacon(&self, _buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::Other, "interface gone"))
        }
    }

    #[tokio::test]
    async fn test_recv_errors_back_off() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let source = FailingSource {
            calls: Arc::clone(&calls),
        };
        let (event_tx, _event_rx) = mpsc::channel(8);
        let listener = tokio::spawn(Browser::run_listener(
            source,
            Arc::new(Mutex::new(table())),
            event_tx,
        ));

        tokio::time::sleep(RECV_ERROR_BACKOFF * 3 + RECV_ERROR_BACKOFF / 2).await;
        listener.abort();

        let calls = calls.load(std::sync::atomic::Ordering::SeqCst);
        assert!((1..=5).contains(&calls), "recv called {} times", calls);
    }
}
