use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Service name shared by every cooperating instance. Instances using a
/// different name never see each other.
pub const DEFAULT_SERVICE: &str = "MESP";

pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 83);
pub const MULTICAST_PORT: u16 = 7077;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub service: String,
    /// Session listener address; port 0 picks an ephemeral port that is
    /// then carried in beacons.
    pub listen_addr: SocketAddr,
    pub multicast_group: SocketAddrV4,
    pub announce_interval: Duration,
    pub beacon_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub liveness_timeout: Duration,
    pub reinvite_delay: Duration,
    pub shutdown_grace: Duration,
    pub send_queue: usize,
    pub discovery_enabled: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            multicast_group: SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT),
            announce_interval: Duration::from_secs(1),
            beacon_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(8),
            reinvite_delay: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(2),
            send_queue: 64,
            discovery_enabled: true,
        }
    }
}

impl MeshConfig {
    /// Loopback-only configuration without multicast discovery. Peers are
    /// fed in through the engine's discovery sender.
    pub fn loopback() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            discovery_enabled: false,
            handshake_timeout: Duration::from_secs(3),
            reinvite_delay: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(500),
            ..Self::default()
        }
    }
}
