use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

use crate::error::{MeshError, Result};

/// Start/stop contract shared by the advertiser and the browser.
///
/// Both calls are idempotent. Stopping releases sockets and background
/// tasks but never touches established sessions.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
    fn is_running(&self) -> bool;
}

fn unavailable(what: &str, e: std::io::Error) -> MeshError {
    MeshError::DiscoveryUnavailable(format!("{}: {}", what, e))
}

/// Socket that receives beacons for `group`. Address reuse lets several
/// instances on one host share the group port.
pub(crate) fn multicast_listener(group: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| unavailable("create socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| unavailable("reuse address", e))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| unavailable("reuse port", e))?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()));
    socket
        .bind(&bind_addr.into())
        .map_err(|e| unavailable(&format!("bind {}", bind_addr), e))?;
    socket
        .join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| unavailable(&format!("join {}", group.ip()), e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| unavailable("nonblocking", e))?;

    UdpSocket::from_std(socket.into()).map_err(|e| unavailable("register socket", e))
}

/// Socket used to send beacons to the group. Loopback stays on so
/// instances on the same host hear each other.
pub(crate) async fn multicast_sender() -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .await
        .map_err(|e| unavailable("bind beacon socket", e))?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| unavailable("multicast loop", e))?;
    socket
        .set_multicast_ttl_v4(1)
        .map_err(|e| unavailable("multicast ttl", e))?;
    Ok(socket)
}
