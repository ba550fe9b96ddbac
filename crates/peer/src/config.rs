use mesp_mesh::{MeshConfig, PeerIdentity};
use std::net::{SocketAddr, SocketAddrV4};

pub struct PeerConfig {
    pub identity: PeerIdentity,
    pub mesh: MeshConfig,
}

impl PeerConfig {
    pub fn new(
        instance: Option<String>,
        name: Option<String>,
        port: u16,
        service: String,
        multicast: Option<SocketAddrV4>,
        discovery: bool,
    ) -> Self {
        let host = name.unwrap_or_else(system_hostname);
        let identity = PeerIdentity::local(&host, instance.as_deref());

        let defaults = MeshConfig::default();
        let mesh = MeshConfig {
            service,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            multicast_group: multicast.unwrap_or(defaults.multicast_group),
            discovery_enabled: discovery,
            ..defaults
        };

        Self { identity, mesh }
    }
}

/// Short hostname, without any domain suffix.
fn system_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| h.split('.').next().map(str::to_string))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "peer".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesp_mesh::DEFAULT_SERVICE;

    #[test]
    fn test_display_name_from_host_and_instance() {
        let config = PeerConfig::new(
            Some("7".into()),
            Some("laptop".into()),
            4100,
            DEFAULT_SERVICE.into(),
            None,
            true,
        );
        assert_eq!(config.identity.display_name(), "laptop-7");
        assert!(config.identity.id().starts_with("laptop-7."));
        assert_eq!(config.mesh.listen_addr.port(), 4100);
        assert_eq!(config.mesh.service, "MESP");
    }

    #[test]
    fn test_overrides() {
        let group: SocketAddrV4 = "239.1.2.3:9999".parse().unwrap();
        let config = PeerConfig::new(None, None, 0, "TEST".into(), Some(group), false);
        assert_eq!(config.mesh.multicast_group, group);
        assert!(!config.mesh.discovery_enabled);
        assert!(!config.identity.display_name().is_empty());
    }
}
