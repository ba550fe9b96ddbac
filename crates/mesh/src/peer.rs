use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// A mesh participant.
///
/// Equality and hashing use `id` only; `display_name` is advisory and only
/// ever shown to humans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    id: String,
    display_name: String,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Build the identity of this process from a hostname and an instance
    /// discriminator. A random discriminator is drawn when none is given, so
    /// several instances can run on one machine.
    pub fn local(hostname: &str, discriminator: Option<&str>) -> Self {
        let discriminator = discriminator
            .map(str::to_string)
            .unwrap_or_else(|| random_discriminator().to_string());
        let display_name = format!("{}-{}", hostname, discriminator);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}.{}", display_name, &suffix[..8]);
        Self { id, display_name }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name)
    }
}

/// Small instance number seeded from the wall clock.
pub fn random_discriminator() -> u32 {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    rand::rngs::StdRng::seed_from_u64(seed).gen_range(0..1000)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the session state machine.
    /// Connecting can never be skipped on the way up.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: PeerIdentity,
    pub state: ConnectionState,
}
