pub mod advertiser;
pub mod browser;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod peer;
pub mod session;
pub mod transport;
pub mod wire;

pub use advertiser::{Advertiser, AdvertiserEvent, InboundInvite};
pub use browser::{Browser, BrowserEvent};
pub use config::{MeshConfig, DEFAULT_SERVICE};
pub use discovery::DiscoveryService;
pub use engine::{DefaultPolicy, MeshDelegate, MeshEngine, MeshPolicy, StartupReport};
pub use error::{MeshError, Result};
pub use peer::{random_discriminator, ConnectionState, PeerIdentity, PeerRecord};
pub use session::{InviteOutcome, SessionEvent, SessionManager};
pub use wire::{Beacon, Frame, PROTOCOL_VERSION};
