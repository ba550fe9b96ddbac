use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::advertiser::{Advertiser, AdvertiserEvent};
use crate::browser::{Browser, BrowserEvent};
use crate::config::MeshConfig;
use crate::discovery::DiscoveryService;
use crate::error::{MeshError, Result};
use crate::peer::{ConnectionState, PeerIdentity, PeerRecord};
use crate::session::{SessionEvent, SessionManager};

/// Outward notifications. Called from the engine's event task, so
/// implementations should return quickly.
pub trait MeshDelegate: Send + Sync + 'static {
    fn on_peers_changed(&self, connected: &[PeerIdentity]);
    fn on_message(&self, text: &str, from: &PeerIdentity);
}

/// Connect and greet policy. The default invites every discovered peer,
/// accepts every invite and greets each new session once.
pub trait MeshPolicy: Send + Sync + 'static {
    fn should_invite(&self, _peer: &PeerIdentity) -> bool {
        true
    }

    fn should_accept(&self, _peer: &PeerIdentity) -> bool {
        true
    }

    /// Message sent to `peer` alone once its session is up.
    fn greeting(&self, _local: &PeerIdentity, peer: &PeerIdentity) -> Option<String> {
        Some(format!("Hi new guy {}!", peer.display_name()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

impl MeshPolicy for DefaultPolicy {}

/// What `start` managed to bring up. Discovery failures are not fatal:
/// the node still accepts invites and keeps sessions it already has.
#[derive(Debug)]
pub struct StartupReport {
    pub session_addr: SocketAddr,
    pub advertiser: Option<MeshError>,
    pub browser: Option<MeshError>,
}

impl StartupReport {
    pub fn is_degraded(&self) -> bool {
        self.advertiser.is_some() || self.browser.is_some()
    }
}

struct Receivers {
    browser: mpsc::Receiver<BrowserEvent>,
    advertiser: mpsc::Receiver<AdvertiserEvent>,
    sessions: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Composes discovery and session management under a [`MeshPolicy`].
pub struct MeshEngine {
    local: PeerIdentity,
    config: MeshConfig,
    session_addr: SocketAddr,
    sessions: SessionManager,
    advertiser: Mutex<Advertiser>,
    browser: Mutex<Browser>,
    browser_tx: mpsc::Sender<BrowserEvent>,
    delegate: Arc<dyn MeshDelegate>,
    policy: Arc<dyn MeshPolicy>,
    receivers: parking_lot::Mutex<Option<Receivers>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    session_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
}

impl MeshEngine {
    /// Create an engine with the default policy. Binds the session
    /// listener; nothing is announced until [`MeshEngine::start`].
    pub async fn new(
        local: PeerIdentity,
        config: MeshConfig,
        delegate: Arc<dyn MeshDelegate>,
    ) -> Result<Self> {
        Self::with_policy(local, config, delegate, Arc::new(DefaultPolicy)).await
    }

    pub async fn with_policy(
        local: PeerIdentity,
        config: MeshConfig,
        delegate: Arc<dyn MeshDelegate>,
        policy: Arc<dyn MeshPolicy>,
    ) -> Result<Self> {
        let (advertiser, advertiser_rx) = Advertiser::bind(local.clone(), &config).await?;
        let session_addr = advertiser.local_addr()?;

        let (browser_tx, browser_rx) = mpsc::channel(64);
        let browser = Browser::new(&local, &config, browser_tx.clone());
        let (sessions, sessions_rx) = SessionManager::new(local.clone(), &config);

        Ok(Self {
            local,
            config,
            session_addr,
            sessions,
            advertiser: Mutex::new(advertiser),
            browser: Mutex::new(browser),
            browser_tx,
            delegate,
            policy,
            receivers: parking_lot::Mutex::new(Some(Receivers {
                browser: browser_rx,
                advertiser: advertiser_rx,
                sessions: sessions_rx,
            })),
            tasks: parking_lot::Mutex::new(Vec::new()),
            session_task: parking_lot::Mutex::new(None),
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    /// Address remote inviters connect to.
    pub fn session_addr(&self) -> SocketAddr {
        self.session_addr
    }

    /// Feed for discovery events. The multicast browser writes here; other
    /// discovery sources can too.
    pub fn discovery_sender(&self) -> mpsc::Sender<BrowserEvent> {
        self.browser_tx.clone()
    }

    /// Start event handling, then advertising and browsing. Calling it
    /// again retries whichever discovery component is not running.
    pub async fn start(&self) -> Result<StartupReport> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(MeshError::ChannelClosed);
        }

        if let Some(receivers) = self.receivers.lock().take() {
            let tasks = vec![
                tokio::spawn(Self::run_browser_events(
                    self.sessions.clone(),
                    Arc::clone(&self.policy),
                    Arc::clone(&self.shutting_down),
                    receivers.browser,
                )),
                tokio::spawn(Self::run_advertiser_events(
                    self.sessions.clone(),
                    Arc::clone(&self.policy),
                    Arc::clone(&self.shutting_down),
                    receivers.advertiser,
                )),
            ];
            self.tasks.lock().extend(tasks);
            *self.session_task.lock() = Some(tokio::spawn(Self::run_session_events(
                self.sessions.clone(),
                Arc::clone(&self.delegate),
                Arc::clone(&self.policy),
                Arc::clone(&self.shutting_down),
                self.config.reinvite_delay,
                receivers.sessions,
            )));
        }

        let advertiser = self.advertiser.lock().await.start().await.err();
        let browser = if self.config.discovery_enabled {
            self.browser.lock().await.start().await.err()
        } else {
            debug!("Multicast browsing disabled");
            None
        };

        let report = StartupReport {
            session_addr: self.session_addr,
            advertiser,
            browser,
        };
        if report.is_degraded() {
            warn!("Mesh started with reduced connectivity");
        } else {
            info!("Mesh started as {} on {}", self.local, self.session_addr);
        }
        Ok(report)
    }

    async fn run_browser_events(
        sessions: SessionManager,
        policy: Arc<dyn MeshPolicy>,
        shutting_down: Arc<AtomicBool>,
        mut events: mpsc::Receiver<BrowserEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                BrowserEvent::PeerFound { peer, addr } => {
                    let state = sessions.peer_found(&peer, addr).await;
                    if state == ConnectionState::Disconnected
                        && !shutting_down.load(Ordering::SeqCst)
                        && policy.should_invite(&peer)
                    {
                        if let Err(e) = sessions.invite(&peer).await {
                            warn!("Could not invite {}: {}", peer, e);
                        }
                    }
                }
                BrowserEvent::PeerLost { peer } => sessions.peer_lost(&peer).await,
            }
        }
    }

    async fn run_advertiser_events(
        sessions: SessionManager,
        policy: Arc<dyn MeshPolicy>,
        shutting_down: Arc<AtomicBool>,
        mut events: mpsc::Receiver<AdvertiserEvent>,
    ) {
        while let Some(AdvertiserEvent::InviteReceived(invite)) = events.recv().await {
            let accept =
                !shutting_down.load(Ordering::SeqCst) && policy.should_accept(invite.from());
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let from = invite.from().clone();
                if let Err(e) = sessions.handle_inbound_invite(invite, accept).await {
                    warn!("Invite from {} failed: {}", from, e);
                }
            });
        }
    }

    async fn run_session_events(
        sessions: SessionManager,
        delegate: Arc<dyn MeshDelegate>,
        policy: Arc<dyn MeshPolicy>,
        shutting_down: Arc<AtomicBool>,
        reinvite_delay: Duration,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::PeerConnected(peer) => {
                    if let Some(text) = policy.greeting(sessions.local(), &peer) {
                        if let Err(e) = sessions.send(peer.id(), &text).await {
                            warn!("Greeting to {} failed: {}", peer, e);
                        }
                    }
                    delegate.on_peers_changed(&sessions.connected_peers().await);
                }
                SessionEvent::PeerDisconnected(peer) => {
                    delegate.on_peers_changed(&sessions.connected_peers().await);
                    if !shutting_down.load(Ordering::SeqCst) && policy.should_invite(&peer) {
                        tokio::spawn(Self::reinvite_later(
                            sessions.clone(),
                            peer,
                            Arc::clone(&shutting_down),
                            reinvite_delay,
                        ));
                    }
                }
                SessionEvent::MessageReceived { from, text } => delegate.on_message(&text, &from),
            }
        }
    }

    /// A continuously visible peer is not rediscovered, so a dropped
    /// session is retried here.
    async fn reinvite_later(
        sessions: SessionManager,
        peer: PeerIdentity,
        shutting_down: Arc<AtomicBool>,
        delay: Duration,
    ) {
        tokio::time::sleep(delay).await;
        if shutting_down.load(Ordering::SeqCst) || !sessions.is_visible(peer.id()).await {
            return;
        }
        if sessions.state_of(peer.id()).await == Some(ConnectionState::Disconnected) {
            debug!("Re-inviting {}", peer);
            if let Err(e) = sessions.invite(&peer).await {
                debug!("Re-invite of {} skipped: {}", peer, e);
            }
        }
    }

    pub async fn send_to(&self, peer_id: &str, text: &str) -> Result<()> {
        self.sessions.send(peer_id, text).await
    }

    /// Returns the peers the message was queued for.
    pub async fn broadcast(&self, text: &str) -> Vec<PeerIdentity> {
        self.sessions.broadcast(text).await
    }

    pub async fn current_peers(&self) -> Vec<PeerRecord> {
        self.sessions.snapshot().await
    }

    pub async fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.sessions.connected_peers().await
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Close every session, waiting at most the configured grace per link,
    /// then release discovery. Invites arriving meanwhile are declined.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down mesh");
        let grace = self.config.shutdown_grace;

        self.sessions.close_all(grace).await;

        // The delegate sees the final peer set before event handling ends.
        self.sessions.close_events();
        let session_task = self.session_task.lock().take();
        if let Some(mut task) = session_task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("Session events not drained in {:?}", grace);
                task.abort();
            }
        }

        if let Err(e) = self.advertiser.lock().await.stop().await {
            warn!("Advertiser stop failed: {}", e);
        }
        if let Err(e) = self.browser.lock().await.stop().await {
            warn!("Browser stop failed: {}", e);
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Tear everything down without goodbyes, as a crashed process would.
    pub async fn abort(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = self.session_task.lock().take() {
            task.abort();
        }
        self.advertiser.lock().await.abort();
        self.browser.lock().await.abort();
        self.sessions.abort_all().await;
        warn!("Mesh aborted");
    }
}

impl Drop for MeshEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(task) = self.session_task.get_mut().take() {
            task.abort();
        }
    }
}
