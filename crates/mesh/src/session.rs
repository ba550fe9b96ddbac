//! Per-peer session state machine.
//!
//! The peer table is guarded by one coarse `RwLock` used only for structural
//! changes (insert, remove, iteration). Each record sits behind its own
//! `Mutex`, and every state transition for that peer happens while holding
//! it, so transitions for one peer are serialized while unrelated peers
//! proceed independently. The table lock is never held while waiting for a
//! peer lock. Removing a record takes the table lock while holding that
//! record's lock, which is safe because of the previous rule.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::advertiser::InboundInvite;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::peer::{ConnectionState, PeerIdentity, PeerRecord};
use crate::transport::{self, Link, LinkEvent, LinkTimings};
use crate::wire::{write_frame, Frame, MAX_FRAME_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PeerConnected(PeerIdentity),
    PeerDisconnected(PeerIdentity),
    MessageReceived {
        from: PeerIdentity,
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteOutcome {
    Sent,
    /// A session is already pending or established; nothing was sent.
    Redundant,
}

struct PeerSlot {
    identity: PeerIdentity,
    addr: Option<SocketAddr>,
    state: ConnectionState,
    visible: bool,
    link: Option<Link>,
    /// Outstanding local invite, if any.
    attempt: Option<u64>,
    removed: bool,
}

impl PeerSlot {
    fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            addr: None,
            state: ConnectionState::Disconnected,
            visible: false,
            link: None,
            attempt: None,
            removed: false,
        }
    }

    fn link_id(&self) -> Option<u64> {
        self.link.as_ref().map(Link::id)
    }

    fn removable(&self) -> bool {
        self.state == ConnectionState::Disconnected
            && !self.visible
            && self.link.is_none()
            && self.attempt.is_none()
    }
}

struct Inner {
    local: PeerIdentity,
    service: String,
    handshake_timeout: Duration,
    timings: LinkTimings,
    peers: RwLock<HashMap<String, Arc<Mutex<PeerSlot>>>>,
    events: parking_lot::Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    next_attempt: AtomicU64,
}

/// Owns every known peer record and the session links to them.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        local: PeerIdentity,
        config: &MeshConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            local,
            service: config.service.clone(),
            handshake_timeout: config.handshake_timeout,
            timings: LinkTimings {
                keepalive_interval: config.keepalive_interval,
                liveness_timeout: config.liveness_timeout,
                send_queue: config.send_queue,
            },
            peers: RwLock::new(HashMap::new()),
            events: parking_lot::Mutex::new(Some(events)),
            link_tx,
            next_attempt: AtomicU64::new(1),
        });

        tokio::spawn(Self::pump_link_events(Arc::downgrade(&inner), link_rx));

        (Self { inner }, events_rx)
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.inner.local
    }

    async fn pump_link_events(
        inner: Weak<Inner>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        while let Some(event) = link_rx.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            let manager = SessionManager { inner };
            match event {
                LinkEvent::Data {
                    peer,
                    link_id,
                    text,
                } => manager.deliver(&peer, link_id, text).await,
                LinkEvent::Down {
                    peer,
                    link_id,
                    reason,
                } => manager.link_down(&peer, link_id, &reason).await,
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = self.inner.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    /// Stop emitting events. The receiver sees the end of the stream once
    /// it has drained what was already queued.
    pub fn close_events(&self) {
        self.inner.events.lock().take();
    }

    /// Move `slot` along one edge of the state machine. `announce` controls
    /// whether leaving for Disconnected is reported as a disconnect.
    fn transition(&self, slot: &mut PeerSlot, to: ConnectionState, announce: bool) -> bool {
        let from = slot.state;
        if !from.can_transition(to) {
            warn!(
                "Refusing transition {} -> {} for {}",
                from, to, slot.identity
            );
            return false;
        }

        slot.state = to;
        info!("[i] PEER {} CHANGED: to {}", slot.identity, to);

        match to {
            ConnectionState::Connected => {
                self.emit(SessionEvent::PeerConnected(slot.identity.clone()))
            }
            ConnectionState::Disconnected if announce => {
                self.emit(SessionEvent::PeerDisconnected(slot.identity.clone()))
            }
            _ => {}
        }
        true
    }

    async fn existing_slot(&self, id: &str) -> Option<OwnedMutexGuard<PeerSlot>> {
        loop {
            let slot = self.inner.peers.read().await.get(id).cloned()?;
            let guard = slot.lock_owned().await;
            if !guard.removed {
                return Some(guard);
            }
        }
    }

    async fn slot_or_insert(&self, peer: &PeerIdentity) -> OwnedMutexGuard<PeerSlot> {
        loop {
            let existing = self.inner.peers.read().await.get(peer.id()).cloned();
            let slot = match existing {
                Some(slot) => slot,
                None => {
                    let mut peers = self.inner.peers.write().await;
                    Arc::clone(
                        peers
                            .entry(peer.id().to_string())
                            .or_insert_with(|| Arc::new(Mutex::new(PeerSlot::new(peer.clone())))),
                    )
                }
            };
            let guard = slot.lock_owned().await;
            if !guard.removed {
                return guard;
            }
        }
    }

    /// Drop the record if it is Disconnected, undiscovered and idle.
    /// Consumes the guard; anyone waiting on the record retries from the
    /// table once it is released.
    async fn remove_if_idle(&self, mut slot: OwnedMutexGuard<PeerSlot>) {
        if !slot.removable() {
            return;
        }
        slot.removed = true;

        let mut peers = self.inner.peers.write().await;
        let id = slot.identity.id();
        let current = peers
            .get(id)
            .map(|entry| Arc::ptr_eq(entry, OwnedMutexGuard::mutex(&slot)))
            .unwrap_or(false);
        if current {
            peers.remove(id);
            debug!("Forgot peer {}", id);
        }
    }

    /// Whether the link initiated by `initiator` is the one both sides keep
    /// when two links to the same peer exist: the smaller id's invite wins.
    fn is_preferred(&self, initiator: &str, peer: &PeerIdentity) -> bool {
        initiator == self.inner.local.id().min(peer.id())
    }

    fn install(&self, slot: &mut PeerSlot, link: Link) {
        if let Some(old) = slot.link.replace(link) {
            old.drain(self.inner.handshake_timeout);
        }
    }

    fn spawn_link(
        &self,
        stream: tokio::net::TcpStream,
        peer: &PeerIdentity,
        initiator: &str,
    ) -> Link {
        Link::spawn(
            stream,
            peer.clone(),
            initiator,
            self.inner.timings,
            self.inner.link_tx.clone(),
        )
    }

    /// Record a discovery sighting. Creates the record on first sighting.
    pub async fn peer_found(&self, peer: &PeerIdentity, addr: SocketAddr) -> ConnectionState {
        if peer.id() == self.inner.local.id() {
            return ConnectionState::Disconnected;
        }
        let mut slot = self.slot_or_insert(peer).await;
        slot.visible = true;
        slot.addr = Some(addr);
        slot.state
    }

    /// Beacon loss only marks the record invisible; a live session keeps
    /// its state until the link itself goes down.
    pub async fn peer_lost(&self, peer: &PeerIdentity) {
        if let Some(mut slot) = self.existing_slot(peer.id()).await {
            slot.visible = false;
            debug!("{} no longer visible (state {})", slot.identity, slot.state);
            self.remove_if_idle(slot).await;
        }
    }

    /// Start a session with a discovered peer. Returns immediately; the
    /// handshake runs in the background.
    pub async fn invite(&self, peer: &PeerIdentity) -> Result<InviteOutcome> {
        if peer.id() == self.inner.local.id() {
            return Ok(InviteOutcome::Redundant);
        }

        let mut slot = self
            .existing_slot(peer.id())
            .await
            .ok_or_else(|| MeshError::PeerNotFound(peer.id().to_string()))?;

        if slot.state != ConnectionState::Disconnected {
            debug!("Invite to {} is redundant ({})", slot.identity, slot.state);
            return Ok(InviteOutcome::Redundant);
        }
        let addr = slot.addr.ok_or_else(|| {
            MeshError::PeerNotFound(format!("{} has no known address", slot.identity))
        })?;

        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        slot.attempt = Some(attempt);
        self.transition(&mut slot, ConnectionState::Connecting, true);
        info!("[+] SENT INVITE: to {}", slot.identity);

        let identity = slot.identity.clone();
        drop(slot);

        let manager = self.clone();
        tokio::spawn(async move {
            let result = transport::dial(
                addr,
                &manager.inner.local,
                &identity,
                &manager.inner.service,
                manager.inner.handshake_timeout,
            )
            .await;
            manager.complete_invite(&identity, attempt, result).await;
        });

        Ok(InviteOutcome::Sent)
    }

    async fn complete_invite(
        &self,
        peer: &PeerIdentity,
        attempt: u64,
        result: Result<tokio::net::TcpStream>,
    ) {
        let Some(mut slot) = self.existing_slot(peer.id()).await else {
            return;
        };
        let ours = slot.attempt == Some(attempt);
        if ours {
            slot.attempt = None;
        }

        match result {
            Ok(stream) => {
                let local_id = self.inner.local.id().to_string();
                match slot.state {
                    ConnectionState::Connecting => {
                        let link = self.spawn_link(stream, &slot.identity, &local_id);
                        self.install(&mut slot, link);
                        self.transition(&mut slot, ConnectionState::Connected, true);
                    }
                    ConnectionState::Connected => {
                        let link = self.spawn_link(stream, &slot.identity, &local_id);
                        let current_preferred = slot
                            .link
                            .as_ref()
                            .map(|l| self.is_preferred(l.initiator(), &slot.identity))
                            .unwrap_or(false);
                        if self.is_preferred(&local_id, &slot.identity) && !current_preferred {
                            debug!("Outbound link to {} supersedes inbound one", slot.identity);
                            self.install(&mut slot, link);
                        } else {
                            debug!("Outbound link to {} is redundant", slot.identity);
                            link.drain(self.inner.handshake_timeout);
                        }
                    }
                    ConnectionState::Disconnected => {
                        debug!("Late accept from {} after teardown, closing", slot.identity);
                        drop(stream);
                    }
                }
            }
            Err(e) => {
                warn!("Invite to {} failed: {}", slot.identity, e);
                if ours && slot.state == ConnectionState::Connecting {
                    self.transition(&mut slot, ConnectionState::Disconnected, true);
                }
            }
        }

        self.remove_if_idle(slot).await;
    }

    /// Resolve an invite received by the advertiser. Returns whether a
    /// session was established on the invite's connection.
    ///
    /// An invite that arrives while our own invite to the same peer is in
    /// flight is accepted; the outbound attempt is superseded once one of
    /// them connects.
    pub async fn handle_inbound_invite(
        &self,
        invite: InboundInvite,
        accept: bool,
    ) -> Result<bool> {
        let from = invite.from().clone();
        let mut stream = invite.into_stream();
        if from.id() == self.inner.local.id() {
            return Ok(false);
        }

        let mut slot = self.slot_or_insert(&from).await;

        if !accept {
            info!("Declined invite from {}", from);
            self.reject(&mut stream, "declined").await;
            self.remove_if_idle(slot).await;
            return Ok(false);
        }

        match slot.state {
            ConnectionState::Disconnected => {
                self.transition(&mut slot, ConnectionState::Connecting, false);
            }
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                let current_preferred = slot
                    .link
                    .as_ref()
                    .map(|l| self.is_preferred(l.initiator(), &slot.identity))
                    .unwrap_or(false);
                let replaceable = slot.link.is_none()
                    || (!current_preferred && self.is_preferred(from.id(), &slot.identity));
                if !replaceable {
                    debug!("Already connected to {}, rejecting invite", slot.identity);
                    self.reject(&mut stream, "already connected").await;
                    return Ok(false);
                }
                debug!("Inbound link from {} supersedes current one", slot.identity);
            }
        }

        let answer = Frame::Accept {
            from: self.inner.local.clone(),
        };
        let sent = tokio::time::timeout(
            self.inner.handshake_timeout,
            write_frame(&mut stream, &answer),
        )
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            warn!("Could not answer invite from {}", from);
            if slot.state == ConnectionState::Connecting && slot.attempt.is_none() {
                self.transition(&mut slot, ConnectionState::Disconnected, false);
            }
            self.remove_if_idle(slot).await;
            return Err(MeshError::TransmissionFailed(format!(
                "accept to {} not delivered",
                from
            )));
        }

        let link = self.spawn_link(stream, &slot.identity, from.id());
        self.install(&mut slot, link);
        if slot.state == ConnectionState::Connecting {
            self.transition(&mut slot, ConnectionState::Connected, true);
        }
        Ok(true)
    }

    async fn reject(&self, stream: &mut tokio::net::TcpStream, reason: &str) {
        let frame = Frame::Reject {
            from: self.inner.local.clone(),
            reason: reason.to_string(),
        };
        let _ = tokio::time::timeout(self.inner.handshake_timeout, write_frame(stream, &frame))
            .await;
    }

    async fn deliver(&self, peer: &PeerIdentity, link_id: u64, text: String) {
        let Some(slot) = self.existing_slot(peer.id()).await else {
            return;
        };
        // Data on a link being drained still belongs to this session.
        if slot.state != ConnectionState::Connected {
            debug!("Dropping data from {} on link {} ({})", peer, link_id, slot.state);
            return;
        }
        info!("[>] RECV: {} from {}", text, slot.identity);
        self.emit(SessionEvent::MessageReceived {
            from: slot.identity.clone(),
            text,
        });
    }

    async fn link_down(&self, peer: &PeerIdentity, link_id: u64, reason: &str) {
        let Some(mut slot) = self.existing_slot(peer.id()).await else {
            return;
        };
        if slot.link_id() != Some(link_id) {
            debug!("Ignoring loss of stale link {} to {}", link_id, peer);
            return;
        }

        if let Some(link) = slot.link.take() {
            link.abort();
        }
        warn!("Session with {} lost: {}", slot.identity, reason);

        if slot.state == ConnectionState::Connected {
            self.transition(&mut slot, ConnectionState::Disconnected, true);
        }
        // A local invite still in flight may yet be accepted.
        if slot.attempt.is_some() {
            self.transition(&mut slot, ConnectionState::Connecting, false);
        }

        self.remove_if_idle(slot).await;
    }

    /// Queue `text` for a Connected peer. Never waits for the socket; a
    /// full or closing queue is reported without touching the state.
    pub async fn send(&self, peer_id: &str, text: &str) -> Result<()> {
        let slot = self
            .existing_slot(peer_id)
            .await
            .ok_or_else(|| MeshError::PeerNotConnected(peer_id.to_string()))?;

        let link = match (&slot.state, &slot.link) {
            (ConnectionState::Connected, Some(link)) => link,
            _ => return Err(MeshError::PeerNotConnected(slot.identity.to_string())),
        };

        let frame = data_frame(text)?;
        info!("[<] SEND: {} to {}", text, slot.identity);
        link.try_send(frame)
    }

    /// Send to every Connected peer. Others are skipped silently; returns
    /// the peers the message was queued for.
    pub async fn broadcast(&self, text: &str) -> Vec<PeerIdentity> {
        let frame = match data_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Broadcast not sent: {}", e);
                return Vec::new();
            }
        };
        let mut reached = Vec::new();
        for slot in self.slots().await {
            let slot = slot.lock().await;
            if slot.removed || slot.state != ConnectionState::Connected {
                continue;
            }
            let Some(link) = &slot.link else { continue };
            match link.try_send(frame.clone()) {
                Ok(()) => reached.push(slot.identity.clone()),
                Err(e) => warn!("Broadcast to {} failed: {}", slot.identity, e),
            }
        }
        reached.sort_by(|a, b| a.id().cmp(b.id()));
        reached
    }

    async fn slots(&self) -> Vec<Arc<Mutex<PeerSlot>>> {
        self.inner.peers.read().await.values().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records = Vec::new();
        for slot in self.slots().await {
            let slot = slot.lock().await;
            if !slot.removed {
                records.push(PeerRecord {
                    identity: slot.identity.clone(),
                    state: slot.state,
                });
            }
        }
        records.sort_by(|a, b| a.identity.id().cmp(b.identity.id()));
        records
    }

    pub async fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(|r| r.identity)
            .collect()
    }

    pub async fn state_of(&self, peer_id: &str) -> Option<ConnectionState> {
        self.existing_slot(peer_id).await.map(|slot| slot.state)
    }

    pub async fn is_visible(&self, peer_id: &str) -> bool {
        self.existing_slot(peer_id)
            .await
            .map(|slot| slot.visible)
            .unwrap_or(false)
    }

    /// Say goodbye on every session, waiting at most `grace` per link.
    pub async fn close_all(&self, grace: Duration) {
        let mut closing = Vec::new();
        for slot in self.slots().await {
            let mut slot = slot.lock().await;
            slot.attempt = None;
            if let Some(link) = slot.link.take() {
                closing.push(link.close(grace));
            }
            if slot.state != ConnectionState::Disconnected {
                self.transition(&mut slot, ConnectionState::Disconnected, true);
            }
        }
        info!("Closing {} session(s)", closing.len());
        futures::future::join_all(closing).await;
    }

    /// Drop every link without a goodbye, as if the process died.
    pub async fn abort_all(&self) {
        for slot in self.slots().await {
            if let Some(link) = slot.lock().await.link.take() {
                link.abort();
            }
        }
    }
}

/// A `Data` frame that is known to fit on the wire.
fn data_frame(text: &str) -> Result<Frame> {
    let frame = Frame::Data {
        text: text.to_string(),
    };
    let len = frame.encode()?.len();
    if len > MAX_FRAME_SIZE {
        return Err(MeshError::MessageTooLarge(len));
    }
    Ok(frame)
}
