use mesp_mesh::{
    BrowserEvent, ConnectionState, MeshConfig, MeshDelegate, MeshEngine, MeshError, MeshPolicy,
    PeerIdentity, StartupReport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
enum Note {
    PeersChanged(Vec<PeerIdentity>),
    Message(String, PeerIdentity),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Note>,
}

impl MeshDelegate for Recorder {
    fn on_peers_changed(&self, connected: &[PeerIdentity]) {
        let _ = self.tx.send(Note::PeersChanged(connected.to_vec()));
    }

    fn on_message(&self, text: &str, from: &PeerIdentity) {
        let _ = self.tx.send(Note::Message(text.to_string(), from.clone()));
    }
}

/// Invites nobody except through an explicit allow list.
struct InviteOnly(Vec<&'static str>);

impl MeshPolicy for InviteOnly {
    fn should_invite(&self, peer: &PeerIdentity) -> bool {
        self.0.iter().any(|id| *id == peer.id())
    }
}

struct Node {
    engine: MeshEngine,
    notes: mpsc::UnboundedReceiver<Note>,
}

impl Node {
    fn identity(&self) -> PeerIdentity {
        self.engine.local().clone()
    }

    async fn sees(&self, other: &Node) {
        self.engine
            .discovery_sender()
            .send(BrowserEvent::PeerFound {
                peer: other.identity(),
                addr: other.engine.session_addr(),
            })
            .await
            .unwrap();
    }

    async fn wait_for<F>(&mut self, what: &str, f: F) -> Note
    where
        F: Fn(&Note) -> bool,
    {
        let notes = &mut self.notes;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let note = notes.recv().await.unwrap();
                if f(&note) {
                    return note;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
    }

    /// Notes that arrive within `window`.
    async fn collect(&mut self, window: Duration) -> Vec<Note> {
        let mut notes = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(note)) = tokio::time::timeout_at(deadline, self.notes.recv()).await {
            notes.push(note);
        }
        notes
    }
}

async fn start_node_with(
    name: &str,
    config: MeshConfig,
    policy: Option<Arc<dyn MeshPolicy>>,
) -> (Node, StartupReport) {
    let (tx, notes) = mpsc::unbounded_channel();
    let delegate = Arc::new(Recorder { tx });
    let identity = PeerIdentity::new(name, name);

    let engine = match policy {
        Some(policy) => MeshEngine::with_policy(identity, config, delegate, policy).await,
        None => MeshEngine::new(identity, config, delegate).await,
    }
    .unwrap();

    let report = engine.start().await.unwrap();
    (Node { engine, notes }, report)
}

async fn start_node(name: &str, policy: Option<Arc<dyn MeshPolicy>>) -> Node {
    let (node, report) = start_node_with(name, MeshConfig::loopback(), policy).await;
    assert!(!report.is_degraded());
    node
}

async fn wait_connected(node: &Node, expected: Vec<PeerIdentity>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while node.engine.connected_peers().await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peers did not connect");
}

fn greetings(notes: &[Note]) -> usize {
    notes
        .iter()
        .filter(|n| matches!(n, Note::Message(text, _) if text.starts_with("Hi new guy")))
        .count()
}

#[tokio::test]
async fn test_discovery_leads_to_session_and_greeting() {
    let mut alice = start_node("alice", None).await;
    let mut bob = start_node("bob", None).await;

    alice.sees(&bob).await;

    let changed = alice
        .wait_for("alice peers change", |n| matches!(n, Note::PeersChanged(_)))
        .await;
    assert_eq!(changed, Note::PeersChanged(vec![bob.identity()]));

    let greeting = bob
        .wait_for("greeting at bob", |n| matches!(n, Note::Message(..)))
        .await;
    assert_eq!(
        greeting,
        Note::Message("Hi new guy bob!".to_string(), alice.identity())
    );

    wait_connected(&bob, vec![alice.identity()]).await;
}

#[tokio::test]
async fn test_simultaneous_invites_converge() {
    let mut alice = start_node("alice", None).await;
    let mut bob = start_node("bob", None).await;

    tokio::join!(alice.sees(&bob), bob.sees(&alice));

    wait_connected(&alice, vec![bob.identity()]).await;
    wait_connected(&bob, vec![alice.identity()]).await;

    let alice_notes = alice.collect(Duration::from_millis(800)).await;
    let bob_notes = bob.collect(Duration::from_millis(800)).await;

    // One session each way: one greeting, and the peer never drops out.
    assert_eq!(greetings(&alice_notes), 1);
    assert_eq!(greetings(&bob_notes), 1);
    assert!(!alice_notes.contains(&Note::PeersChanged(vec![])));
    assert!(!bob_notes.contains(&Note::PeersChanged(vec![])));

    assert_eq!(alice.engine.connected_peers().await, vec![bob.identity()]);
    assert_eq!(bob.engine.connected_peers().await, vec![alice.identity()]);

    alice.engine.send_to("bob", "still one session").await.unwrap();
    let received = bob
        .wait_for("message at bob", |n| {
            matches!(n, Note::Message(text, _) if text == "still one session")
        })
        .await;
    assert_eq!(
        received,
        Note::Message("still one session".to_string(), alice.identity())
    );
}

#[tokio::test]
async fn test_broadcast_skips_disconnected_peers() {
    let hub = start_node("hub", Some(Arc::new(InviteOnly(vec!["a", "c"])))).await;
    let mut a = start_node("a", None).await;
    let mut b = start_node("b", None).await;
    let mut c = start_node("c", None).await;

    hub.sees(&a).await;
    hub.sees(&b).await;
    hub.sees(&c).await;

    wait_connected(&hub, vec![a.identity(), c.identity()]).await;
    let records = hub.engine.current_peers().await;
    let b_record = records.iter().find(|r| r.identity.id() == "b").unwrap();
    assert_eq!(b_record.state, ConnectionState::Disconnected);

    let reached = hub.engine.broadcast("hello all").await;
    assert_eq!(reached, vec![a.identity(), c.identity()]);

    for node in [&mut a, &mut c] {
        let note = node
            .wait_for("broadcast", |n| {
                matches!(n, Note::Message(text, _) if text == "hello all")
            })
            .await;
        assert_eq!(note, Note::Message("hello all".to_string(), hub.identity()));
    }

    assert!(b.collect(Duration::from_millis(300)).await.is_empty());
}

#[tokio::test]
async fn test_send_to_disconnected_peer_fails() {
    let alice = start_node("alice", Some(Arc::new(InviteOnly(vec![])))).await;
    let mut bob = start_node("bob", None).await;

    alice.sees(&bob).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        alice.engine.send_to("bob", "anyone there?").await,
        Err(MeshError::PeerNotConnected(_))
    ));
    assert!(matches!(
        alice.engine.send_to("nobody", "anyone there?").await,
        Err(MeshError::PeerNotConnected(_))
    ));
    assert!(bob.collect(Duration::from_millis(300)).await.is_empty());
}

#[tokio::test]
async fn test_unclean_exit_is_noticed() {
    let mut alice = start_node("alice", None).await;
    let bob = start_node("bob", None).await;

    alice.sees(&bob).await;
    alice
        .wait_for("connect", |n| matches!(n, Note::PeersChanged(p) if !p.is_empty()))
        .await;

    bob.engine.abort().await;
    drop(bob);

    let note = alice
        .wait_for("disconnect", |n| matches!(n, Note::PeersChanged(_)))
        .await;
    assert_eq!(note, Note::PeersChanged(vec![]));
    assert!(alice.engine.connected_peers().await.is_empty());
}

#[tokio::test]
async fn test_graceful_shutdown_closes_sessions() {
    let mut alice = start_node("alice", None).await;
    let mut bob = start_node("bob", None).await;

    alice.sees(&bob).await;
    wait_connected(&alice, vec![bob.identity()]).await;
    wait_connected(&bob, vec![alice.identity()]).await;

    bob.engine.shutdown().await;
    bob.engine.shutdown().await;

    // The final peer set reached the delegate before shutdown returned.
    let mut last = None;
    while let Ok(note) = bob.notes.try_recv() {
        if let Note::PeersChanged(peers) = note {
            last = Some(peers);
        }
    }
    assert_eq!(last, Some(vec![]));

    alice
        .wait_for("disconnect", |n| matches!(n, Note::PeersChanged(p) if p.is_empty()))
        .await;
    assert!(bob
        .engine
        .current_peers()
        .await
        .iter()
        .all(|r| r.state == ConnectionState::Disconnected));
    assert!(matches!(
        bob.engine.start().await,
        Err(MeshError::ChannelClosed)
    ));
}

#[tokio::test]
async fn test_dropped_session_to_visible_peer_is_reinvited() {
    let mut alice = start_node("alice", None).await;
    let mut bob = start_node("bob", None).await;

    alice.sees(&bob).await;
    alice
        .wait_for("connect", |n| matches!(n, Note::PeersChanged(p) if !p.is_empty()))
        .await;
    bob.wait_for("first greeting", |n| matches!(n, Note::Message(..)))
        .await;

    // Kill the link under bob's engine; alice still sees bob.
    bob.engine.sessions().abort_all().await;

    alice
        .wait_for("disconnect", |n| matches!(n, Note::PeersChanged(p) if p.is_empty()))
        .await;
    let back = alice
        .wait_for("reconnect", |n| matches!(n, Note::PeersChanged(p) if !p.is_empty()))
        .await;
    assert_eq!(back, Note::PeersChanged(vec![bob.identity()]));

    let greeting = bob
        .wait_for("second greeting", |n| matches!(n, Note::Message(..)))
        .await;
    assert_eq!(
        greeting,
        Note::Message("Hi new guy bob!".to_string(), alice.identity())
    );
    wait_connected(&bob, vec![alice.identity()]).await;
}

#[tokio::test]
async fn test_discovery_failure_is_reported_not_fatal() {
    // Not a multicast address, so joining the group fails.
    let config = MeshConfig {
        discovery_enabled: true,
        multicast_group: "10.255.255.1:47077".parse().unwrap(),
        ..MeshConfig::loopback()
    };
    let (mut alice, report) = start_node_with("alice", config, None).await;
    let mut bob = start_node("bob", None).await;

    assert!(report.is_degraded());
    assert!(matches!(
        report.browser,
        Some(MeshError::DiscoveryUnavailable(_))
    ));
    assert_eq!(report.session_addr, alice.engine.session_addr());

    alice.sees(&bob).await;
    alice
        .wait_for("connect", |n| matches!(n, Note::PeersChanged(p) if !p.is_empty()))
        .await;
    let greeting = bob
        .wait_for("greeting", |n| matches!(n, Note::Message(..)))
        .await;
    assert_eq!(
        greeting,
        Note::Message("Hi new guy bob!".to_string(), alice.identity())
    );
}
