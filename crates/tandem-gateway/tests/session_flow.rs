//! End-to-end session scenarios against an in-memory SQLite store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use tandem_db::{Database, DeleteOutcome};
use tandem_gateway::Gateway;
use tandem_gateway::error::SessionError;
use tandem_gateway::session::{ChatSession, SessionState, send_message};
use tandem_gateway::store::{ChatStore, now};
use tandem_types::events::GatewayEvent;
use tandem_types::models::{Connection, ConnectionId, GroupKey, Message, User};

/// Store wrapper with switchable faults.
struct FlakyStore {
    inner: Database,
    fail_appends: AtomicBool,
    fail_attaches: AtomicBool,
    fail_detaches: AtomicBool,
    /// Mark the first id read a minute early, as another connection would.
    preempt_mark_read: AtomicBool,
    /// Blocks the next thread fetch: signals on the first channel, then
    /// waits on the second.
    thread_gate: Mutex<Option<(UnboundedSender<()>, std_mpsc::Receiver<()>)>>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: Database::open_in_memory().unwrap(),
            fail_appends: AtomicBool::new(false),
            fail_attaches: AtomicBool::new(false),
            fail_detaches: AtomicBool::new(false),
            preempt_mark_read: AtomicBool::new(false),
            thread_gate: Mutex::new(None),
        }
    }

    fn pause_next_thread_fetch(&self) -> (UnboundedReceiver<()>, std_mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        *self.thread_gate.lock().unwrap() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }
}

impl ChatStore for FlakyStore {
    fn find_user(&self, username: &str) -> Result<Option<User>> {
        ChatStore::find_user(&self.inner, username)
    }

    fn message_thread(&self, current: &str, other: &str) -> Result<Vec<Message>> {
        let gate = self.thread_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.send(()).unwrap();
            let _ = release.recv_timeout(Duration::from_secs(5));
        }
        ChatStore::message_thread(&self.inner, current, other)
    }

    fn get_or_create_group(&self, key: &GroupKey) -> Result<()> {
        ChatStore::get_or_create_group(&self.inner, key)
    }

    fn add_connection(&self, key: &GroupKey, connection: &Connection) -> Result<()> {
        if self.fail_attaches.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        ChatStore::add_connection(&self.inner, key, connection)
    }

    fn remove_connection(&self, connection_id: ConnectionId) -> Result<Option<GroupKey>> {
        if self.fail_detaches.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        ChatStore::remove_connection(&self.inner, connection_id)
    }

    fn clear_connections(&self) -> Result<usize> {
        ChatStore::clear_connections(&self.inner)
    }

    fn append_message(&self, message: &Message) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        ChatStore::append_message(&self.inner, message)
    }

    fn mark_read(&self, message_ids: &[Uuid], read_at: DateTime<Utc>) -> Result<usize> {
        if self.preempt_mark_read.swap(false, Ordering::SeqCst) && !message_ids.is_empty() {
            let earlier = read_at - chrono::Duration::seconds(60);
            ChatStore::mark_read(&self.inner, &message_ids[..1], earlier)?;
        }
        ChatStore::mark_read(&self.inner, message_ids, read_at)
    }

    fn delete_message(&self, message_id: Uuid, username: &str) -> Result<DeleteOutcome> {
        ChatStore::delete_message(&self.inner, message_id, username)
    }
}

fn seed(db: &Database) {
    for (username, known_as) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
        db.create_user(&Uuid::new_v4().to_string(), username, known_as).unwrap();
    }
}

fn setup() -> (Arc<Database>, Gateway) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    seed(&db);
    let gateway = Gateway::new(db.clone());
    (db, gateway)
}

fn setup_flaky() -> (Arc<FlakyStore>, Gateway) {
    let store = Arc::new(FlakyStore::new());
    seed(&store.inner);
    let gateway = Gateway::new(store.clone());
    (store, gateway)
}

fn drain(rx: &mut UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn new_messages(events: &[GatewayEvent]) -> Vec<&Message> {
    events
        .iter()
        .filter_map(|e| match e {
            GatewayEvent::NewMessage { message } => Some(message),
            _ => None,
        })
        .collect()
}

fn notifications(events: &[GatewayEvent]) -> Vec<(&str, &str)> {
    events
        .iter()
        .filter_map(|e| match e {
            GatewayEvent::NewMessageReceived { username, known_as } => Some((username.as_str(), known_as.as_str())),
            _ => None,
        })
        .collect()
}

fn thread(events: &[GatewayEvent]) -> Option<&Vec<Message>> {
    events.iter().find_map(|e| match e {
        GatewayEvent::ReceiveMessageThread { messages } => Some(messages),
        _ => None,
    })
}

fn count_online(events: &[GatewayEvent], who: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, GatewayEvent::UserIsOnline { username } if username == who))
        .count()
}

fn count_offline(events: &[GatewayEvent], who: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, GatewayEvent::UserIsOffline { username } if username == who))
        .count()
}

async fn stored_thread(gateway: &Gateway, current: &str, other: &str) -> Vec<Message> {
    gateway.store().message_thread(current, other).unwrap()
}

#[tokio::test]
async fn send_to_offline_peer_stays_unread_and_drops_notification() {
    let (_db, gateway) = setup();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");

    alice.connect("bob").await.unwrap();
    let joined = drain(&mut alice_rx);
    assert!(joined.iter().any(|e| matches!(e, GatewayEvent::UpdatedGroup { group } if group.has_user("alice"))));
    assert_eq!(thread(&joined).map(Vec::len), Some(0));

    let sent = alice.send("bob", "hi").await.unwrap();
    assert_eq!(sent.read_at, None);
    assert!(!sent.sender_deleted && !sent.receiver_deleted);

    let events = drain(&mut alice_rx);
    assert_eq!(new_messages(&events), vec![&sent]);
    assert!(notifications(&events).is_empty());

    assert_eq!(stored_thread(&gateway, "bob", "alice").await, vec![sent]);
}

#[tokio::test]
async fn send_to_attached_peer_is_read_on_arrival() {
    let (_db, gateway) = setup();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    let (mut bob, mut bob_rx) = ChatSession::open(gateway.clone(), "bob");

    alice.connect("bob").await.unwrap();
    bob.connect("alice").await.unwrap();
    assert_eq!(alice.group(), bob.group());
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    let sent = alice.send("bob", "hi").await.unwrap();
    assert_eq!(sent.read_at, Some(sent.sent_at));

    let bob_events = drain(&mut bob_rx);
    assert_eq!(new_messages(&bob_events), vec![&sent]);
    assert!(notifications(&bob_events).is_empty());
    assert_eq!(new_messages(&drain(&mut alice_rx)), vec![&sent]);

    let stored = stored_thread(&gateway, "bob", "alice").await;
    assert_eq!(stored[0].read_at, Some(sent.sent_at));
}

#[tokio::test]
async fn messaging_yourself_is_rejected_without_side_effects() {
    let (_db, gateway) = setup();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    alice.connect("bob").await.unwrap();
    drain(&mut alice_rx);

    for receiver in ["alice", "ALICE", " Alice "] {
        let err = alice.send(receiver, "hi").await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    assert_eq!(alice.state(), SessionState::Joined);
    assert!(drain(&mut alice_rx).is_empty());
    assert!(stored_thread(&gateway, "alice", "bob").await.is_empty());
}

#[tokio::test]
async fn unknown_receiver_and_bad_content_are_rejected() {
    let (_db, gateway) = setup();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    alice.connect("bob").await.unwrap();
    drain(&mut alice_rx);

    let err = alice.send("mallory", "hi").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
    assert_eq!(err.code(), "not_found");

    let err = alice.send("bob", "   ").await.unwrap_err();
    assert!(matches!(err, SessionError::Validation(_)));

    let too_long = "x".repeat(tandem_gateway::session::MAX_CONTENT_LEN + 1);
    let err = alice.send("bob", &too_long).await.unwrap_err();
    assert!(matches!(err, SessionError::Validation(_)));

    assert_eq!(alice.state(), SessionState::Joined);
    assert!(new_messages(&drain(&mut alice_rx)).is_empty());
}

#[tokio::test]
async fn receiver_online_elsewhere_gets_notification() {
    let (_db, gateway) = setup();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    let (mut bob_lobby, mut bob_lobby_rx) = ChatSession::open(gateway.clone(), "bob");
    let (mut bob_carol, mut bob_carol_rx) = ChatSession::open(gateway.clone(), "bob");

    alice.connect("bob").await.unwrap();
    bob_lobby.connect_presence().await.unwrap();
    bob_carol.connect("carol").await.unwrap();
    drain(&mut alice_rx);
    drain(&mut bob_lobby_rx);
    drain(&mut bob_carol_rx);

    let sent = alice.send("bob", "ping").await.unwrap();
    assert_eq!(sent.read_at, None);

    for rx in [&mut bob_lobby_rx, &mut bob_carol_rx] {
        let events = drain(rx);
        assert_eq!(notifications(&events), vec![("alice", "Alice")]);
        assert!(new_messages(&events).is_empty());
    }
    assert!(notifications(&drain(&mut alice_rx)).is_empty());
}

#[tokio::test]
async fn connect_marks_thread_read_once() {
    let (db, gateway) = setup();

    // bob writes while alice is away
    let (mut bob, _bob_rx) = ChatSession::open(gateway.clone(), "bob");
    bob.connect("alice").await.unwrap();
    let first = bob.send("alice", "one").await.unwrap();
    let second = bob.send("alice", "two").await.unwrap();
    assert!(first.read_at.is_none() && second.read_at.is_none());
    bob.disconnect().await;

    // alice's own outgoing message must stay unread
    send_message(&gateway, "alice", "bob", "three").await.unwrap();

    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    alice.connect("bob").await.unwrap();
    let delivered = thread(&drain(&mut alice_rx)).cloned().unwrap();
    assert_eq!(delivered.len(), 3);
    assert!(delivered[0].read_at.is_some() && delivered[1].read_at.is_some());
    assert!(delivered[2].read_at.is_none());

    let stored = db.get_message(&first.id.to_string()).unwrap().unwrap();
    assert!(stored.read_at.is_some());
    let read_at = stored_thread(&gateway, "alice", "bob").await[0].read_at;
    assert_eq!(read_at, delivered[0].read_at);
    alice.disconnect().await;

    // Second visit does not move the receipts
    let (mut again, mut again_rx) = ChatSession::open(gateway.clone(), "alice");
    again.connect("bob").await.unwrap();
    let redelivered = thread(&drain(&mut again_rx)).cloned().unwrap();
    assert_eq!(redelivered[0].read_at, read_at);
    assert_eq!(redelivered[1].read_at, delivered[1].read_at);
}

#[tokio::test]
async fn presence_transitions_fire_once_per_user() {
    let (_db, gateway) = setup();
    let (mut carol, mut carol_rx) = ChatSession::open(gateway.clone(), "carol");
    carol.connect_presence().await.unwrap();
    drain(&mut carol_rx);

    let (mut first, _first_rx) = ChatSession::open(gateway.clone(), "alice");
    let (mut second, _second_rx) = ChatSession::open(gateway.clone(), "alice");
    first.connect("bob").await.unwrap();
    second.connect_presence().await.unwrap();

    let events = drain(&mut carol_rx);
    assert_eq!(count_online(&events, "alice"), 1);
    assert_eq!(gateway.presence().connections("alice").len(), 2);

    first.disconnect().await;
    assert_eq!(count_offline(&drain(&mut carol_rx), "alice"), 0);
    assert!(gateway.presence().is_online("alice"));

    second.disconnect().await;
    assert_eq!(count_offline(&drain(&mut carol_rx), "alice"), 1);
    assert_eq!(gateway.presence().online_users(), ["carol"]);
}

#[tokio::test]
async fn failed_persistence_broadcasts_nothing() {
    let (store, gateway) = setup_flaky();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    let (mut bob, mut bob_rx) = ChatSession::open(gateway.clone(), "bob");
    alice.connect("bob").await.unwrap();
    bob.connect_presence().await.unwrap();
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    store.fail_appends.store(true, Ordering::SeqCst);
    let err = alice.send("bob", "lost").await.unwrap_err();
    assert!(matches!(err, SessionError::Operational(_)));
    assert_eq!(alice.state(), SessionState::Joined);
    assert!(drain(&mut alice_rx).is_empty());
    assert!(drain(&mut bob_rx).is_empty());
    assert!(stored_thread(&gateway, "alice", "bob").await.is_empty());

    store.fail_appends.store(false, Ordering::SeqCst);
    let sent = alice.send("bob", "kept").await.unwrap();
    assert_eq!(new_messages(&drain(&mut alice_rx)), vec![&sent]);
    assert_eq!(notifications(&drain(&mut bob_rx)), vec![("alice", "Alice")]);
}

#[tokio::test]
async fn disconnect_updates_group_and_runs_once() {
    let (db, gateway) = setup();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    let (mut bob, mut bob_rx) = ChatSession::open(gateway.clone(), "bob");
    alice.connect("bob").await.unwrap();
    bob.connect("alice").await.unwrap();
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    let alice_id = alice.connection().connection_id;
    alice.disconnect().await;
    alice.disconnect().await;
    assert_eq!(alice.state(), SessionState::Disconnected);

    let updates: Vec<_> = drain(&mut bob_rx)
        .into_iter()
        .filter_map(|e| match e {
            GatewayEvent::UpdatedGroup { group } => Some(group),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 1);
    assert!(!updates[0].has_user("alice"));
    assert!(updates[0].has_user("bob"));

    assert!(gateway.groups().find_by_connection(alice_id).is_none());
    assert!(db.remove_connection(&alice_id.to_string()).unwrap().is_none());

    // The departed connection hears nothing more about the group
    bob.send("alice", "still there?").await.unwrap();
    assert!(new_messages(&drain(&mut alice_rx)).is_empty());

    // A finished session cannot be revived
    assert!(matches!(alice.connect("bob").await, Err(SessionError::InvalidState(_))));
}

#[tokio::test]
async fn connecting_twice_is_rejected() {
    let (_db, gateway) = setup();
    let (mut alice, _alice_rx) = ChatSession::open(gateway.clone(), "alice");
    alice.connect("bob").await.unwrap();

    let err = alice.connect("carol").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(SessionState::Joined)));
    assert_eq!(alice.group(), Some(&GroupKey::for_pair("alice", "bob")));
}

#[tokio::test]
async fn sending_before_connect_is_rejected() {
    let (_db, gateway) = setup();
    let (mut alice, _alice_rx) = ChatSession::open(gateway.clone(), "alice");
    let err = alice.send("bob", "hi").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(SessionState::Disconnected)));
}

#[tokio::test]
async fn soft_delete_hides_per_side() {
    let (_db, gateway) = setup();
    let sent = send_message(&gateway, "alice", "bob", "oops").await.unwrap();
    let store = gateway.store();

    assert_eq!(store.delete_message(sent.id, "alice").unwrap(), DeleteOutcome::Hidden);
    assert!(stored_thread(&gateway, "alice", "bob").await.is_empty());
    assert_eq!(stored_thread(&gateway, "bob", "alice").await.len(), 1);

    assert_eq!(store.delete_message(sent.id, "bob").unwrap(), DeleteOutcome::Removed);
    assert!(stored_thread(&gateway, "bob", "alice").await.is_empty());
    assert!(stored_thread(&gateway, "alice", "bob").await.is_empty());
}

#[tokio::test]
async fn failed_attach_leaves_session_offline_and_disconnected() {
    let (store, gateway) = setup_flaky();
    let (mut carol, mut carol_rx) = ChatSession::open(gateway.clone(), "carol");
    carol.connect_presence().await.unwrap();
    drain(&mut carol_rx);

    store.fail_attaches.store(true, Ordering::SeqCst);
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    let err = alice.connect("bob").await.unwrap_err();

    assert!(matches!(err, SessionError::Operational(_)));
    assert_eq!(alice.state(), SessionState::Disconnected);
    assert!(alice.group().is_none());
    assert!(!gateway.presence().is_online("alice"));
    assert!(gateway.groups().find_by_connection(alice.connection().connection_id).is_none());
    assert!(gateway.groups().group(&GroupKey::for_pair("alice", "bob")).connections.is_empty());
    assert!(drain(&mut alice_rx).is_empty());
    assert_eq!(count_online(&drain(&mut carol_rx), "alice"), 0);

    // The session was not used up by the failure
    store.fail_attaches.store(false, Ordering::SeqCst);
    alice.connect("bob").await.unwrap();
    assert_eq!(alice.state(), SessionState::Joined);
    assert_eq!(count_online(&drain(&mut carol_rx), "alice"), 1);
}

#[tokio::test]
async fn failed_detach_still_leaves_the_live_group() {
    let (store, gateway) = setup_flaky();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    let (mut bob, mut bob_rx) = ChatSession::open(gateway.clone(), "bob");
    alice.connect("bob").await.unwrap();
    bob.connect("alice").await.unwrap();
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    store.fail_detaches.store(true, Ordering::SeqCst);
    let alice_id = alice.connection().connection_id;
    alice.disconnect().await;
    assert_eq!(alice.state(), SessionState::Disconnected);

    let bob_events = drain(&mut bob_rx);
    let updates: Vec<_> = bob_events
        .iter()
        .filter_map(|e| match e {
            GatewayEvent::UpdatedGroup { group } => Some(group),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 1);
    assert!(!updates[0].has_user("alice"));
    assert_eq!(count_offline(&bob_events, "alice"), 1);

    assert!(gateway.groups().find_by_connection(alice_id).is_none());
    assert!(!gateway.presence().is_online("alice"));

    // alice's row is stale until the startup purge; bob's is live
    store.fail_detaches.store(false, Ordering::SeqCst);
    assert_eq!(store.inner.clear_connections().unwrap(), 2);
}

#[tokio::test]
async fn thread_shows_receipts_as_stored() {
    let (store, gateway) = setup_flaky();
    let first = send_message(&gateway, "bob", "alice", "one").await.unwrap();
    let second = send_message(&gateway, "bob", "alice", "two").await.unwrap();

    store.preempt_mark_read.store(true, Ordering::SeqCst);
    let before_connect = now();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");
    alice.connect("bob").await.unwrap();

    let delivered = thread(&drain(&mut alice_rx)).cloned().unwrap();
    let stored = stored_thread(&gateway, "alice", "bob").await;
    assert_eq!(delivered, stored);

    assert_eq!(delivered[0].id, first.id);
    assert!(delivered[0].read_at.unwrap() < before_connect);
    assert_eq!(delivered[1].id, second.id);
    assert!(delivered[1].read_at.unwrap() >= before_connect);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_sent_while_joining_arrives_exactly_once() {
    let (store, gateway) = setup_flaky();
    let (mut entered, release) = store.pause_next_thread_fetch();
    let (mut alice, mut alice_rx) = ChatSession::open(gateway.clone(), "alice");

    let joining = tokio::spawn(async move {
        alice.connect("bob").await.unwrap();
        alice
    });
    entered.recv().await.unwrap();

    let sender = gateway.clone();
    let sending = tokio::spawn(async move { send_message(&sender, "bob", "alice", "you there?").await.unwrap() });

    // Give the send every chance to overtake the join
    tokio::time::sleep(Duration::from_millis(100)).await;
    release.send(()).unwrap();

    let _alice = joining.await.unwrap();
    let sent = sending.await.unwrap();
    assert_eq!(sent.read_at, Some(sent.sent_at));

    let events = drain(&mut alice_rx);
    let snapshot = thread(&events).unwrap();
    let live = new_messages(&events);
    let copies = snapshot.iter().filter(|m| m.id == sent.id).count() + live.iter().filter(|m| m.id == sent.id).count();
    assert_eq!(copies, 1);

    let snapshot_at = events
        .iter()
        .position(|e| matches!(e, GatewayEvent::ReceiveMessageThread { .. }))
        .unwrap();
    let live_at = events
        .iter()
        .position(|e| matches!(e, GatewayEvent::NewMessage { .. }))
        .unwrap();
    assert!(snapshot_at < live_at);
}
