// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for the conversation store's synchronization
//! semantics: selection resets, history adoption, live-frame merging,
//! duplicate suppression, and outbound validation — all against scripted
//! in-process collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use chatlink::auth::CredentialProvider;
use chatlink::history::{HistoryApi, HistoryError};
use chatlink::store::{ChatStore, ConnectionPhase, Notice, StoreConfig, StoreEvent};
use chatlink::transport::{Connector, Transport, TransportError};
use chatlink_proto::codec::CodecError;
use chatlink_proto::message::{ChatMessage, MessageId, OutboundPayload, Timestamp, UserId};

// =============================================================================
// Fake collaborators
// =============================================================================

/// Credential provider with a switchable token.
#[derive(Default)]
struct FakeCreds {
    token: Mutex<Option<String>>,
}

impl FakeCreds {
    fn logged_in() -> Self {
        Self {
            token: Mutex::new(Some("tok".to_string())),
        }
    }
}

impl CredentialProvider for FakeCreds {
    fn access_token(&self) -> Option<String> {
        self.token.lock().clone()
    }
}

/// What one history fetch should do.
enum HistoryScript {
    Reply(Vec<ChatMessage>),
    ReplyAfter(Duration, Vec<ChatMessage>),
    Fail(HistoryError),
}

/// History source scripted per conversation id.
#[derive(Default)]
struct FakeHistory {
    scripts: Mutex<HashMap<String, HistoryScript>>,
}

impl FakeHistory {
    fn with(mut self, peer: &str, script: HistoryScript) -> Self {
        self.scripts.get_mut().insert(peer.to_string(), script);
        self
    }
}

impl HistoryApi for FakeHistory {
    async fn fetch_conversation(
        &self,
        peer: &UserId,
        _token: &str,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let script = self.scripts.lock().remove(peer.as_str());
        match script {
            Some(HistoryScript::Reply(list)) => Ok(list),
            Some(HistoryScript::ReplyAfter(delay, list)) => {
                tokio::time::sleep(delay).await;
                Ok(list)
            }
            Some(HistoryScript::Fail(e)) => Err(e),
            None => Ok(Vec::new()),
        }
    }
}

/// A scripted in-process connection. The test side holds a [`ConnHandle`]
/// to push inbound frames, inspect sent frames, and sever the link.
struct FakeConn {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    sent: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicBool>,
}

/// Test-side controls for one [`FakeConn`].
struct ConnHandle {
    frames: mpsc::UnboundedSender<String>,
    sent: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicBool>,
}

impl ConnHandle {
    fn push_frame(&self, frame: &str) {
        self.frames.send(frame.to_string()).unwrap();
    }

    /// Severs the connection: the store's reader observes closure.
    fn sever(self) {
        self.open.store(false, Ordering::Relaxed);
        drop(self.frames);
    }

    fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

fn fake_conn() -> (FakeConn, ConnHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let open = Arc::new(AtomicBool::new(true));
    let conn = FakeConn {
        inbound: tokio::sync::Mutex::new(rx),
        sent: Arc::clone(&sent),
        open: Arc::clone(&open),
    };
    let handle = ConnHandle {
        frames: tx,
        sent,
        open,
    };
    (conn, handle)
}

impl Transport for FakeConn {
    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        self.sent.lock().push(frame.to_string());
        Ok(())
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.inbound.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// Connector that hands out pre-scripted connections in order and records
/// every connect URL. Once the script runs dry, attempts are refused.
#[derive(Default)]
struct FakeConnector {
    queued: Mutex<VecDeque<FakeConn>>,
    urls: Mutex<Vec<Url>>,
    attempts: AtomicU32,
}

impl FakeConnector {
    fn queue(&self) -> ConnHandle {
        let (conn, handle) = fake_conn();
        self.queued.lock().push_back(conn);
        handle
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn connect_urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }
}

impl Connector for FakeConnector {
    type Conn = FakeConn;

    async fn connect(&self, url: &Url) -> Result<FakeConn, TransportError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.urls.lock().push(url.clone());
        self.queued
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Unreachable("script exhausted".to_string()))
    }
}

// =============================================================================
// Helpers
// =============================================================================

type TestStore = Arc<ChatStore<FakeCreds, FakeHistory, Arc<FakeConnector>>>;

fn msg(id: u64, sender: &str, text: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::new(id),
        sender_id: UserId::parse(sender).unwrap(),
        text: Some(text.to_string()),
        image: None,
        timestamp: Timestamp::from_millis(id * 1000),
    }
}

fn frame(id: u64, sender: &str, text: &str) -> String {
    format!(r#"{{"id":{id},"sender_id":"{sender}","text":"{text}","timestamp":{}}}"#, id * 1000)
}

fn store_with(
    creds: FakeCreds,
    history: FakeHistory,
    connector: &Arc<FakeConnector>,
) -> (TestStore, mpsc::Receiver<StoreEvent>) {
    let config = StoreConfig::new(Url::parse("ws://test.invalid").unwrap());
    ChatStore::new(creds, history, Arc::clone(connector), config)
}

/// Waits for an event matching `pred`, skipping others. Panics on timeout.
async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<StoreEvent>,
    description: &str,
    pred: F,
) -> StoreEvent
where
    F: Fn(&StoreEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return evt,
            Ok(Some(_other)) => {}
            Ok(None) => panic!("channel closed while waiting for {description}"),
            Err(_) => panic!("timeout waiting for {description}"),
        }
    }
}

async fn wait_for_open(rx: &mut mpsc::Receiver<StoreEvent>) {
    wait_for_event(rx, "ConnectionChanged(Open)", |evt| {
        matches!(evt, StoreEvent::ConnectionChanged(ConnectionPhase::Open))
    })
    .await;
}

async fn wait_for_history(rx: &mut mpsc::Receiver<StoreEvent>) -> usize {
    let evt = wait_for_event(rx, "HistoryLoaded", |evt| {
        matches!(evt, StoreEvent::HistoryLoaded { .. })
    })
    .await;
    match evt {
        StoreEvent::HistoryLoaded { count, .. } => count,
        _ => unreachable!(),
    }
}

async fn wait_for_merge(rx: &mut mpsc::Receiver<StoreEvent>) -> ChatMessage {
    let evt = wait_for_event(rx, "MessageMerged", |evt| {
        matches!(evt, StoreEvent::MessageMerged(_))
    })
    .await;
    match evt {
        StoreEvent::MessageMerged(m) => m,
        _ => unreachable!(),
    }
}

async fn wait_for_notice<F>(rx: &mut mpsc::Receiver<StoreEvent>, pred: F) -> Notice
where
    F: Fn(&Notice) -> bool,
{
    let evt = wait_for_event(rx, "Notice", |evt| {
        matches!(evt, StoreEvent::Notice(n) if pred(n))
    })
    .await;
    match evt {
        StoreEvent::Notice(n) => n,
        _ => unreachable!(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn selection_loads_history_and_opens_channel() {
    let connector = Arc::new(FakeConnector::default());
    let _handle = connector.queue();
    let history =
        FakeHistory::default().with("42", HistoryScript::Reply(vec![msg(1, "42", "hello")]));
    let (store, mut rx) = store_with(FakeCreds::logged_in(), history, &connector);

    store.select_conversation("42");

    assert_eq!(wait_for_history(&mut rx).await, 1);
    wait_for_open(&mut rx).await;

    assert_eq!(store.selected_user(), Some(UserId::parse("42").unwrap()));
    assert!(!store.is_messages_loading());
    let ids: Vec<u64> = store.messages().iter().map(|m| m.id.as_u64()).collect();
    assert_eq!(ids, vec![1]);

    // The connect URL carries the credential and the conversation.
    let urls = connector.connect_urls();
    assert_eq!(urls.len(), 1);
    assert_eq!(urls[0].query(), Some("token=tok&receiver_id=42"));
}

#[tokio::test]
async fn live_frames_merge_in_order_and_deduplicate() {
    let connector = Arc::new(FakeConnector::default());
    let handle = connector.queue();
    let history =
        FakeHistory::default().with("42", HistoryScript::Reply(vec![msg(1, "42", "old")]));
    let (store, mut rx) = store_with(FakeCreds::logged_in(), history, &connector);

    store.select_conversation("42");
    wait_for_history(&mut rx).await;
    wait_for_open(&mut rx).await;

    handle.push_frame(&frame(2, "42", "live"));
    let merged = wait_for_merge(&mut rx).await;
    assert_eq!(merged.id, MessageId::new(2));

    // Redelivery of the same identifier is a no-op.
    handle.push_frame(&frame(2, "42", "live"));
    // A later distinct frame proves the duplicate was processed and dropped.
    handle.push_frame(&frame(3, "42", "after"));
    let merged = wait_for_merge(&mut rx).await;
    assert_eq!(merged.id, MessageId::new(3));

    let ids: Vec<u64> = store.messages().iter().map(|m| m.id.as_u64()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_channel_survives() {
    let connector = Arc::new(FakeConnector::default());
    let handle = connector.queue();
    let (store, mut rx) = store_with(FakeCreds::logged_in(), FakeHistory::default(), &connector);

    store.select_conversation("42");
    wait_for_open(&mut rx).await;

    handle.push_frame("{ this is not json");
    wait_for_notice(&mut rx, |n| *n == Notice::MalformedFrame).await;

    // The connection is still open and still delivers.
    handle.push_frame(&frame(5, "42", "still here"));
    wait_for_merge(&mut rx).await;
    assert_eq!(store.connection_phase(), ConnectionPhase::Open);
    assert_eq!(store.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_history_never_populates_new_selection() {
    let connector = Arc::new(FakeConnector::default());
    let _h1 = connector.queue();
    let _h2 = connector.queue();
    // "42"'s fetch is slow; "7"'s is instant.
    let history = FakeHistory::default()
        .with(
            "42",
            HistoryScript::ReplyAfter(Duration::from_millis(500), vec![msg(1, "42", "stale")]),
        )
        .with("7", HistoryScript::Reply(vec![msg(9, "7", "fresh")]));
    let (store, mut rx) = store_with(FakeCreds::logged_in(), history, &connector);

    store.select_conversation("42");
    // Reselect before the slow fetch completes.
    store.select_conversation("7");
    assert_eq!(store.messages(), Vec::new());

    let count = wait_for_history(&mut rx).await;
    assert_eq!(count, 1);

    // Let the stale fetch for "42" complete and be discarded.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let ids: Vec<u64> = store.messages().iter().map(|m| m.id.as_u64()).collect();
    assert_eq!(ids, vec![9], "stale history for '42' must be discarded");
    assert_eq!(store.selected_user(), Some(UserId::parse("7").unwrap()));
    assert!(!store.is_messages_loading());
}

#[tokio::test]
async fn history_failure_leaves_empty_list_and_clears_loading() {
    let connector = Arc::new(FakeConnector::default());
    let _handle = connector.queue();
    let history = FakeHistory::default().with(
        "42",
        HistoryScript::Fail(HistoryError::InvalidFormat(CodecError::InvalidShape(
            "object".to_string(),
        ))),
    );
    let (store, mut rx) = store_with(FakeCreds::logged_in(), history, &connector);

    store.select_conversation("42");
    wait_for_notice(&mut rx, |n| *n == Notice::InvalidResponseFormat).await;

    assert_eq!(store.messages(), Vec::new());
    assert!(!store.is_messages_loading());
}

#[tokio::test]
async fn missing_credential_reports_unauthenticated_and_stays_idle() {
    let connector = Arc::new(FakeConnector::default());
    let (store, mut rx) = store_with(FakeCreds::default(), FakeHistory::default(), &connector);

    store.select_conversation("42");
    wait_for_notice(&mut rx, |n| *n == Notice::Unauthenticated).await;

    assert_eq!(store.connection_phase(), ConnectionPhase::Idle);
    assert_eq!(connector.attempts(), 0, "no network call without a credential");
    assert!(!store.is_messages_loading());
}

#[tokio::test]
async fn send_transmits_only_the_payload_and_does_not_append() {
    let connector = Arc::new(FakeConnector::default());
    let handle = connector.queue();
    let (store, mut rx) = store_with(FakeCreds::logged_in(), FakeHistory::default(), &connector);

    store.select_conversation("42");
    wait_for_open(&mut rx).await;

    let payload = OutboundPayload {
        text: "hi there".to_string(),
        image: None,
    };
    store.send_outbound(&payload).await.unwrap();

    assert_eq!(handle.sent_frames(), vec![r#"{"text":"hi there"}"#.to_string()]);
    // No optimistic append: the list grows only when the server echoes.
    assert_eq!(store.messages(), Vec::new());

    handle.push_frame(&frame(11, "me", "hi there"));
    wait_for_merge(&mut rx).await;
    assert_eq!(store.messages().len(), 1);
}

#[tokio::test]
async fn rejected_sends_transmit_nothing() {
    let connector = Arc::new(FakeConnector::default());
    let handle = connector.queue();
    let (store, mut rx) = store_with(FakeCreds::logged_in(), FakeHistory::default(), &connector);

    store.select_conversation("42");
    wait_for_open(&mut rx).await;

    let empty = OutboundPayload {
        text: String::new(),
        image: None,
    };
    assert!(store.send_outbound(&empty).await.is_err());
    assert_eq!(handle.sent_frames(), Vec::<String>::new());

    store.teardown();
    let valid = OutboundPayload {
        text: "hello".to_string(),
        image: None,
    };
    assert!(store.send_outbound(&valid).await.is_err());
    assert_eq!(handle.sent_frames(), Vec::<String>::new());
}

#[tokio::test]
async fn teardown_stops_live_channel_but_keeps_history() {
    let connector = Arc::new(FakeConnector::default());
    let handle = connector.queue();
    let history =
        FakeHistory::default().with("42", HistoryScript::Reply(vec![msg(1, "42", "kept")]));
    let (store, mut rx) = store_with(FakeCreds::logged_in(), history, &connector);

    store.select_conversation("42");
    wait_for_history(&mut rx).await;
    wait_for_open(&mut rx).await;

    store.teardown();
    assert_eq!(store.connection_phase(), ConnectionPhase::Idle);
    assert_eq!(store.messages().len(), 1, "history stays visible");

    // A frame pushed after teardown must not reach the list.
    handle.push_frame(&frame(2, "42", "late"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.messages().len(), 1);
}

#[tokio::test]
async fn reselecting_same_conversation_restarts_cleanly() {
    let connector = Arc::new(FakeConnector::default());
    let _h1 = connector.queue();
    let h2 = connector.queue();
    let history = FakeHistory::default()
        .with("42", HistoryScript::Reply(vec![msg(1, "42", "x")]));
    let (store, mut rx) = store_with(FakeCreds::logged_in(), history, &connector);

    store.select_conversation("42");
    wait_for_history(&mut rx).await;
    wait_for_open(&mut rx).await;
    assert_eq!(connector.attempts(), 1);

    // Reselecting tears the old channel down and opens a fresh handle;
    // the list is cleared before the (now-empty) history lands.
    store.select_conversation("42");
    assert_eq!(store.messages(), Vec::new());
    wait_for_open(&mut rx).await;
    assert_eq!(connector.attempts(), 2);

    h2.push_frame(&frame(4, "42", "on fresh handle"));
    wait_for_merge(&mut rx).await;
    let ids: Vec<u64> = store.messages().iter().map(|m| m.id.as_u64()).collect();
    assert_eq!(ids, vec![4]);
}
