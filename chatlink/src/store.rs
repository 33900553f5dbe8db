//! Conversation store: the stateful core of the synchronization engine.
//!
//! Owns the active conversation selection, the merged message list, the
//! loading flag, and the persistent-connection lifecycle. The store is the
//! sole mutator of message state: history fetches and live frames both
//! land here, and every UI-visible change is announced on the
//! [`StoreEvent`] channel.
//!
//! # Connection lifecycle
//!
//! ```text
//! Idle -> Connecting -> Open -> Retrying{1} -> Connecting -> ...
//!                                  |                   \-> Open (counter resets)
//!                                  v
//!                             Exhausted (after the attempt ceiling)
//! ```
//!
//! Every deferred continuation (retry timer, history completion, connect
//! completion, reader merge) carries the selection generation it was
//! started under and re-checks it under the lock before touching state.
//! A continuation from a superseded selection is a no-op, so two
//! conversations' data can never interleave in one list.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use chatlink_proto::codec::{self, CodecError};
use chatlink_proto::message::{ChatMessage, MessageId, OutboundPayload, UserId, ValidationError};

use crate::auth::CredentialProvider;
use crate::backoff;
use crate::history::{HistoryApi, HistoryError};
use crate::transport::{self, Connector, Transport, TransportError};

/// Default ceiling on consecutive reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default capacity of the store event channel.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Where the store is in the persistent-connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No connection and none pending.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// The live channel is up; frames flow.
    Open,
    /// Closed; reconnect attempt `attempt` is scheduled.
    Retrying {
        /// 1-based attempt counter driving the backoff delay.
        attempt: u32,
    },
    /// The attempt ceiling was exceeded; terminal until reselection.
    Exhausted,
}

/// User-visible failure conditions, surfaced as notifications rather than
/// faults. None of these crash anything; only [`Notice::ReconnectExhausted`]
/// and [`Notice::Unauthenticated`] end the current conversation's live
/// channel (history stays visible).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// No credential present; the auth collaborator must act.
    Unauthenticated,
    /// History payload was not an ordered list of records; list is empty.
    InvalidResponseFormat,
    /// History request failed at the transport level; list is empty.
    HistoryUnavailable,
    /// One inbound frame was undecodable and has been dropped.
    MalformedFrame,
    /// The live channel closed; reconnect `attempt` fires after `retry_in`.
    TransportClosed {
        /// 1-based reconnect attempt counter.
        attempt: u32,
        /// Backoff delay before the attempt.
        retry_in: Duration,
    },
    /// Reconnect ceiling exceeded; no further automatic attempts.
    ReconnectExhausted,
    /// Outbound payload had neither text nor image.
    EmptyMessage,
    /// Outbound send attempted while the channel was not open.
    NotConnected,
    /// Conversation selection was malformed and ignored.
    InvalidSelection,
}

/// Events emitted to the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The active conversation changed; the message list was reset.
    SelectionChanged {
        /// The newly selected remote participant.
        user: UserId,
    },
    /// The connection lifecycle moved to a new phase.
    ConnectionChanged(ConnectionPhase),
    /// History finished loading and replaced the message list.
    HistoryLoaded {
        /// The conversation the history belongs to.
        conversation: UserId,
        /// Number of records adopted.
        count: usize,
    },
    /// A live frame was merged onto the tail of the list.
    MessageMerged(ChatMessage),
    /// A failure condition for the notification surface (toast/log).
    Notice(Notice),
}

/// Errors returned by [`ChatStore::send_outbound`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The payload failed validation (empty, too large).
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The live channel is not open.
    #[error("not connected")]
    NotConnected,

    /// The payload could not be serialized.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The transport rejected the frame.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Store tunables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base URL the connect URL is composed from (`ws://` or `wss://`).
    pub ws_base_url: Url,
    /// Ceiling on consecutive reconnect attempts.
    pub max_reconnect_attempts: u32,
    /// Capacity of the [`StoreEvent`] channel.
    pub event_capacity: usize,
}

impl StoreConfig {
    /// Creates a config with default ceiling and channel capacity.
    #[must_use]
    pub const fn new(ws_base_url: Url) -> Self {
        Self {
            ws_base_url,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Mutable state behind the store's lock.
///
/// The lock is never held across an `.await`; every async continuation
/// re-acquires it and re-validates `generation` first.
struct StoreState<T> {
    /// The active conversation selection.
    selected: Option<UserId>,
    /// Merged message list, in arrival order.
    messages: Vec<ChatMessage>,
    /// Identifiers present in `messages`, for single-pass duplicate rejection.
    seen: HashSet<MessageId>,
    /// Whether a history fetch for the current selection is in flight.
    messages_loading: bool,
    /// Connection lifecycle phase.
    phase: ConnectionPhase,
    /// Consecutive reconnect attempts since the last successful open.
    attempts: u32,
    /// Selection generation; bumped on every (re)selection and teardown
    /// so stale continuations can detect they have been superseded.
    generation: u64,
    /// The single active connection handle, if any.
    conn: Option<Arc<T>>,
    /// Reader task draining the active connection.
    reader_task: Option<JoinHandle<()>>,
    /// Pending backoff timer for a scheduled reconnect.
    retry_timer: Option<JoinHandle<()>>,
}

impl<T> StoreState<T> {
    fn new() -> Self {
        Self {
            selected: None,
            messages: Vec::new(),
            seen: HashSet::new(),
            messages_loading: false,
            phase: ConnectionPhase::Idle,
            attempts: 0,
            generation: 0,
            conn: None,
            reader_task: None,
            retry_timer: None,
        }
    }

    /// Stops the live channel: cancels the retry timer and reader task,
    /// resets the phase and attempt counter, and hands back the connection
    /// (closing it requires an `.await`, so the caller does that outside
    /// the lock). The message list and selection are left alone.
    fn stop_connection(&mut self) -> Option<Arc<T>> {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
        self.phase = ConnectionPhase::Idle;
        self.attempts = 0;
        self.conn.take()
    }

    /// True if this state still belongs to the given selection generation.
    fn is_current(&self, generation: u64, peer: &UserId) -> bool {
        self.generation == generation && self.selected.as_ref() == Some(peer)
    }
}

/// The live-conversation store.
///
/// Generic over its injected collaborators so tests can substitute fakes:
/// `P` reads the current credential, `H` fetches history, and `C` opens
/// persistent connections. Constructed once per application session and
/// shared behind an [`Arc`]; all mutation goes through its own operations.
pub struct ChatStore<P, H, C: Connector> {
    creds: P,
    history: H,
    connector: C,
    config: StoreConfig,
    state: Mutex<StoreState<C::Conn>>,
    event_tx: mpsc::Sender<StoreEvent>,
}

impl<P, H, C> ChatStore<P, H, C>
where
    P: CredentialProvider + 'static,
    H: HistoryApi + 'static,
    C: Connector + 'static,
{
    /// Creates a store and the event receiver the UI collaborator drains.
    pub fn new(
        creds: P,
        history: H,
        connector: C,
        config: StoreConfig,
    ) -> (Arc<Self>, mpsc::Receiver<StoreEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let store = Arc::new(Self {
            creds,
            history,
            connector,
            config,
            state: Mutex::new(StoreState::new()),
            event_tx,
        });
        (store, event_rx)
    }

    // -----------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------

    /// Selects the conversation with `raw_id`.
    ///
    /// A malformed identifier is rejected silently: an
    /// [`Notice::InvalidSelection`] is reported and no state changes.
    /// On success the previous connection is torn down, the message list
    /// is cleared *before* any new data can arrive, and the history fetch
    /// and connection setup are started concurrently.
    pub fn select_conversation(self: &Arc<Self>, raw_id: &str) {
        let user = match UserId::parse(raw_id) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(id = raw_id, error = %e, "invalid conversation selection");
                self.notice(Notice::InvalidSelection);
                return;
            }
        };

        let generation;
        let old_conn;
        {
            let mut s = self.state.lock();
            s.generation += 1;
            generation = s.generation;
            old_conn = s.stop_connection();
            s.messages.clear();
            s.seen.clear();
            s.messages_loading = false;
            s.selected = Some(user.clone());
        }
        close_in_background(old_conn);

        tracing::info!(user = %user, "conversation selected");
        self.emit(StoreEvent::SelectionChanged { user: user.clone() });

        let fetch_store = Arc::clone(self);
        let fetch_user = user.clone();
        tokio::spawn(async move {
            fetch_store.load_history(fetch_user, generation).await;
        });

        let connect_store = Arc::clone(self);
        tokio::spawn(async move {
            Self::connect(connect_store, user, generation).await;
        });
    }

    /// Sends an outbound payload over the open live channel.
    ///
    /// The message is NOT appended locally; the server's broadcast of the
    /// finished record is the single source of truth, and it arrives back
    /// through [`merge_inbound`](Self::merge_inbound).
    ///
    /// # Errors
    ///
    /// [`SendError::Validation`] for an empty payload, or
    /// [`SendError::NotConnected`] when the channel is not open — both
    /// rejected synchronously with nothing transmitted.
    /// [`SendError::Transport`] when the open channel rejects the frame;
    /// the closure path then drives reconnection.
    pub async fn send_outbound(&self, payload: &OutboundPayload) -> Result<(), SendError> {
        if let Err(e) = payload.validate() {
            if e == ValidationError::Empty {
                self.notice(Notice::EmptyMessage);
            }
            tracing::warn!(error = %e, "outbound payload rejected");
            return Err(SendError::Validation(e));
        }

        let conn = {
            let s = self.state.lock();
            if s.phase != ConnectionPhase::Open {
                drop(s);
                self.notice(Notice::NotConnected);
                return Err(SendError::NotConnected);
            }
            s.conn.clone().ok_or(SendError::NotConnected)?
        };

        let frame = codec::encode_outbound(payload)?;
        conn.send(&frame).await?;
        tracing::debug!("outbound frame sent");
        Ok(())
    }

    /// Merges an inbound message onto the tail of the current list.
    ///
    /// Idempotent: a message whose identifier is already present is
    /// dropped, so duplicate delivery never produces a duplicate entry.
    /// This is the sole growth path for network-delivered messages.
    pub fn merge_inbound(&self, message: ChatMessage) {
        let mut s = self.state.lock();
        Self::merge_locked(&mut s, message, &self.event_tx);
    }

    /// Tears down the live channel without clearing the message list —
    /// history stays visible after disconnect. Cancels any scheduled
    /// reconnect. A later reselection restarts the machine from `Idle`.
    pub fn teardown(&self) {
        let old_conn = {
            let mut s = self.state.lock();
            // Invalidate in-flight continuations (timers, fetches, readers).
            s.generation += 1;
            s.messages_loading = false;
            s.stop_connection()
        };
        close_in_background(old_conn);
        tracing::info!("live channel torn down");
        self.emit(StoreEvent::ConnectionChanged(ConnectionPhase::Idle));
    }

    // -----------------------------------------------------------------
    // Reactive reads
    // -----------------------------------------------------------------

    /// Snapshot of the current message list, in arrival order.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().messages.clone()
    }

    /// Whether a history fetch for the current selection is in flight.
    #[must_use]
    pub fn is_messages_loading(&self) -> bool {
        self.state.lock().messages_loading
    }

    /// The currently selected remote participant, if any.
    #[must_use]
    pub fn selected_user(&self) -> Option<UserId> {
        self.state.lock().selected.clone()
    }

    /// The current connection lifecycle phase.
    #[must_use]
    pub fn connection_phase(&self) -> ConnectionPhase {
        self.state.lock().phase
    }

    /// Consecutive reconnect attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    // -----------------------------------------------------------------
    // History loading
    // -----------------------------------------------------------------

    /// Fetches history for `peer` and adopts it if the selection is still
    /// current when the response lands. The loading flag is cleared on
    /// every exit path by the drop guard.
    async fn load_history(self: &Arc<Self>, peer: UserId, generation: u64) {
        {
            let mut s = self.state.lock();
            if !s.is_current(generation, &peer) {
                return;
            }
            s.messages_loading = true;
        }
        let _guard = LoadingGuard {
            store: self,
            generation,
        };

        let Some(token) = self.creds.access_token() else {
            tracing::warn!(peer = %peer, "no credential, history fetch aborted");
            self.notice(Notice::Unauthenticated);
            return;
        };

        match self.history.fetch_conversation(&peer, &token).await {
            Ok(list) => {
                let count = list.len();
                {
                    let mut s = self.state.lock();
                    if !s.is_current(generation, &peer) {
                        tracing::debug!(peer = %peer, "stale history response discarded");
                        return;
                    }
                    s.seen = list.iter().map(|m| m.id).collect();
                    s.messages = list;
                }
                tracing::info!(peer = %peer, count, "history adopted");
                self.emit(StoreEvent::HistoryLoaded {
                    conversation: peer,
                    count,
                });
            }
            Err(e) => {
                // Failures never throw into the caller: the list defaults
                // to empty and one notice is surfaced.
                {
                    let mut s = self.state.lock();
                    if s.is_current(generation, &peer) {
                        s.messages.clear();
                        s.seen.clear();
                    }
                }
                tracing::warn!(peer = %peer, error = %e, "history fetch failed");
                self.notice(match e {
                    HistoryError::Unauthorized => Notice::Unauthenticated,
                    HistoryError::InvalidFormat(_) => Notice::InvalidResponseFormat,
                    HistoryError::Request(_) => Notice::HistoryUnavailable,
                });
            }
        }
    }

    // -----------------------------------------------------------------
    // Connection supervision
    // -----------------------------------------------------------------

    /// Opens the live channel for `peer` under selection `generation`.
    ///
    /// A no-op when the selection has moved on or a connection is already
    /// open or in flight. An absent credential aborts the transition
    /// before it starts.
    async fn connect(store: Arc<Self>, peer: UserId, generation: u64) {
        {
            let s = store.state.lock();
            if !s.is_current(generation, &peer) {
                return;
            }
            if matches!(
                s.phase,
                ConnectionPhase::Open | ConnectionPhase::Connecting
            ) {
                tracing::debug!(peer = %peer, "connection already active, setup is a no-op");
                return;
            }
        }

        let Some(token) = store.creds.access_token() else {
            tracing::warn!(peer = %peer, "no credential, connection aborted");
            store.notice(Notice::Unauthenticated);
            return;
        };

        let url = match transport::chat_url(&store.config.ws_base_url, &token, peer.as_str()) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = %e, "could not compose connect url");
                return;
            }
        };

        {
            let mut s = store.state.lock();
            if !s.is_current(generation, &peer) {
                return;
            }
            s.phase = ConnectionPhase::Connecting;
        }
        store.emit(StoreEvent::ConnectionChanged(ConnectionPhase::Connecting));
        tracing::debug!(peer = %peer, "opening live channel");

        match store.connector.connect(&url).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                {
                    let mut s = store.state.lock();
                    if !s.is_current(generation, &peer) {
                        // Selection moved on while the handshake ran.
                        drop(s);
                        close_in_background(Some(conn));
                        return;
                    }
                    s.conn = Some(Arc::clone(&conn));
                    s.attempts = 0;
                    s.phase = ConnectionPhase::Open;

                    let reader_store = Arc::clone(&store);
                    let reader_peer = peer.clone();
                    s.reader_task = Some(tokio::spawn(async move {
                        reader_store
                            .read_loop(conn, reader_peer, generation)
                            .await;
                    }));
                }
                tracing::info!(peer = %peer, "live channel open");
                store.emit(StoreEvent::ConnectionChanged(ConnectionPhase::Open));
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "connection attempt failed");
                store.handle_closed(&peer, generation);
            }
        }
    }

    /// Drains inbound frames until the connection closes, then hands off
    /// to closure handling. Malformed frames are dropped with a notice;
    /// the connection stays open.
    async fn read_loop(self: &Arc<Self>, conn: Arc<C::Conn>, peer: UserId, generation: u64) {
        loop {
            match conn.recv().await {
                Ok(frame) => match codec::decode_frame(&frame) {
                    Ok(message) => {
                        let mut s = self.state.lock();
                        if !s.is_current(generation, &peer) {
                            return;
                        }
                        Self::merge_locked(&mut s, message, &self.event_tx);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed inbound frame dropped");
                        self.notice(Notice::MalformedFrame);
                    }
                },
                Err(_) => break,
            }
        }
        self.handle_closed(&peer, generation);
    }

    /// Transition out of `Open`/`Connecting` after the transport reported
    /// closure. Increments the attempt counter and either schedules the
    /// next attempt behind the backoff delay or gives up for good.
    fn handle_closed(self: &Arc<Self>, peer: &UserId, generation: u64) {
        let scheduled = {
            let mut s = self.state.lock();
            if !s.is_current(generation, peer) {
                return;
            }
            s.conn = None;
            s.reader_task = None;
            s.attempts += 1;

            if s.attempts > self.config.max_reconnect_attempts {
                s.phase = ConnectionPhase::Exhausted;
                None
            } else {
                let attempt = s.attempts;
                let delay = backoff::reconnect_delay(attempt);
                s.phase = ConnectionPhase::Retrying { attempt };

                let retry_store = Arc::clone(self);
                let retry_peer = peer.clone();
                s.retry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // The originally-targeted conversation must still be
                    // the active selection when the timer fires.
                    let still_current = retry_store
                        .state
                        .lock()
                        .is_current(generation, &retry_peer);
                    if still_current {
                        Self::connect(retry_store, retry_peer, generation).await;
                    }
                }));
                Some((attempt, delay))
            }
        };

        match scheduled {
            Some((attempt, retry_in)) => {
                tracing::warn!(
                    peer = %peer,
                    attempt,
                    retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    "live channel closed, reconnect scheduled"
                );
                self.emit(StoreEvent::ConnectionChanged(ConnectionPhase::Retrying {
                    attempt,
                }));
                self.notice(Notice::TransportClosed { attempt, retry_in });
            }
            None => {
                tracing::error!(
                    peer = %peer,
                    ceiling = self.config.max_reconnect_attempts,
                    "reconnect attempts exhausted"
                );
                self.emit(StoreEvent::ConnectionChanged(ConnectionPhase::Exhausted));
                self.notice(Notice::ReconnectExhausted);
            }
        }
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    /// Tail-append under the lock iff the identifier is new.
    fn merge_locked(
        s: &mut StoreState<C::Conn>,
        message: ChatMessage,
        event_tx: &mpsc::Sender<StoreEvent>,
    ) {
        if !s.seen.insert(message.id) {
            tracing::debug!(id = %message.id, "duplicate message dropped");
            return;
        }
        s.messages.push(message.clone());
        if event_tx
            .try_send(StoreEvent::MessageMerged(message))
            .is_err()
        {
            tracing::debug!("event channel full or closed, merge event dropped");
        }
    }

    fn emit(&self, event: StoreEvent) {
        if self.event_tx.try_send(event).is_err() {
            tracing::debug!("event channel full or closed, event dropped");
        }
    }

    fn notice(&self, notice: Notice) {
        self.emit(StoreEvent::Notice(notice));
    }
}

/// Closes a connection handle off the caller's path. Best-effort; the
/// handle is gone either way.
fn close_in_background<T: Transport + Send + Sync + 'static>(conn: Option<Arc<T>>) {
    if let Some(conn) = conn {
        tokio::spawn(async move {
            conn.close().await;
        });
    }
}

/// Clears the loading flag when the fetch exits, on every path — but only
/// if the flag still belongs to this fetch's selection generation, so a
/// stale fetch finishing late cannot clobber a newer fetch's flag.
struct LoadingGuard<'a, P, H, C: Connector> {
    store: &'a ChatStore<P, H, C>,
    generation: u64,
}

impl<P, H, C: Connector> Drop for LoadingGuard<'_, P, H, C> {
    fn drop(&mut self) {
        let mut s = self.store.state.lock();
        if s.generation == self.generation {
            s.messages_loading = false;
        }
    }
}
