//! Persistent-connection transport for the synchronization engine.
//!
//! Defines the [`Transport`] trait (one live connection) and the
//! [`Connector`] trait (factory producing a fresh connection per attempt),
//! plus the WebSocket implementation used in production. The store never
//! reuses a handle across opens: every reconnect attempt asks the
//! [`Connector`] for a brand-new [`Transport`].
//!
//! Frames are UTF-8 JSON text. The server authenticates the connection via
//! URL query parameters, so there is no post-connect handshake.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

/// Type alias for the write half of a WebSocket connection.
type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for establishing the WebSocket connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the inbound frame channel fed by the reader task.
const INCOMING_CAPACITY: usize = 256;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed (server close, network drop).
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection attempt timed out.
    #[error("transport operation timed out")]
    Timeout,

    /// The server is unreachable (refused, unresolvable).
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live bidirectional connection carrying text frames.
///
/// Implementations deliver inbound frames in the order the network
/// produced them; the engine performs no reordering.
pub trait Transport: Send + Sync {
    /// Send one outbound text frame.
    ///
    /// Returns `Ok(())` when the frame has been handed to the underlying
    /// connection. This does NOT guarantee delivery — the server's echo
    /// of the finished record is the only confirmation.
    fn send(
        &self,
        frame: &str,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next inbound text frame.
    ///
    /// Blocks asynchronously until a frame arrives. Returns
    /// [`TransportError::ConnectionClosed`] once the connection is gone.
    fn recv(&self) -> impl std::future::Future<Output = Result<String, TransportError>> + Send;

    /// Close the connection. Idempotent and best-effort.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;
}

/// Factory producing a fresh [`Transport`] per connection attempt.
///
/// Injected into the store so tests can substitute a scripted in-process
/// transport for the real WebSocket stack.
pub trait Connector: Send + Sync {
    /// The connection type this factory produces.
    type Conn: Transport + Send + Sync + 'static;

    /// Open a new connection to `url`.
    fn connect(
        &self,
        url: &Url,
    ) -> impl std::future::Future<Output = Result<Self::Conn, TransportError>> + Send;
}

impl<C: Connector> Connector for std::sync::Arc<C> {
    type Conn = C::Conn;

    fn connect(
        &self,
        url: &Url,
    ) -> impl std::future::Future<Output = Result<Self::Conn, TransportError>> + Send {
        self.as_ref().connect(url)
    }
}

/// Production [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl WsConnector {
    /// Creates a connector with the given connect timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self, url: &Url) -> Result<WsConnection, TransportError> {
        WsConnection::open(url, self.connect_timeout).await
    }
}

/// A live WebSocket connection.
///
/// Created via [`WsConnector::connect`], which establishes the connection
/// and spawns a background reader task that forwards text frames into an
/// internal channel. Dropping the connection (or calling
/// [`close`](Transport::close)) ends the reader.
pub struct WsConnection {
    /// Write half (shared for concurrent sends).
    sink: Arc<Mutex<WsSink>>,
    /// Frames received by the background reader task.
    incoming: Mutex<mpsc::Receiver<String>>,
    /// Whether the underlying connection is still up.
    open: Arc<AtomicBool>,
    /// Handle to the background reader task (kept for the connection's lifetime).
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl WsConnection {
    async fn open(url: &Url, connect_timeout: Duration) -> Result<Self, TransportError> {
        let (ws_stream, _response) =
            tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %url, "WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %url, err = %e, "WebSocket connect failed");
                    map_ws_connect_error(e)
                })?;

        let (sink, reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));
        let reader_open = Arc::clone(&open);
        let reader_handle = tokio::spawn(reader_loop(reader, tx, reader_open));

        Ok(Self {
            sink: Arc::new(Mutex::new(sink)),
            incoming: Mutex::new(rx),
            open,
            _reader_handle: reader_handle,
        })
    }
}

impl Transport for WsConnection {
    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "WebSocket send failed");
                self.open.store(false, Ordering::Relaxed);
                TransportError::ConnectionClosed
            })
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            tracing::debug!(err = %e, "close frame not delivered");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// Background task that reads WebSocket messages and forwards text frames.
///
/// Non-text frames are ignored (ping/pong are handled by the library).
/// Sets `open` to `false` when the connection closes or errors out, which
/// in turn makes [`Transport::recv`] report `ConnectionClosed` once the
/// channel drains.
async fn reader_loop(mut reader: WsReader, tx: mpsc::Sender<String>, open: Arc<AtomicBool>) {
    while let Some(msg_result) = reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if tx.send(text.to_string()).await.is_err() {
                    // Receiver dropped — the connection was discarded, exit.
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!("ignoring binary frame on text protocol");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    open.store(false, Ordering::Relaxed);
    tracing::debug!("WebSocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            // DNS/network failures surface as io errors.
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(io_err.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => TransportError::Unreachable(format!(
            "server rejected upgrade: status {}",
            response.status()
        )),
        other => TransportError::Io(std::io::Error::other(format!("connection error: {other}"))),
    }
}

/// Composes the connect URL for a conversation.
///
/// The path is `/ws/chat/` under the configured base; the current bearer
/// token and the remote participant's identifier ride as query
/// parameters, which is how the server authenticates the connection.
///
/// # Errors
///
/// Returns `url::ParseError` if the base cannot be joined with the path.
pub fn chat_url(ws_base: &Url, token: &str, receiver_id: &str) -> Result<Url, url::ParseError> {
    let mut url = ws_base.join("/ws/chat/")?;
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("receiver_id", receiver_id);
    Ok(url)
}
