//! Transport-level WebSocket connection management.
//!
//! Each accepted socket is owned by one [`Connection`]: a reader pump, a
//! writer pump, a bounded send buffer, and a single-fire close latch. All
//! failure paths collapse into [`TransportHandle::close`]; the peer is
//! expected to reconnect.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of the per-connection send buffer.
const SEND_BUFFER_SIZE: usize = 256;

/// Callback invoked for each complete text or binary message, synchronously
/// on the reader task.
pub type MessageHandler = Arc<dyn Fn(Uuid, Vec<u8>) + Send + Sync>;

/// Callback invoked exactly once when the connection closes.
pub type CloseHandler = Arc<dyn Fn(Uuid, &CloseReason) + Send + Sync>;

/// Why a connection was closed.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// The peer closed the socket or the stream ended.
    PeerClosed,
    /// No frame arrived within the configured read timeout.
    ReadTimeout,
    /// The connection was displaced by a newer socket for the same user.
    Cycled,
    /// The server is shutting down.
    ServerShutdown,
    /// A read or write error on the underlying socket.
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::ReadTimeout => write!(f, "read timeout"),
            CloseReason::Cycled => write!(f, "connection cycled by new connection"),
            CloseReason::ServerShutdown => write!(f, "graceful shutdown"),
            CloseReason::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

/// Transport configuration shared by all connections.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// Deadline applied to every individual read.
    pub read_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
        }
    }
}

struct TransportInner {
    id: Uuid,
    send_tx: mpsc::Sender<Vec<u8>>,
    cancel: watch::Sender<bool>,
    done: watch::Sender<bool>,
    closed: AtomicBool,
    reason: Mutex<Option<CloseReason>>,
    on_message: Mutex<Option<MessageHandler>>,
    on_close: Mutex<Option<CloseHandler>>,
}

/// Cheap-to-clone handle for sending bytes to and closing one connection.
///
/// This is the object the topology store keeps per connection; the pumps and
/// their socket stay behind the scenes.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<TransportInner>,
}

impl TransportHandle {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Enqueues `bytes` for delivery. Concurrent-safe and non-blocking:
    /// drops silently once the connection is closed, and drops (with a log
    /// line) when the buffer is full rather than ever blocking a producer.
    pub fn send(&self, bytes: Vec<u8>) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        match self.inner.send_tx.try_send(bytes) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %self.inner.id, "send buffer full, dropping outbound message");
            }
        }
    }

    /// Closes the connection. Idempotent: the first caller records the
    /// reason, signals both pumps to stop, invokes the registered close
    /// callback, and marks the connection done; later callers are no-ops.
    /// The writer pump emits the normal-closure frame on its way out.
    pub fn close(&self, reason: CloseReason) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn_id = %self.inner.id, %reason, "transport connection closing");

        *self.inner.reason.lock() = Some(reason.clone());
        let _ = self.inner.cancel.send(true);

        let callback = self.inner.on_close.lock().clone();
        if let Some(callback) = callback {
            callback(self.inner.id, &reason);
        }
        let _ = self.inner.done.send(true);
    }

    /// Returns true once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves after [`close`](Self::close) has completed end-to-end.
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        if *rx.borrow_and_update() {
            return;
        }
        let _ = rx.changed().await;
    }
}

/// One open socket: pumps, buffer, lifecycle.
///
/// Created before the pumps run so the caller can register the connection in
/// the topology and wire handlers first, then started with
/// [`Connection::spawn`].
pub struct Connection {
    inner: Arc<TransportInner>,
    send_rx: mpsc::Receiver<Vec<u8>>,
    config: TransportConfig,
}

impl Connection {
    pub fn new(config: TransportConfig) -> Self {
        let (send_tx, send_rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let (cancel, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        let inner = Arc::new(TransportInner {
            id: Uuid::new_v4(),
            send_tx,
            cancel,
            done,
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
            on_message: Mutex::new(None),
            on_close: Mutex::new(None),
        });
        Self {
            inner,
            send_rx,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.inner.on_message.lock() = Some(handler);
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        *self.inner.on_close.lock() = Some(handler);
    }

    /// Starts the reader and writer pumps on `stream` and a supervisor that
    /// finalizes the close latch once both have returned. `permit` ties the
    /// connection into the server's shutdown wait.
    pub fn spawn<S>(self, stream: WebSocketStream<S>, permit: WaitPermit)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        let read_timeout = self.config.read_timeout;

        let reader = tokio::spawn(read_pump(source, self.inner.clone(), read_timeout));
        let writer = tokio::spawn(write_pump(sink, self.send_rx, self.inner.clone()));

        let inner = self.inner;
        tokio::spawn(async move {
            let _permit = permit;
            let _ = reader.await;
            let _ = writer.await;
            // Fallback for pump exits that did not go through close().
            TransportHandle { inner }.close(CloseReason::PeerClosed);
        });

        debug!("connection established");
    }
}

/// Pumps frames from the socket to the message handler.
///
/// Every read runs under the per-read deadline; non-text/non-binary frames
/// are skipped; any error terminates the loop through `close`.
async fn read_pump<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    inner: Arc<TransportInner>,
    read_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handle = TransportHandle {
        inner: inner.clone(),
    };
    let mut cancel = inner.cancel.subscribe();
    // close() may have run before the pumps started.
    if *cancel.borrow_and_update() {
        return;
    }

    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.changed() => return,
            frame = timeout(read_timeout, source.next()) => frame,
        };
        match frame {
            Err(_) => break CloseReason::ReadTimeout,
            Ok(None) => break CloseReason::PeerClosed,
            Ok(Some(Err(err))) => break CloseReason::Transport(err.to_string()),
            Ok(Some(Ok(message))) => {
                let data = match message {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => break CloseReason::PeerClosed,
                    // Ping/pong and raw frames are transport noise.
                    _ => continue,
                };
                let handler = inner.on_message.lock().clone();
                if let Some(handler) = handler {
                    handler(inner.id, data);
                }
            }
        }
    };
    handle.close(reason);
}

/// Pumps buffered messages to the socket until the queue closes or the
/// connection is cancelled; both paths emit a normal-closure frame.
async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
    inner: Arc<TransportInner>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handle = TransportHandle {
        inner: inner.clone(),
    };
    let mut cancel = inner.cancel.subscribe();
    if *cancel.borrow_and_update() {
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            queued = send_rx.recv() => match queued {
                Some(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        handle.close(CloseReason::Transport(err.to_string()));
                        return;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            }
        }
    }
}

/// Tracks outstanding connection tasks for graceful shutdown.
///
/// Each connection holds a [`WaitPermit`]; [`WaitGroup::wait`] resolves once
/// every permit has been dropped.
pub struct WaitGroup {
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
}

impl WaitGroup {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx }
    }

    pub fn permit(&self) -> WaitPermit {
        WaitPermit(self.tx.clone())
    }

    pub async fn wait(mut self) {
        drop(self.tx);
        let _ = self.rx.recv().await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// A live permit held by one connection task.
pub struct WaitPermit(#[allow(dead_code)] mpsc::Sender<()>);
