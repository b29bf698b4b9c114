//! Text-frame transports underneath the connector.
//!
//! [`WebSocketTransport`] talks to a real Harmony Link backend.
//! [`MemoryTransport`] connects the connector to an in-process
//! [`MemoryPeer`], which tests use to play the backend's role.

use crate::error::{HarmonyError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Opens one connection and splits it into its two directions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next text frame, or `None` once the peer closed cleanly.
    async fn next_frame(&mut self) -> Option<Result<String>>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket connection to the Harmony Link event backend.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    endpoint: String,
}

impl WebSocketTransport {
    /// # Errors
    ///
    /// Returns [`HarmonyError::Config`] if the endpoint is not a ws/wss URL.
    pub fn new(endpoint: &str) -> Result<Self> {
        let url = url::Url::parse(endpoint)
            .map_err(|e| HarmonyError::Config(format!("invalid ws endpoint '{endpoint}': {e}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(HarmonyError::Config(format!(
                "ws endpoint must use ws:// or wss://, got '{endpoint}'"
            )));
        }
        Ok(Self {
            endpoint: endpoint.to_owned(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        use futures_util::StreamExt;

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| HarmonyError::Transport(format!("connect {}: {e}", self.endpoint)))?;
        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }
}

struct WsSink {
    write: futures_util::stream::SplitSink<WsStream, tokio_tungstenite::tungstenite::Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<()> {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;

        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| HarmonyError::Transport(format!("send error: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        use futures_util::SinkExt;

        self.write
            .close()
            .await
            .map_err(|e| HarmonyError::Transport(format!("close error: {e}")))
    }
}

struct WsSource {
    read: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message;

        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    return Some(Err(HarmonyError::Transport(format!("read error: {e}"))));
                }
                _ => {} // Ping/Pong frames handled by tungstenite.
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

type Inbound = Result<String>;

struct MemoryEnds {
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    outbound_tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct MemoryFlags {
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

/// Single-use in-process transport.
pub struct MemoryTransport {
    ends: Mutex<Option<MemoryEnds>>,
    connect_error: Option<String>,
    flags: Arc<MemoryFlags>,
}

/// The far end of a [`MemoryTransport`].
pub struct MemoryPeer {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    flags: Arc<MemoryFlags>,
}

impl MemoryTransport {
    /// Create a connected transport/peer pair.
    #[must_use]
    pub fn pair() -> (Self, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let flags = Arc::new(MemoryFlags::default());
        (
            Self {
                ends: Mutex::new(Some(MemoryEnds {
                    inbound_rx,
                    outbound_tx,
                })),
                connect_error: None,
                flags: Arc::clone(&flags),
            },
            MemoryPeer {
                inbound_tx,
                outbound_rx,
                flags,
            },
        )
    }

    /// A transport whose `connect` always fails.
    #[must_use]
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            ends: Mutex::new(None),
            connect_error: Some(reason.into()),
            flags: Arc::new(MemoryFlags::default()),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        if let Some(reason) = &self.connect_error {
            return Err(HarmonyError::Transport(reason.clone()));
        }
        let ends = match self.ends.lock() {
            Ok(mut e) => e.take(),
            Err(p) => p.into_inner().take(),
        }
        .ok_or_else(|| HarmonyError::Transport("memory transport already connected".into()))?;

        Ok((
            Box::new(MemorySink {
                tx: ends.outbound_tx,
                flags: Arc::clone(&self.flags),
            }),
            Box::new(MemorySource {
                rx: ends.inbound_rx,
            }),
        ))
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<String>,
    flags: Arc<MemoryFlags>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<()> {
        if self.flags.fail_writes.load(Ordering::SeqCst) {
            return Err(HarmonyError::Transport("write rejected by peer".into()));
        }
        self.tx
            .send(text)
            .map_err(|_| HarmonyError::Transport("peer dropped".into()))
    }

    async fn close(&mut self) -> Result<()> {
        self.flags.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

impl MemoryPeer {
    /// Deliver a text frame to the connector. Returns false once disconnected.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.inbound_tx.send(Ok(text.into())).is_ok()
    }

    /// Make the connector's next read fail with a transport error.
    pub fn push_read_error(&self, message: impl Into<String>) -> bool {
        self.inbound_tx
            .send(Err(HarmonyError::Transport(message.into())))
            .is_ok()
    }

    /// Reject every subsequent write from the connector.
    pub fn fail_writes(&self, fail: bool) {
        self.flags.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Next frame written by the connector.
    pub async fn next_outbound(&mut self) -> Option<String> {
        self.outbound_rx.recv().await
    }

    /// Frame already written by the connector, without waiting.
    pub fn try_next_outbound(&mut self) -> Option<String> {
        self.outbound_rx.try_recv().ok()
    }

    /// Whether the connector closed its side.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }
}
