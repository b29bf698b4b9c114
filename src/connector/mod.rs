//! Event bus for one entity's connection to the Harmony Link backend.
//!
//! A [`Connector`] owns one connection and runs two tasks on it:
//!
//! - the **receiver loop** reads one frame at a time, parses it into an
//!   [`Event`] and hands it to every registered [`EventHandler`] in
//!   registration order;
//! - the **sender loop** drains a FIFO of pending sends and writes each to
//!   the connection, resolving the caller's completion handle afterwards.
//!
//! Transport failures are fatal for the bus: the owner-supplied shutdown
//! callback fires exactly once and both loops stop. Malformed inbound
//! messages are logged and dropped.

pub mod transport;

pub use transport::{
    FrameSink, FrameSource, MemoryPeer, MemoryTransport, Transport, WebSocketTransport,
};

use crate::error::{HarmonyError, Result};
use crate::event::Event;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback invoked once when the bus fails fatally.
pub type ShutdownFn = Arc<dyn Fn() + Send + Sync>;

/// Receives every event that arrives on a connector.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle one inbound event. Errors are logged by the connector and
    /// never stop the receiver loop.
    async fn handle_event(&self, event: &Event) -> Result<()>;

    /// Release resources; called once when the owning connector stops.
    fn deactivate(&self) {}
}

/// Anything that can put an event on the wire.
#[async_trait]
pub trait EventSender: Send + Sync {
    /// Queue `event` and wait until it has been written.
    async fn send_event(&self, event: Event) -> Result<()>;
}

struct PendingSend {
    event: Event,
    done: oneshot::Sender<Result<()>>,
}

/// Event bus for one entity. Clones share the same connection.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    entity_id: String,
    transport: Arc<dyn Transport>,
    send_tx: mpsc::UnboundedSender<PendingSend>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingSend>>>,
    queued: AtomicUsize,
    warn_depth: AtomicUsize,
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
    shutdown: ShutdownFn,
    shutdown_fired: AtomicBool,
    started: AtomicBool,
    active: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Connector {
    /// Create an idle connector. Nothing touches the network until
    /// [`start`](Self::start).
    pub fn new(
        entity_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        shutdown: ShutdownFn,
    ) -> Self {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                entity_id: entity_id.into(),
                transport,
                send_tx,
                send_rx: Mutex::new(Some(send_rx)),
                queued: AtomicUsize::new(0),
                warn_depth: AtomicUsize::new(256),
                handlers: Mutex::new(Vec::new()),
                shutdown,
                shutdown_fired: AtomicBool::new(false),
                started: AtomicBool::new(false),
                active: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Log a warning whenever the send queue grows by another `depth` events.
    pub fn set_queue_warn_depth(&self, depth: usize) {
        self.inner.warn_depth.store(depth.max(1), Ordering::Relaxed);
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.inner.entity_id
    }

    /// True between a successful `start` and `stop` (or a fatal failure).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Number of currently registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        lock(&self.inner.handlers).len()
    }

    /// Connect and spawn both loops on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Transport`] if the connection cannot be
    /// opened; the shutdown callback has fired by then.
    pub async fn start(&self) -> Result<()> {
        self.start_on(&tokio::runtime::Handle::current()).await
    }

    /// Connect and spawn both loops on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Transport`] if the connection cannot be
    /// opened, or [`HarmonyError::Channel`] if the connector was already
    /// started or stopped.
    pub async fn start_on(&self, runtime: &tokio::runtime::Handle) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(HarmonyError::Channel("connector already stopped".into()));
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(HarmonyError::Channel("connector already started".into()));
        }
        let Some(send_rx) = lock(&inner.send_rx).take() else {
            return Err(HarmonyError::Channel("send queue already consumed".into()));
        };

        let connected = tokio::select! {
            () = inner.cancel.cancelled() => {
                Err(HarmonyError::Channel("connector stopped while connecting".into()))
            }
            result = inner.transport.connect() => result,
        };
        let (sink, source) = match connected {
            Ok(halves) => halves,
            Err(e) => {
                error!(entity = %inner.entity_id, "failed to connect: {e}");
                inner.escalate();
                return Err(e);
            }
        };

        inner.active.store(true, Ordering::SeqCst);
        info!(entity = %inner.entity_id, "connector started");

        let receiver = runtime.spawn(receiver_loop(Arc::clone(inner), source));
        let sender = runtime.spawn(sender_loop(Arc::clone(inner), sink, send_rx));
        lock(&inner.tasks).extend([receiver, sender]);
        Ok(())
    }

    /// Add a handler. Registering the same handler twice is a no-op.
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = lock(&self.inner.handlers);
        if !handlers.iter().any(|h| same_handler(h, &handler)) {
            debug!(entity = %self.inner.entity_id, handler = handler.name(), "handler registered");
            handlers.push(handler);
        }
    }

    /// Remove a handler. Removing an unknown handler is a no-op.
    pub fn unregister_handler(&self, handler: &Arc<dyn EventHandler>) {
        lock(&self.inner.handlers).retain(|h| !same_handler(h, handler));
    }

    /// Queue `event` and wait for the sender loop to write it.
    ///
    /// Events queued before `start` are written once connected.
    ///
    /// # Errors
    ///
    /// Returns [`HarmonyError::Delivery`] if the write failed, or
    /// [`HarmonyError::Channel`] if the connector stopped first.
    pub async fn send_event(&self, event: Event) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(HarmonyError::Channel(format!(
                "connector for {} is stopped",
                inner.entity_id
            )));
        }

        // Count before the event becomes visible to the sender loop, which
        // decrements as soon as it dequeues.
        let depth = inner.queued.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let (done, rx) = oneshot::channel();
        if inner.send_tx.send(PendingSend { event, done }).is_err() {
            inner.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(HarmonyError::Channel("connector send queue closed".into()));
        }

        let warn_depth = inner.warn_depth.load(Ordering::Relaxed);
        if depth % warn_depth == 0 {
            warn!(entity = %inner.entity_id, depth, "send queue is backing up");
        }

        rx.await.map_err(|_| {
            HarmonyError::Channel("connector stopped before the event was sent".into())
        })?
    }

    /// Stop the bus: mark it inactive, close the connection, deactivate
    /// every handler and end both loops. Safe to call more than once and
    /// from any thread.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(entity = %inner.entity_id, "stopping connector");
        inner.active.store(false, Ordering::SeqCst);
        inner.cancel.cancel();

        // Never started: drop the queue so pending senders see an error.
        drop(lock(&inner.send_rx).take());

        let handlers = std::mem::take(&mut *lock(&inner.handlers));
        for handler in handlers {
            debug!(entity = %inner.entity_id, handler = handler.name(), "deactivating handler");
            handler.deactivate();
        }
    }

    /// Wait for both loops to finish after `stop` or a fatal failure.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                error!(entity = %self.inner.entity_id, "connector task failed: {e}");
            }
        }
    }
}

#[async_trait]
impl EventSender for Connector {
    async fn send_event(&self, event: Event) -> Result<()> {
        Connector::send_event(self, event).await
    }
}

/// Sender that keeps every event instead of writing it anywhere.
///
/// Used in place of a live connector when a handler only needs somewhere to
/// put its outbound events.
#[derive(Debug, Clone, Default)]
pub struct RecordingSender {
    events: Arc<Mutex<Vec<Event>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingSender {
    /// Events sent so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    /// Sent events of one type, oldest first.
    #[must_use]
    pub fn events_of(&self, event_type: &crate::event::EventType) -> Vec<Event> {
        lock(&self.events)
            .iter()
            .filter(|e| &e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Make subsequent sends fail with a delivery error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSender for RecordingSender {
    async fn send_event(&self, event: Event) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HarmonyError::Delivery(format!(
                "send of {} rejected",
                event.event_id
            )));
        }
        lock(&self.events).push(event);
        Ok(())
    }
}

impl Inner {
    /// Fatal failure: end both loops and notify the owner once.
    fn escalate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if !self.shutdown_fired.swap(true, Ordering::SeqCst) {
            warn!(entity = %self.entity_id, "connector failed, requesting shutdown");
            (self.shutdown)();
        }
    }

    async fn dispatch(&self, text: &str) {
        if text.trim().is_empty() {
            warn!(entity = %self.entity_id, "empty message received");
            return;
        }
        let event = match Event::from_wire(text) {
            Ok(event) => event,
            Err(e) => {
                error!(entity = %self.entity_id, "dropping malformed message: {e}");
                return;
            }
        };
        debug!(
            entity = %self.entity_id,
            event_type = %event.event_type,
            event_id = %event.event_id,
            status = ?event.status,
            "event received"
        );

        let handlers = lock(&self.handlers).clone();
        for handler in handlers {
            if let Err(e) = handler.handle_event(&event).await {
                warn!(
                    entity = %self.entity_id,
                    handler = handler.name(),
                    event_type = %event.event_type,
                    "handler failed: {e}"
                );
            }
        }
    }
}

async fn receiver_loop(inner: Arc<Inner>, mut source: Box<dyn FrameSource>) {
    loop {
        let frame = tokio::select! {
            () = inner.cancel.cancelled() => break,
            frame = source.next_frame() => frame,
        };
        match frame {
            Some(Ok(text)) => inner.dispatch(&text).await,
            Some(Err(e)) => {
                error!(entity = %inner.entity_id, "receiver loop failed: {e}");
                inner.escalate();
                break;
            }
            None => {
                if !inner.cancel.is_cancelled() {
                    error!(entity = %inner.entity_id, "connection closed by backend");
                    inner.escalate();
                }
                break;
            }
        }
    }
    debug!(entity = %inner.entity_id, "receiver loop exited");
}

async fn sender_loop(
    inner: Arc<Inner>,
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::UnboundedReceiver<PendingSend>,
) {
    loop {
        let pending = tokio::select! {
            () = inner.cancel.cancelled() => break,
            pending = queue.recv() => match pending {
                Some(p) => p,
                None => break,
            },
        };
        inner.queued.fetch_sub(1, Ordering::SeqCst);

        let wire = match pending.event.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                warn!(
                    entity = %inner.entity_id,
                    "cannot encode event {}: {e}", pending.event.event_id
                );
                let _ = pending.done.send(Err(e));
                continue;
            }
        };

        match sink.send(wire).await {
            Ok(()) => {
                debug!(
                    entity = %inner.entity_id,
                    event_type = %pending.event.event_type,
                    event_id = %pending.event.event_id,
                    "event sent"
                );
                let _ = pending.done.send(Ok(()));
            }
            Err(e) => {
                error!(
                    entity = %inner.entity_id,
                    "failed to send event {}: {e}", pending.event.event_id
                );
                let _ = pending.done.send(Err(HarmonyError::Delivery(e.to_string())));
                inner.escalate();
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!(entity = %inner.entity_id, "close failed: {e}");
    }

    queue.close();
    while let Ok(pending) = queue.try_recv() {
        inner.queued.fetch_sub(1, Ordering::SeqCst);
        let _ = pending
            .done
            .send(Err(HarmonyError::Channel("connector stopped".into())));
    }
    debug!(entity = %inner.entity_id, "sender loop exited");
}
