use async_trait::async_trait;
use futures_util::future::join_all;
use harmony_vts::connector::{Connector, EventHandler, MemoryPeer, MemoryTransport, ShutdownFn};
use harmony_vts::{Event, EventStatus, EventType, HarmonyError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    fn ids(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("lock handler records")
            .iter()
            .map(|e| e.event_id.clone())
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn handle_event(&self, event: &Event) -> harmony_vts::Result<()> {
        self.events
            .lock()
            .expect("lock handler records")
            .push(event.clone());
        Ok(())
    }
}

fn counting_shutdown() -> (ShutdownFn, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&count);
    (
        Arc::new(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        }),
        count,
    )
}

async fn started() -> (Connector, MemoryPeer, Arc<AtomicUsize>) {
    let (transport, peer) = MemoryTransport::pair();
    let (shutdown, fired) = counting_shutdown();
    let connector = Connector::new("user", Arc::new(transport), shutdown);
    connector.start().await.expect("start connector");
    (connector, peer, fired)
}

fn event(id: &str) -> Event {
    Event::new(id, EventType::AiStatus, EventStatus::Done, serde_json::json!({}))
}

async fn settle<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn sends_are_written_in_submission_order() {
    let (connector, mut peer, _) = started().await;

    let sends = (0..5).map(|i| connector.send_event(event(&format!("e{i}"))));
    let results = join_all(sends).await;
    assert!(results.iter().all(Result::is_ok));

    let mut written = Vec::new();
    while let Some(frame) = peer.try_next_outbound() {
        written.push(Event::from_wire(&frame).expect("valid frame").event_id);
    }
    assert_eq!(written, vec!["e0", "e1", "e2", "e3", "e4"]);

    connector.stop();
    connector.join().await;
    assert!(peer.is_closed());
}

#[tokio::test]
async fn send_completions_resolve_in_submission_order() {
    let (transport, mut peer) = MemoryTransport::pair();
    let (shutdown, _) = counting_shutdown();
    let connector = Connector::new("user", Arc::new(transport), shutdown);
    let completed = Arc::new(Mutex::new(Vec::new()));

    // Queue every send before the writer runs so they all race to resolve.
    let mut tasks = Vec::new();
    for i in 0..20 {
        let connector = connector.clone();
        let completed = Arc::clone(&completed);
        tasks.push(tokio::spawn(async move {
            connector
                .send_event(event(&format!("e{i}")))
                .await
                .expect("send resolves");
            completed.lock().expect("lock completions").push(i);
        }));
        tokio::task::yield_now().await;
    }

    connector.start().await.expect("start connector");
    for task in join_all(tasks).await {
        task.expect("send task");
    }

    let expected: Vec<i32> = (0..20).collect();
    assert_eq!(*completed.lock().expect("lock completions"), expected);
    let mut written = Vec::new();
    while let Some(frame) = peer.try_next_outbound() {
        written.push(Event::from_wire(&frame).expect("valid frame").event_id);
    }
    let expected_ids: Vec<String> = (0..20).map(|i| format!("e{i}")).collect();
    assert_eq!(written, expected_ids);

    connector.stop();
    connector.join().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_stopping_the_bus() {
    let (connector, peer, fired) = started().await;
    let handler = Arc::new(RecordingHandler::default());
    connector.register_handler(handler.clone());

    peer.push("{ not json");
    peer.push("");
    peer.push(event("good").to_wire().expect("encode"));

    assert!(settle(|| handler.ids() == vec!["good"]).await);
    assert!(connector.is_active());
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    connector.stop();
    connector.join().await;
}

#[tokio::test]
async fn read_failure_fires_shutdown_exactly_once() {
    let (connector, peer, fired) = started().await;

    peer.push_read_error("connection reset");
    peer.push_read_error("connection reset again");
    assert!(settle(|| fired.load(Ordering::SeqCst) > 0).await);
    assert!(!connector.is_active());

    connector.stop();
    connector.join().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn write_failure_rejects_the_send_and_escalates() {
    let (connector, peer, fired) = started().await;
    peer.fail_writes(true);

    let result = connector.send_event(event("lost")).await;
    assert!(matches!(result, Err(HarmonyError::Delivery(_))));
    assert!(settle(|| fired.load(Ordering::SeqCst) == 1).await);

    connector.stop();
    connector.join().await;
    assert!(matches!(
        connector.send_event(event("late")).await,
        Err(HarmonyError::Channel(_))
    ));
}

#[tokio::test]
async fn user_stop_never_fires_shutdown() {
    let (connector, _peer, fired) = started().await;
    let handler = Arc::new(RecordingHandler::default());
    connector.register_handler(handler);

    connector.stop();
    connector.stop();
    connector.join().await;

    assert_eq!(connector.handler_count(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
