use base64::Engine as _;
use harmony_vts::event::{FetchMicrophoneResult, UtterancePayload};
use harmony_vts::session::{HarmonySession, RunningSession};
use harmony_vts::test_utils::{FakeBackend, MemoryFactory, StaticInput, write_silent_wav};
use harmony_vts::{Event, EventStatus, EventType, HarmonyConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(3);

struct Scene {
    running: RunningSession,
    backends: HashMap<String, FakeBackend>,
    factory: Arc<MemoryFactory>,
    input: Arc<StaticInput>,
    cancel: CancellationToken,
}

async fn scene(listen_on_start: bool, prefill: usize) -> Scene {
    let mut config = HarmonyConfig::default();
    config.scene.character_entity_ids = vec!["alice".to_owned(), "bob".to_owned()];
    config.harmony.start_warmup_secs = 0;
    config.stt.listen_on_start = listen_on_start;

    let input = Arc::new(StaticInput::new(prefill));
    let (factory, backends) = MemoryFactory::new(
        &config.scene.entity_ids(),
        Some(EventStatus::Done),
        Arc::clone(&input),
    );
    let factory = Arc::new(factory);
    let cancel = CancellationToken::new();
    let running = HarmonySession::new(config, factory.clone())
        .start(&cancel)
        .await
        .expect("session starts")
        .expect("not cancelled");

    Scene {
        running,
        backends,
        factory,
        input,
        cancel,
    }
}

impl Scene {
    async fn finish(self) {
        self.cancel.cancel();
        self.running
            .supervise(self.cancel)
            .await
            .expect("clean shutdown");
    }
}

fn done(id: &str, event_type: EventType, payload: serde_json::Value) -> Event {
    Event::new(id, event_type, EventStatus::Done, payload)
}

#[tokio::test]
async fn user_utterance_reaches_every_character() {
    let scene = scene(false, 0).await;

    scene.backends["user"].push_event(&done(
        "stt-1",
        EventType::SttOutputText,
        serde_json::json!({ "content": "hello there", "confidence": 0.93 }),
    ));

    for character in ["alice", "bob"] {
        let forwarded = scene.backends[character]
            .wait_for(&EventType::UserUtterance, 1, WAIT)
            .await
            .expect("utterance forwarded");
        assert_eq!(
            forwarded[0].event_id,
            format!("actor_{character}_VAD_utterance_processed")
        );
        assert_eq!(forwarded[0].status, EventStatus::New);
        let payload: UtterancePayload = forwarded[0].payload_as().expect("utterance payload");
        assert_eq!(payload.content, "hello there");
        assert_eq!(payload.entity_id.as_deref(), Some("user"));
        assert_eq!(payload.extra["confidence"], serde_json::json!(0.93));
    }
    assert!(scene.backends["user"].received_of(&EventType::UserUtterance).is_empty());

    scene.finish().await;
}

#[tokio::test]
async fn empty_transcripts_are_not_relayed() {
    let scene = scene(false, 0).await;

    scene.backends["user"].push_event(&done(
        "stt-1",
        EventType::SttOutputText,
        serde_json::json!({ "content": "" }),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(scene.backends["alice"].received_of(&EventType::UserUtterance).is_empty());

    scene.finish().await;
}

#[tokio::test]
async fn characters_stay_quiet_while_the_user_speaks() {
    let scene = scene(false, 0).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let first = dir.path().join("first.wav");
    let second = dir.path().join("second.wav");
    write_silent_wav(&first, 160).expect("write wav");
    write_silent_wav(&second, 160).expect("write wav");
    let first = first.to_str().expect("utf-8 path").to_owned();
    let second = second.to_str().expect("utf-8 path").to_owned();

    scene.backends["user"].push_event(&done(
        "vad",
        EventType::SttSpeechStarted,
        serde_json::json!({}),
    ));
    let alice = scene.running.entity("alice").expect("alice");
    for _ in 0..400 {
        if alice.tts().is_suppressed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(alice.tts().is_suppressed());
    assert!(!scene.running.user().expect("user").tts().is_suppressed());

    scene.backends["alice"].push_event(&done(
        "speech-1",
        EventType::AiSpeech,
        serde_json::json!({ "audio_file": first }),
    ));
    let acks = scene.backends["alice"]
        .wait_for(&EventType::TtsPlaybackDone, 1, WAIT)
        .await
        .expect("suppressed speech acknowledged");
    assert_eq!(acks[0].payload, serde_json::json!(first));
    assert!(scene.factory.output().played().is_empty());

    scene.backends["user"].push_event(&done(
        "vad",
        EventType::SttSpeechStopped,
        serde_json::json!({}),
    ));
    for _ in 0..400 {
        if !alice.tts().is_suppressed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    scene.backends["alice"].push_event(&done(
        "speech-2",
        EventType::AiSpeech,
        serde_json::json!({ "audio_file": second }),
    ));
    let acks = scene.backends["alice"]
        .wait_for(&EventType::TtsPlaybackDone, 2, WAIT)
        .await
        .expect("played speech acknowledged");
    assert_eq!(acks[1].payload, serde_json::json!(second));
    assert_eq!(scene.factory.output().played(), vec![second]);

    let mouth = scene.factory.actuator("alice").expect("alice actuator");
    for _ in 0..400 {
        if mouth.last() == Some(0.0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(mouth.last(), Some(0.0));

    scene.finish().await;
}

#[tokio::test]
async fn backend_can_fetch_recorded_microphone_audio() {
    let scene = scene(true, 3200).await;
    assert_eq!(scene.input.starts(), 1);

    scene.backends["user"].push_event(&done(
        "fetch-1",
        EventType::SttFetchMicrophone,
        serde_json::json!({ "start_byte": 0, "bytes_count": 800 }),
    ));
    let results = scene.backends["user"]
        .wait_for(&EventType::SttFetchMicrophoneResult, 1, WAIT)
        .await
        .expect("fetch answered");
    assert_eq!(results[0].event_id, "fetch-1");

    let result: FetchMicrophoneResult = results[0].payload_as().expect("fetch payload");
    let audio = base64::engine::general_purpose::STANDARD
        .decode(result.audio_bytes)
        .expect("base64 audio");
    assert_eq!(audio.len(), 800);
    assert_eq!(result.sample_rate, 16_000);
    assert_eq!(result.channels, 1);
    assert_eq!(result.bit_depth, 16);

    let input = Arc::clone(&scene.input);
    scene.finish().await;
    assert_eq!(input.stops(), 1);
}
