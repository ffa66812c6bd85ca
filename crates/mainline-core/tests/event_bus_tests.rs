use mainline_core::bus::EventBus;
use mainline_core::types::{PipelineEvent, PipelineEventType};
use serde_json::json;

fn event(event_type: PipelineEventType, request_id: &str, n: u64) -> PipelineEvent {
    PipelineEvent::new(event_type, request_id, json!({"n": n}))
}

// ── JSONL round-trip ─────────────────────────────────────────────────────

#[tokio::test]
async fn published_events_read_back_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(dir.path());

    for n in 0..5 {
        bus.publish(event(PipelineEventType::PipelineStarted, "r1", n)).await;
    }

    let events = bus.events_for("r1").await.expect("events_for");
    assert_eq!(events.len(), 5);
    for (n, e) in events.iter().enumerate() {
        assert_eq!(e.data["n"], n as u64);
        assert_eq!(e.request_id, "r1");
    }
}

#[tokio::test]
async fn request_ids_are_isolated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(dir.path());

    bus.publish(event(PipelineEventType::PipelineStarted, "r1", 1)).await;
    bus.publish(event(PipelineEventType::PipelineStarted, "r2", 2)).await;

    assert_eq!(bus.events_for("r1").await.expect("r1").len(), 1);
    assert_eq!(bus.events_for("r2").await.expect("r2").len(), 1);
    assert!(bus.events_for("r3").await.expect("r3").is_empty());
}

// ── Persistence precedes dispatch ────────────────────────────────────────

#[tokio::test]
async fn subscriber_never_sees_an_unpersisted_event() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(dir.path());
    let mut sub = bus.subscribe();

    bus.publish(event(PipelineEventType::PipelineAccepted, "r1", 7)).await;

    let received = sub.rx.recv().await.expect("delivered");
    // At the moment of delivery the event is already on disk.
    let persisted = bus.events_for("r1").await.expect("events_for");
    assert!(persisted
        .iter()
        .any(|e| e.data == received.data && e.event_type == received.event_type));
}

// ── Subscription semantics ───────────────────────────────────────────────

#[tokio::test]
async fn type_filter_delivers_only_matching_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(dir.path());
    let mut sub = bus.subscribe_types(&[PipelineEventType::PipelineCompleted]);

    bus.publish(event(PipelineEventType::PipelineStarted, "r1", 1)).await;
    bus.publish(event(PipelineEventType::PipelineCompleted, "r1", 2)).await;

    let delivered = sub.rx.recv().await.expect("delivered");
    assert_eq!(delivered.event_type, PipelineEventType::PipelineCompleted);
    assert!(sub.rx.try_recv().is_err(), "no further deliveries expected");
}

#[tokio::test]
async fn unsubscribe_detaches_the_subscriber() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(dir.path());
    let mut sub = bus.subscribe();

    bus.unsubscribe(sub.id);
    bus.publish(event(PipelineEventType::PipelineStarted, "r1", 1)).await;

    assert!(sub.rx.recv().await.is_none(), "channel must be closed");
}

#[tokio::test]
async fn subscribers_receive_in_registration_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(dir.path());
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();

    bus.publish(event(PipelineEventType::PipelineStarted, "r1", 1)).await;

    // Both receive; a dropped receiver does not block the other.
    assert!(first.rx.recv().await.is_some());
    assert!(second.rx.recv().await.is_some());
}

#[tokio::test]
async fn slow_subscriber_does_not_stall_publish() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(dir.path());
    // Never drained: events pile up in its own queue.
    let _stuck = bus.subscribe();
    let mut live = bus.subscribe();

    for n in 0..100 {
        bus.publish(event(PipelineEventType::PipelineStarted, "r1", n)).await;
    }
    let mut seen = 0;
    while live.rx.try_recv().is_ok() {
        seen += 1;
    }
    assert_eq!(seen, 100);
}

// ── Corrupt log lines ────────────────────────────────────────────────────

#[tokio::test]
async fn corrupt_lines_are_skipped_on_read_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(dir.path());

    bus.publish(event(PipelineEventType::PipelineStarted, "r1", 1)).await;

    // Inject a corrupt line between two valid events.
    let log_path = dir.path().join("r1.jsonl");
    let mut contents = std::fs::read_to_string(&log_path).expect("read log");
    contents.push_str("{not json at all\n");
    std::fs::write(&log_path, contents).expect("write log");

    bus.publish(event(PipelineEventType::PipelineCompleted, "r1", 2)).await;

    let events = bus.events_for("r1").await.expect("events_for");
    assert_eq!(events.len(), 2, "one good event before, one after");
    assert_eq!(events[0].data["n"], 1);
    assert_eq!(events[1].data["n"], 2);
}

#[tokio::test]
async fn hostile_request_ids_stay_inside_the_events_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = EventBus::new(dir.path().join("events"));

    bus.publish(event(PipelineEventType::PipelineStarted, "../../escape", 1)).await;

    assert!(!dir.path().join("escape.jsonl").exists());
    let events = bus.events_for("../../escape").await.expect("events_for");
    assert_eq!(events.len(), 1);
}
