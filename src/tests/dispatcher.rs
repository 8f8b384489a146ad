use super::{fast_config, memory_dispatcher, wait_for};
use crate::dispatcher::{ControlOutcome, DispatcherState, LiveCacheDispatcher, StreamStatus};
use crate::error::SourceError;
use crate::source::{MemoryBus, MessageSource, Polled};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_latest_for_known_and_unknown_device() {
    let bus = MemoryBus::new();
    let dispatcher = memory_dispatcher(&bus);
    assert_eq!(assert_ok!(dispatcher.start().await), ControlOutcome::Started);

    let payload = json!({"device_name": "pump-1", "temp": 72.5});
    bus.publish_json("sensor_data", &payload);
    wait_for("pump-1 to be cached", || dispatcher.get_latest_for("pump-1").is_some()).await;

    assert_eq!(dispatcher.get_latest_for("pump-1"), Some(payload.clone()));
    assert_eq!(dispatcher.get_latest_for("pump-2"), None);

    let all = dispatcher.get_latest_for_all();
    assert_eq!(all.len(), 1);
    assert_eq!(all["pump-1"], payload);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_double_start_keeps_one_worker_and_one_source() {
    let bus = MemoryBus::new();
    let created = Arc::new(AtomicUsize::new(0));
    let factory = {
        let bus = bus.clone();
        let created = Arc::clone(&created);
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            Ok::<_, SourceError>(Box::new(bus.source()) as Box<dyn MessageSource>)
        }
    };
    let dispatcher = LiveCacheDispatcher::new(factory, fast_config());

    assert_eq!(dispatcher.start().await.unwrap(), ControlOutcome::Started);
    assert_eq!(dispatcher.start().await.unwrap(), ControlOutcome::AlreadyRunning);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscriber_count(), 1);
    assert_eq!(dispatcher.state(), DispatcherState::Running);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_releases_source() {
    let bus = MemoryBus::new();
    let dispatcher = memory_dispatcher(&bus);
    dispatcher.start().await.unwrap();

    assert_eq!(dispatcher.stop().await, ControlOutcome::Stopped);
    assert_eq!(bus.subscriber_count(), 0);
    assert_eq!(dispatcher.stop().await, ControlOutcome::AlreadyStopped);
    assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    assert_eq!(dispatcher.status(), StreamStatus::Stopped);
}

#[tokio::test]
async fn test_controls_without_a_stream() {
    let dispatcher = memory_dispatcher(&MemoryBus::new());
    assert_eq!(dispatcher.pause(), ControlOutcome::NoStreamToPause);
    assert_eq!(dispatcher.resume(), ControlOutcome::NoStreamToResume);
    assert_eq!(dispatcher.stop().await, ControlOutcome::AlreadyStopped);
}

#[tokio::test]
async fn test_pause_and_resume_only_from_the_matching_state() {
    let dispatcher = memory_dispatcher(&MemoryBus::new());
    dispatcher.start().await.unwrap();

    assert_eq!(dispatcher.resume(), ControlOutcome::NoStreamToResume);
    assert_eq!(dispatcher.state(), DispatcherState::Running);

    assert_eq!(dispatcher.pause(), ControlOutcome::Paused);
    assert_eq!(dispatcher.pause(), ControlOutcome::NoStreamToPause);
    assert_eq!(dispatcher.state(), DispatcherState::Paused);

    assert_eq!(dispatcher.resume(), ControlOutcome::Resumed);
    assert_eq!(dispatcher.resume(), ControlOutcome::NoStreamToResume);
    assert_eq!(dispatcher.state(), DispatcherState::Running);

    dispatcher.stop().await;
}

/// Blocks its thread inside every poll, like a client stuck in a native call.
struct StallingSource {
    polling: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageSource for StallingSource {
    async fn subscribe(&mut self, _topics: &[String]) -> Result<(), SourceError> {
        Ok(())
    }

    async fn poll(&mut self, _timeout: Duration) -> Result<Polled, SourceError> {
        self.polling.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        Ok(Polled::Empty)
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_closes_source_of_an_overrunning_worker() {
    let polling = Arc::new(AtomicBool::new(false));
    let closes = Arc::new(AtomicUsize::new(0));
    let factory = {
        let polling = Arc::clone(&polling);
        let closes = Arc::clone(&closes);
        move || {
            Ok::<_, SourceError>(Box::new(StallingSource {
                polling: Arc::clone(&polling),
                closes: Arc::clone(&closes),
            }) as Box<dyn MessageSource>)
        }
    };
    let config = crate::dispatcher::DispatcherConfig {
        stop_grace: Duration::from_millis(200),
        ..fast_config()
    };
    let dispatcher = LiveCacheDispatcher::new(factory, config);

    dispatcher.start().await.unwrap();
    wait_for("worker to enter poll", || polling.load(Ordering::SeqCst)).await;

    assert_eq!(dispatcher.stop().await, ControlOutcome::Stopped);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.state(), DispatcherState::Stopped);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let bus = MemoryBus::new();
    let dispatcher = memory_dispatcher(&bus);
    dispatcher.start().await.unwrap();
    dispatcher.stop().await;

    assert_eq!(dispatcher.start().await.unwrap(), ControlOutcome::Started);
    assert_eq!(bus.subscriber_count(), 1);
    bus.publish_json("ml_result", &json!({"device_name": "press-4", "score": 0.9}));
    wait_for("press-4 to be cached", || dispatcher.get_latest_for("press-4").is_some()).await;
    dispatcher.stop().await;
}

#[tokio::test]
async fn test_pause_discards_and_resume_applies_only_new_messages() {
    let bus = MemoryBus::new();
    let dispatcher = memory_dispatcher(&bus);
    dispatcher.start().await.unwrap();

    bus.publish_json("sensor_data", &json!({"device_name": "pump-1", "seq": 1}));
    wait_for("first message", || dispatcher.stats().applied == 1).await;

    assert_eq!(dispatcher.pause(), ControlOutcome::Paused);
    assert_eq!(dispatcher.state(), DispatcherState::Paused);
    for seq in 2..=4 {
        bus.publish_json("sensor_data", &json!({"device_name": "pump-1", "seq": seq}));
    }
    wait_for("paused messages to be drained", || dispatcher.stats().received == 4).await;
    assert_eq!(dispatcher.get_latest_for("pump-1"), Some(json!({"device_name": "pump-1", "seq": 1})));
    assert_eq!(dispatcher.stats().discarded_while_paused, 3);

    assert_eq!(dispatcher.resume(), ControlOutcome::Resumed);
    bus.publish_json("sensor_data", &json!({"device_name": "pump-1", "seq": 5}));
    wait_for("message after resume", || dispatcher.stats().applied == 2).await;

    assert_eq!(dispatcher.get_latest_for("pump-1"), Some(json!({"device_name": "pump-1", "seq": 5})));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(dispatcher.stats().applied, 2);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_undecodable_and_anonymous_messages_are_skipped() {
    let bus = MemoryBus::new();
    let dispatcher = memory_dispatcher(&bus);
    dispatcher.start().await.unwrap();

    bus.publish("sensor_data", "{not json");
    bus.publish_json("sensor_data", &json!({"temp": 70}));
    bus.end_of_partition("sensor_data");
    bus.publish_json("sensor_data", &json!({"device_name": "pump-3", "temp": 71}));

    wait_for("pump-3 to be cached", || dispatcher.get_latest_for("pump-3").is_some()).await;
    let stats = dispatcher.stats();
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.skipped_unidentified, 1);
    assert_eq!(stats.applied, 1);
    assert_eq!(dispatcher.status(), StreamStatus::Running);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_broker_error_faults_worker_but_keeps_state() {
    let bus = MemoryBus::new();
    let dispatcher = memory_dispatcher(&bus);
    dispatcher.start().await.unwrap();

    bus.fail("broker transport failure");
    wait_for("worker to fault", || matches!(dispatcher.status(), StreamStatus::Faulted { .. })).await;

    assert_eq!(
        dispatcher.status(),
        StreamStatus::Faulted {
            reason: "broker error: broker transport failure".to_string()
        }
    );
    assert_eq!(dispatcher.state(), DispatcherState::Running);
    assert_eq!(dispatcher.start().await.unwrap(), ControlOutcome::AlreadyRunning);

    assert_eq!(dispatcher.stop().await, ControlOutcome::Stopped);
    assert_eq!(dispatcher.status(), StreamStatus::Stopped);
    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test]
async fn test_start_failure_leaves_dispatcher_stopped() {
    let factory = || Err::<Box<dyn MessageSource>, _>(SourceError::Broker("no brokers resolved".into()));
    let dispatcher = LiveCacheDispatcher::new(factory, fast_config());

    assert_err!(dispatcher.start().await);
    assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    assert_eq!(dispatcher.stop().await, ControlOutcome::AlreadyStopped);
}

#[tokio::test]
async fn test_live_stream_delivers_each_update_to_every_follower() {
    let bus = MemoryBus::new();
    let dispatcher = memory_dispatcher(&bus);
    dispatcher.start().await.unwrap();

    let mut first = dispatcher.live_stream_for("pump-1", Duration::from_millis(10));
    let mut second = dispatcher.live_stream_for("pump-1", Duration::ZERO);

    let payload = json!({"device_name": "pump-1", "temp": 72.5});
    bus.publish_json("sensor_data", &payload);

    let limit = Duration::from_secs(2);
    assert_eq!(tokio::time::timeout(limit, first.next()).await.unwrap(), Some(payload.clone()));
    assert_eq!(tokio::time::timeout(limit, second.next()).await.unwrap(), Some(payload));

    // nothing new, so nothing within a few ticks
    assert!(tokio::time::timeout(Duration::from_millis(60), first.next()).await.is_err());

    drop(second);
    assert_eq!(dispatcher.state(), DispatcherState::Running);

    dispatcher.stop().await;
    assert_eq!(tokio::time::timeout(limit, first.next()).await.unwrap(), None);
}

#[tokio::test]
async fn test_new_follower_starts_with_the_cached_record() {
    let bus = MemoryBus::new();
    let dispatcher = memory_dispatcher(&bus);
    dispatcher.start().await.unwrap();

    let payload = json!({"device_name": "pump-1", "temp": 70.0});
    bus.publish_json("sensor_data", &payload);
    wait_for("pump-1 to be cached", || dispatcher.get_latest_for("pump-1").is_some()).await;

    let mut late = dispatcher.live_stream_for("pump-1", Duration::from_millis(10));
    let limit = Duration::from_secs(2);
    assert_eq!(tokio::time::timeout(limit, late.next()).await.unwrap(), Some(payload));
    assert!(tokio::time::timeout(Duration::from_millis(60), late.next()).await.is_err());

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_live_stream_coalesces_between_ticks() {
    let bus = MemoryBus::new();
    let dispatcher = memory_dispatcher(&bus);
    dispatcher.start().await.unwrap();

    let mut follower = dispatcher.live_stream_for("pump-1", Duration::from_millis(200));
    for seq in 1..=3 {
        bus.publish_json("sensor_data", &json!({"device_name": "pump-1", "seq": seq}));
    }
    wait_for("all updates applied", || dispatcher.stats().applied == 3).await;

    let next = tokio::time::timeout(Duration::from_secs(2), follower.next()).await.unwrap();
    assert_eq!(next, Some(json!({"device_name": "pump-1", "seq": 3})));

    dispatcher.stop().await;
}
