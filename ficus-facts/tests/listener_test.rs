use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mockall::mock;

use ficus_facts::testing::{registry_with, CountingDriver};
use ficus_facts::{
    BackoffConfig, ChangeEvent, ChangeListener, ChannelTransport, DatasourceConfig,
    DatasourceKind, EventTransport, FactError, FactResult, ListenerConfig, ListenerState,
    ListenerStats,
};

mock! {
    pub Transport {}

    #[async_trait]
    impl EventTransport for Transport {
        async fn connect(&mut self, topic: &str) -> FactResult<()>;
        async fn poll(&mut self, timeout: Duration) -> FactResult<Option<Bytes>>;
        async fn disconnect(&mut self);
    }
}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_config() -> ListenerConfig {
    ListenerConfig::new()
        .topic("ficus.test.datasource.changed")
        .poll_timeout(Duration::from_millis(10))
        .event_budget(Duration::from_millis(500))
        .backoff(
            BackoffConfig::new()
                .initial(Duration::from_millis(5))
                .max(Duration::from_millis(20))
                .jitter(0.0),
        )
}

fn kafka(code: &str, version: u64) -> DatasourceConfig {
    DatasourceConfig::new(code, DatasourceKind::Kafka, "broker:9092").with_version(version)
}

async fn settle<F>(listener: &ChangeListener, done: F) -> ListenerStats
where
    F: Fn(&ListenerStats) -> bool,
{
    for _ in 0..300 {
        let stats = listener.stats();
        if done(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    listener.stats()
}

#[tokio::test]
async fn test_replayed_stream_converges() {
    init();
    let driver = Arc::new(CountingDriver::new(DatasourceKind::Kafka));
    let registry = registry_with(vec![driver.clone()], Duration::ZERO);
    let (transport, publisher) = ChannelTransport::channel();
    let listener = ChangeListener::new(registry.clone(), transport, fast_config()).unwrap();
    listener.start().unwrap();

    let events = vec![
        ChangeEvent::add(kafka("orders", 1)),
        ChangeEvent::update(kafka("orders", 3)),
        ChangeEvent::update(kafka("orders", 2)),
        ChangeEvent::add(kafka("payments", 1)),
        ChangeEvent::update(kafka("orders", 3)),
        ChangeEvent::delete(kafka("payments", 1)),
        ChangeEvent::add(kafka("payments", 1)),
    ];
    for event in &events {
        publisher.publish(event).unwrap();
    }

    let total = events.len() as u64;
    let stats = settle(&listener, |stats| stats.processed + stats.stale == total).await;
    assert_eq!(stats.processed, 4);
    assert_eq!(stats.stale, 3);

    assert_eq!(registry.version_of("orders"), Some(3));
    assert!(!registry.contains("payments"));
    assert_eq!(registry.codes(), vec!["orders".to_string()]);

    listener.stop(Duration::from_secs(1)).await;
    assert_eq!(listener.state(), ListenerState::Stopped);
}

#[tokio::test]
async fn test_untyped_event_uses_default_kind() {
    init();
    let driver = Arc::new(CountingDriver::new(DatasourceKind::Kafka));
    let registry = registry_with(vec![driver.clone()], Duration::ZERO);
    let (transport, publisher) = ChannelTransport::channel();
    let listener = ChangeListener::new(registry.clone(), transport, fast_config()).unwrap();
    listener.start().unwrap();

    let payload = br#"{
        "action": "ADD",
        "datasource": {"code": "clicks", "connection": "broker:9092", "version": 1}
    }"#;
    publisher.publish_raw(&payload[..]).unwrap();
    settle(&listener, |stats| stats.processed == 1).await;

    let handle = registry.get("clicks").await.unwrap();
    assert_eq!(handle.kind(), DatasourceKind::Kafka);
    assert_eq!(driver.connects(), 1);

    listener.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unreachable_broker_is_retried_until_stopped() {
    init();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let mut transport = MockTransport::new();
    transport.expect_connect().returning(move |topic| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(FactError::Transport(format!("{} unreachable", topic)))
    });
    transport.expect_poll().never();
    transport.expect_disconnect().returning(|| ());

    let driver = Arc::new(CountingDriver::new(DatasourceKind::Kafka));
    let registry = registry_with(vec![driver], Duration::ZERO);
    let listener = ChangeListener::new(registry, transport, fast_config()).unwrap();
    listener.start().unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(listener.state(), ListenerState::Connecting);
    assert!(attempts.load(Ordering::SeqCst) >= 3);

    listener.stop(Duration::from_secs(1)).await;
    assert_eq!(listener.state(), ListenerState::Stopped);
    assert!(!listener.is_running());
}

#[tokio::test]
async fn test_stop_without_start_is_a_no_op() {
    init();
    let driver = Arc::new(CountingDriver::new(DatasourceKind::Kafka));
    let registry = registry_with(vec![driver], Duration::ZERO);
    let (transport, _publisher) = ChannelTransport::channel();
    let listener = ChangeListener::new(registry, transport, fast_config()).unwrap();

    listener.stop(Duration::from_millis(10)).await;
    assert_eq!(listener.state(), ListenerState::Stopped);
    assert_eq!(listener.stats(), ListenerStats::default());
}

#[tokio::test]
async fn test_stop_finishes_in_flight_event() {
    init();
    let driver =
        Arc::new(CountingDriver::new(DatasourceKind::Kafka).with_delay(Duration::from_millis(100)));
    let registry = registry_with(vec![driver.clone()], Duration::ZERO);
    let (transport, publisher) = ChannelTransport::channel();
    let listener = ChangeListener::new(registry.clone(), transport, fast_config()).unwrap();

    let mut states = listener.subscribe_state();
    listener.start().unwrap();
    publisher.publish(&ChangeEvent::add(kafka("orders", 1))).unwrap();

    while *states.borrow() != ListenerState::Processing {
        states.changed().await.unwrap();
    }
    listener.stop(Duration::from_secs(2)).await;

    assert_eq!(listener.stats().processed, 1);
    assert_eq!(registry.version_of("orders"), Some(1));
    assert_eq!(listener.state(), ListenerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_timeout_disconnects_and_allows_restart() {
    init();
    let payload = Bytes::from(ChangeEvent::add(kafka("orders", 1)).encode().unwrap());
    let served = AtomicBool::new(false);
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);

    let mut transport = MockTransport::new();
    transport.expect_connect().times(2).returning(|_| Ok(()));
    transport.expect_poll().returning(move |timeout| {
        if served.swap(true, Ordering::SeqCst) {
            std::thread::sleep(timeout);
            Ok(None)
        } else {
            Ok(Some(payload.clone()))
        }
    });
    transport.expect_disconnect().returning(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let driver =
        Arc::new(CountingDriver::new(DatasourceKind::Kafka).with_delay(Duration::from_millis(400)));
    let registry = registry_with(vec![driver.clone()], Duration::ZERO);
    let listener = ChangeListener::new(registry.clone(), transport, fast_config()).unwrap();

    let mut states = listener.subscribe_state();
    listener.start().unwrap();
    while *states.borrow() != ListenerState::Processing {
        states.changed().await.unwrap();
    }

    listener.stop(Duration::from_millis(20)).await;
    assert_eq!(listener.state(), ListenerState::Stopped);
    assert!(!listener.is_running());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(registry.version_of("orders"), None);
    assert_eq!(listener.stats().processed, 0);

    listener.start().unwrap();
    while *states.borrow() != ListenerState::Subscribed {
        states.changed().await.unwrap();
    }
    listener.stop(Duration::from_secs(1)).await;
    assert_eq!(listener.state(), ListenerState::Stopped);
    assert_eq!(disconnects.load(Ordering::SeqCst), 2);
}
