use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_rust::outbox::DispatcherConfig;
use relay_rust::transport::amqp::MemoryAmqpBroker;
use relay_rust::transport::cloud::MemoryCloudBroker;
use relay_rust::transport::log::MemoryLogBroker;
use relay_rust::transport::{Backend, Connectors};
use relay_rust::{
    ActionError, DeadLetterStore, EventHeader, InMemoryStore, ListenerConfig, OutboxStore, Relay, RelayConfig,
    TransportConfig, UnitOfWork,
};

use crate::support::{commit_request, eventually, A, E};

async fn confirm(store: Arc<InMemoryStore>, id: &str) -> Result<(), ActionError> {
    let mut unit_of_work = UnitOfWork::new(store);
    let mut a: A = unit_of_work
        .load(id)
        .await?
        .ok_or_else(|| ActionError::NotFound(id.to_string()))?;
    unit_of_work.begin()?;
    a.confirm();
    unit_of_work.save(&mut a)?;
    unit_of_work.commit().await?;
    Ok(())
}

/// `A` raises `A-E`; the `service-X` listener fails twice and then
/// confirms `A`, all within a retry budget of two.
async fn aggregate_event_reaches_the_listener(backend: Backend, connectors: Connectors) {
    let store = Arc::new(InMemoryStore::new());
    let calls = Arc::new(AtomicU32::new(0));

    let action_store = Arc::clone(&store);
    let action_calls = Arc::clone(&calls);
    let action = move |event: E, _: EventHeader| {
        let store = Arc::clone(&action_store);
        let call = action_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if call < 2 {
                return Err(ActionError::Rejected(format!("attempt {} refused", call + 1)));
            }
            confirm(store, &event.id).await
        }
    };

    let mut transport = TransportConfig::new(backend).with_redelivery_delay(Duration::from_millis(10));
    transport.log.poll_interval_ms = 5;
    transport.cloud.receive_wait_ms = 20;
    let config = RelayConfig {
        transport,
        dispatcher: DispatcherConfig::default().with_poll_interval(Duration::from_millis(10)),
        listener: ListenerConfig::default().with_max_retries(2),
        ..RelayConfig::default()
    };
    let relay = Relay::builder(Arc::clone(&store))
        .with_config(config)
        .with_connectors(connectors)
        .listen::<E, _>("service-X", action)
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(relay.transport().backend(), backend);
    relay.start().await.unwrap();

    commit_request(&store, "a-1").await;

    let confirmed = eventually(Duration::from_secs(10), || {
        let store = Arc::clone(&store);
        async move {
            let loaded: Option<A> = UnitOfWork::new(store).load("a-1").await.unwrap();
            loaded.is_some_and(|a| a.confirmations == 1)
        }
    })
    .await;
    assert!(confirmed, "A was not confirmed on {backend}");
    assert!(
        eventually(Duration::from_secs(5), || {
            let store = Arc::clone(&store);
            async move { store.entries().await.unwrap().is_empty() }
        })
        .await
    );

    relay.shutdown().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(store.list().await.unwrap().is_empty());
    let stats = relay.registry().stats_for("A-E-v1", "service-X").unwrap();
    assert_eq!((stats.retried, stats.handled, stats.dead_lettered), (2, 1, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_in_process() {
    aggregate_event_reaches_the_listener(Backend::InProcess, Connectors::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_amqp() {
    let connectors = Connectors::new().with_amqp(Arc::new(MemoryAmqpBroker::new()));
    aggregate_event_reaches_the_listener(Backend::Amqp, connectors).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_log() {
    let connectors = Connectors::new().with_log(Arc::new(MemoryLogBroker::new()));
    aggregate_event_reaches_the_listener(Backend::Log, connectors).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_cloud() {
    let connectors = Connectors::new().with_cloud(Arc::new(MemoryCloudBroker::new()));
    aggregate_event_reaches_the_listener(Backend::Cloud, connectors).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_cannot_start_twice() {
    let store = Arc::new(InMemoryStore::new());
    let relay = Relay::builder(store)
        .listen::<E, _>("service-X", |_: E, _: EventHeader| async { Ok::<(), ActionError>(()) })
        .unwrap()
        .build()
        .unwrap();

    relay.start().await.unwrap();
    assert!(relay.is_running());
    assert!(matches!(relay.start().await, Err(relay_rust::RelayError::AlreadyStarted)));

    relay.shutdown().await.unwrap();
    assert!(!relay.is_running());
}
