use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_rust::outbox::DispatcherConfig;
use relay_rust::{
    ActionError, DeadLetterStore, EventHeader, InMemoryStore, ListenerConfig, OutboxStore, Relay, RelayConfig,
};

use crate::support::{commit_request, eventually, E};

fn fast_config(max_retries: u32) -> RelayConfig {
    RelayConfig {
        dispatcher: DispatcherConfig::default().with_poll_interval(Duration::from_millis(10)),
        listener: ListenerConfig::default().with_max_retries(max_retries),
        ..RelayConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_action_is_restaged_then_dead_lettered_once() {
    let store = Arc::new(InMemoryStore::new());
    let seen = Arc::new(Mutex::new(Vec::<EventHeader>::new()));
    let recorded = Arc::clone(&seen);
    let action = move |_: E, header: EventHeader| {
        recorded.lock().unwrap().push(header);
        async { Err::<(), _>(ActionError::Rejected("downstream refused".into())) }
    };

    let relay = Relay::builder(Arc::clone(&store))
        .with_config(fast_config(3))
        .listen::<E, _>("service-X", action)
        .unwrap()
        .build()
        .unwrap();
    relay.start().await.unwrap();
    commit_request(&store, "a-1").await;

    assert!(
        eventually(Duration::from_secs(10), || {
            let store = Arc::clone(&store);
            async move { store.list().await.unwrap().len() == 1 }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = relay.shutdown().await.unwrap();

    let headers = seen.lock().unwrap().clone();
    let retries: Vec<u32> = headers.iter().map(|header| header.delivery_retries).collect();
    assert_eq!(retries, vec![0, 1, 2, 3]);
    assert!(headers.iter().all(|header| header.event_id == headers[0].event_id));
    assert!(headers.iter().all(|header| header.action_id == headers[0].action_id));

    let dead = store.list().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event_id, headers[0].event_id);
    assert!(dead[0].reason.contains("downstream refused"));
    assert!(store.entries().await.unwrap().is_empty());

    let listener = relay.registry().stats_for("A-E-v1", "service-X").unwrap();
    assert_eq!(listener.retried, 3);
    assert_eq!(listener.dead_lettered, 1);
    assert_eq!(listener.handled, 0);
    assert_eq!(stats.messages_published, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dead_letters_can_be_cleared() {
    let store = Arc::new(InMemoryStore::new());
    let action = |_: E, _: EventHeader| async { Err::<(), _>(ActionError::Rejected("no".into())) };

    let relay = Relay::builder(Arc::clone(&store))
        .with_config(fast_config(1))
        .listen::<E, _>("service-X", action)
        .unwrap()
        .build()
        .unwrap();
    relay.start().await.unwrap();
    commit_request(&store, "a-1").await;
    commit_request(&store, "a-2").await;

    assert!(
        eventually(Duration::from_secs(10), || {
            let store = Arc::clone(&store);
            async move { store.list().await.unwrap().len() == 2 }
        })
        .await
    );
    relay.shutdown().await.unwrap();

    assert_eq!(store.clear().await.unwrap(), 2);
    assert!(store.list().await.unwrap().is_empty());
    assert_eq!(store.clear().await.unwrap(), 0);
}
