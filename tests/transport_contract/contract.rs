//! Behaviour every transport backend must share.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_rust::{HandlerError, Message, TransportError};

use crate::support::{bounded, eventually, text, Broker, Recorder};

const WAIT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(150);

// ============================================================
// Durability
// ============================================================

pub async fn publishes_before_the_first_subscription_are_not_seen(broker: Broker) {
    let transport = broker.transport();
    let recorder = Recorder::new();

    bounded(transport.publish("Parcel-Sent-v1", text("m-early", "early"))).await.unwrap();
    let _subscription = bounded(transport.subscribe("Parcel-Sent-v1", "tracking", recorder.handler()))
        .await
        .unwrap();
    bounded(transport.publish("Parcel-Sent-v1", text("m-late", "late"))).await.unwrap();

    assert!(eventually(WAIT, || recorder.has("late")).await);
    tokio::time::sleep(QUIET).await;
    assert!(!recorder.has("early"));
    transport.dispose().await.unwrap();
}

pub async fn publishes_while_the_group_is_offline_are_retained(broker: Broker) {
    let transport = broker.transport();
    let first = Recorder::new();

    let subscription = bounded(transport.subscribe("Parcel-Sent-v1", "tracking", first.handler()))
        .await
        .unwrap();
    subscription.dispose().await.unwrap();

    for n in 0..3 {
        bounded(transport.publish("Parcel-Sent-v1", text(&format!("m-{n}"), &format!("offline-{n}"))))
            .await
            .unwrap();
    }

    let second = Recorder::new();
    let _subscription = bounded(transport.subscribe("Parcel-Sent-v1", "tracking", second.handler()))
        .await
        .unwrap();

    assert!(eventually(WAIT, || second.count() >= 3).await);
    let mut payloads = second.payloads();
    payloads.sort();
    assert_eq!(payloads, vec!["offline-0", "offline-1", "offline-2"]);
    assert_eq!(first.count(), 0);
    transport.dispose().await.unwrap();
}

// ============================================================
// Redelivery
// ============================================================

pub async fn failed_messages_are_redelivered(broker: Broker) {
    let transport = broker.transport();
    let recorder = Recorder::new();
    let _subscription = bounded(transport.subscribe("Parcel-Lost-v1", "claims", recorder.failing_handler()))
        .await
        .unwrap();

    bounded(transport.publish("Parcel-Lost-v1", text("m-1", "lost"))).await.unwrap();

    assert!(eventually(WAIT, || recorder.count() >= 3).await);
    transport.dispose().await.unwrap();

    let attempts = recorder.attempts_by_id();
    assert_eq!(attempts.len(), 1);
    let seen = &attempts["m-1"];
    assert_eq!(seen[0], 1);
    assert!(seen.windows(2).all(|pair| pair[1] > pair[0]));
}

pub async fn slow_handlers_are_treated_as_failures(broker: Broker) {
    let transport = broker.transport_with(broker.config().with_ack_timeout(Duration::from_millis(50)));
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    let handler = move |_: Message| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<(), HandlerError>(())
        }
    };
    let _subscription = bounded(transport.subscribe("Parcel-Lost-v1", "claims", Arc::new(handler)))
        .await
        .unwrap();

    bounded(transport.publish("Parcel-Lost-v1", text("m-1", "slow"))).await.unwrap();

    assert!(eventually(WAIT, || started.load(Ordering::SeqCst) >= 2).await);
    transport.dispose().await.unwrap();
}

// ============================================================
// Competing consumers
// ============================================================

pub async fn competing_consumers_share_the_work(broker: Broker) {
    for consumers in [2, 3, 4, 5] {
        share_work(&broker, consumers).await;
    }
}

async fn share_work(broker: &Broker, consumers: usize) {
    const MESSAGES: usize = 300;
    let topic = format!("Parcel-Sorted-{consumers}-v1");

    let recorders: Vec<Recorder> = (0..consumers).map(|_| Recorder::new()).collect();
    let mut transports = Vec::new();
    let mut subscriptions = Vec::new();
    for recorder in &recorders {
        let transport = broker.transport();
        let subscription = bounded(transport.subscribe(
            &topic,
            "sorting",
            recorder.handler_with(Duration::from_millis(2), false),
        ))
        .await
        .unwrap();
        transports.push(transport);
        subscriptions.push(subscription);
    }

    let publisher = broker.transport();
    for n in 0..MESSAGES {
        bounded(publisher.publish(&topic, text(&format!("m-{n}"), &format!("parcel-{n}"))))
            .await
            .unwrap();
    }

    let total = || recorders.iter().map(Recorder::count).sum::<usize>();
    assert!(eventually(WAIT, || total() >= MESSAGES).await);
    tokio::time::sleep(QUIET).await;
    assert_eq!(total(), MESSAGES);

    let distinct: HashSet<String> = recorders.iter().flat_map(Recorder::payloads).collect();
    assert_eq!(distinct.len(), MESSAGES);

    let even = MESSAGES / consumers;
    let tolerance = even / 10;
    let shares: Vec<usize> = recorders.iter().map(Recorder::count).collect();
    for (index, share) in shares.iter().enumerate() {
        assert!(
            share.abs_diff(even) <= tolerance,
            "consumer {index} of {consumers} handled {share} of {MESSAGES}, shares={shares:?}"
        );
    }

    for transport in transports.iter().chain(std::iter::once(&publisher)) {
        transport.dispose().await.unwrap();
    }
}

// ============================================================
// Provisioning
// ============================================================

pub async fn missing_topics_fail_fast_without_auto_create(broker: Broker) {
    let strict = broker.transport_with(broker.config().with_auto_create_topics(false));
    let recorder = Recorder::new();

    let publish = bounded(strict.publish("Parcel-Held-v1", text("m-1", "held"))).await;
    assert!(matches!(publish, Err(TransportError::TopicNotFound { ref topic }) if topic == "Parcel-Held-v1"));
    let subscribe = bounded(strict.subscribe("Parcel-Held-v1", "customs", recorder.handler())).await;
    assert!(matches!(subscribe, Err(TransportError::TopicNotFound { .. })));

    let lenient = broker.transport();
    let _subscription = bounded(lenient.subscribe("Parcel-Held-v1", "customs", recorder.handler()))
        .await
        .unwrap();

    bounded(strict.publish("Parcel-Held-v1", text("m-2", "cleared"))).await.unwrap();
    assert!(eventually(WAIT, || recorder.has("cleared")).await);

    strict.dispose().await.unwrap();
    lenient.dispose().await.unwrap();
}

// ============================================================
// Lifecycle
// ============================================================

pub async fn one_live_subscription_per_group(broker: Broker) {
    let transport = broker.transport();
    let recorder = Recorder::new();

    let first = bounded(transport.subscribe("Parcel-Sent-v1", "tracking", recorder.handler()))
        .await
        .unwrap();
    let second = bounded(transport.subscribe("Parcel-Sent-v1", "tracking", recorder.handler())).await;
    assert!(matches!(second, Err(TransportError::AlreadySubscribed { .. })));

    let other_group = bounded(transport.subscribe("Parcel-Sent-v1", "billing", recorder.handler())).await;
    assert!(other_group.is_ok());

    transport.unsubscribe(first).await.unwrap();
    let again = bounded(transport.subscribe("Parcel-Sent-v1", "tracking", recorder.handler())).await;
    assert!(again.is_ok());
    transport.dispose().await.unwrap();
}

pub async fn disposal_is_idempotent(broker: Broker) {
    let transport = broker.transport();
    let recorder = Recorder::new();
    let subscription = bounded(transport.subscribe("Parcel-Sent-v1", "tracking", recorder.handler()))
        .await
        .unwrap();
    let kept = bounded(transport.subscribe("Parcel-Sent-v1", "billing", recorder.handler()))
        .await
        .unwrap();

    subscription.dispose().await.unwrap();
    subscription.dispose().await.unwrap();
    assert!(subscription.is_disposed());

    bounded(transport.dispose()).await.unwrap();
    bounded(transport.dispose()).await.unwrap();
    assert!(kept.is_disposed());

    let publish = transport.publish("Parcel-Sent-v1", text("m-1", "late")).await;
    assert_eq!(publish, Err(TransportError::Disposed));
    let subscribe = transport.subscribe("Parcel-Sent-v1", "tracking", recorder.handler()).await;
    assert!(matches!(subscribe, Err(TransportError::Disposed)));
}

// ============================================================
// Reconnect
// ============================================================

pub async fn consumers_and_publishers_survive_a_severed_connection(broker: Broker) {
    let transport = broker.transport();
    let recorder = Recorder::new();
    let _subscription = bounded(transport.subscribe("Parcel-Sent-v1", "tracking", recorder.handler()))
        .await
        .unwrap();
    bounded(transport.publish("Parcel-Sent-v1", text("m-1", "before"))).await.unwrap();
    assert!(eventually(WAIT, || recorder.has("before")).await);

    assert!(broker.sever_and_hold());
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.restore();

    bounded(transport.publish("Parcel-Sent-v1", text("m-2", "after"))).await.unwrap();
    assert!(eventually(WAIT, || recorder.has("after")).await);
    transport.dispose().await.unwrap();
}
