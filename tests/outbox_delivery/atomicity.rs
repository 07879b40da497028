use std::sync::Arc;

use relay_rust::{InMemoryStore, OutboxStore, StoreError, UnitOfWork, UnitOfWorkError};

use crate::support::{A, E};

#[tokio::test]
async fn failed_outbox_write_rolls_back_the_aggregate() {
    let store = Arc::new(InMemoryStore::new());
    store.fail_next_outbox_append();

    let mut unit_of_work = UnitOfWork::new(Arc::clone(&store));
    unit_of_work.begin().unwrap();
    unit_of_work.save(&mut A::request("a-1", "first")).unwrap();
    let result = unit_of_work.commit().await;

    assert!(matches!(
        result,
        Err(UnitOfWorkError::Store(StoreError::InjectedFailure(_)))
    ));
    assert!(!unit_of_work.is_active());
    assert_eq!(store.aggregate_count().unwrap(), 0);
    assert!(store.entries().await.unwrap().is_empty());
    let loaded: Option<A> = unit_of_work.load("a-1").await.unwrap();
    assert!(loaded.is_none());
}

#[tokio::test]
async fn committed_aggregate_and_events_share_an_action_id() {
    let store = Arc::new(InMemoryStore::new());

    let mut unit_of_work = UnitOfWork::new(Arc::clone(&store));
    let action_id = unit_of_work.begin().unwrap();
    unit_of_work.save(&mut A::request("a-1", "first")).unwrap();
    let receipt = unit_of_work.commit().await.unwrap();

    assert_eq!(receipt.action_id, action_id);
    assert_eq!(receipt.aggregates, 1);
    let staged = store.list_by_action(action_id).await.unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].event_name, "A-E");
    assert_eq!(staged[0].topic(), "A-E-v1");
    assert!(staged[0].is_domain_event);
    assert_eq!(receipt.events, vec![staged[0].event_id]);

    let payload: relay_rust::EventEnvelope<E> = relay_rust::PayloadFormat::Json.decode(&staged[0].payload).unwrap();
    assert_eq!(payload.body.id, "a-1");
    assert_eq!(payload.header.delivery_retries, 0);
}

#[tokio::test]
async fn stale_writer_loses_without_staging_events() {
    let store = Arc::new(InMemoryStore::new());
    let mut setup = UnitOfWork::new(Arc::clone(&store));
    setup.begin().unwrap();
    setup.save(&mut A::request("a-1", "first")).unwrap();
    setup.commit().await.unwrap();
    let before = store.entries().await.unwrap().len();

    let mut first = UnitOfWork::new(Arc::clone(&store));
    let mut second = UnitOfWork::new(Arc::clone(&store));
    let mut a1: A = first.load("a-1").await.unwrap().unwrap();
    let mut a2: A = second.load("a-1").await.unwrap().unwrap();

    first.begin().unwrap();
    a1.confirm();
    first.save(&mut a1).unwrap();
    first.commit().await.unwrap();

    second.begin().unwrap();
    a2.confirm();
    a2.root.raise(E {
        id: "a-1".into(),
        note: "stale".into(),
    });
    second.save(&mut a2).unwrap();
    let result = second.commit().await;

    assert!(matches!(
        result,
        Err(UnitOfWorkError::Store(StoreError::ConcurrentWrite { .. }))
    ));
    assert_eq!(store.entries().await.unwrap().len(), before);
}
