use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_rust::{Clock, InMemoryStore, ManualClock, OutboxStore, StoreError};
use uuid::Uuid;

use crate::support::stage_reports;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_never_hand_out_an_entry_twice() {
    const ENTRIES: usize = 200;
    const CLAIMERS: usize = 8;

    let store = Arc::new(InMemoryStore::new());
    stage_reports(&store, ENTRIES).await;

    let mut tasks = Vec::new();
    for _ in 0..CLAIMERS {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(entry) = store.claim_next(Utc::now(), Some(Duration::from_secs(300))).await.unwrap() {
                claimed.push(entry.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let distinct: HashSet<Uuid> = all.iter().copied().collect();

    assert_eq!(all.len(), ENTRIES);
    assert_eq!(distinct.len(), ENTRIES);
    assert!(store.entries().await.unwrap().iter().all(|entry| entry.is_publishing));
}

#[tokio::test]
async fn claims_come_out_oldest_first() {
    let store = Arc::new(InMemoryStore::new());
    stage_reports(&store, 3).await;
    let mut staged = store.entries().await.unwrap();
    staged.sort_by_key(|entry| entry.added_at);

    let mut claimed = Vec::new();
    while let Some(entry) = store.claim_next(Utc::now(), None).await.unwrap() {
        claimed.push(entry.id);
    }

    let expected: Vec<Uuid> = staged.iter().map(|entry| entry.id).collect();
    assert_eq!(claimed, expected);
}

#[tokio::test]
async fn expired_lease_can_be_reclaimed() {
    let store = Arc::new(InMemoryStore::new());
    stage_reports(&store, 1).await;
    let clock = ManualClock::default();
    let lease = Some(Duration::from_secs(60));

    let first = store.claim_next(clock.now(), lease).await.unwrap().unwrap();
    assert!(store.claim_next(clock.now(), lease).await.unwrap().is_none());

    clock.advance(Duration::from_secs(61));
    let again = store.claim_next(clock.now(), lease).await.unwrap().unwrap();
    assert_eq!(again.id, first.id);
}

#[tokio::test]
async fn claims_without_a_lease_never_expire() {
    let store = Arc::new(InMemoryStore::new());
    stage_reports(&store, 1).await;
    let clock = ManualClock::default();

    store.claim_next(clock.now(), None).await.unwrap().unwrap();
    clock.advance(Duration::from_secs(365 * 24 * 3600));

    assert!(store.claim_next(clock.now(), None).await.unwrap().is_none());
}

#[tokio::test]
async fn release_and_remove_require_a_claim() {
    let store = Arc::new(InMemoryStore::new());
    stage_reports(&store, 1).await;
    let staged = store.entries().await.unwrap().remove(0);

    assert!(matches!(store.release(&staged, None).await, Err(StoreError::ClaimConflict { .. })));
    assert!(matches!(store.remove(&staged).await, Err(StoreError::ClaimConflict { .. })));
    let mut unknown = staged.clone();
    unknown.id = Uuid::new_v4();
    assert!(matches!(store.remove(&unknown).await, Err(StoreError::ClaimConflict { .. })));

    let claimed = store.claim_next(Utc::now(), None).await.unwrap().unwrap();
    store.release(&claimed, None).await.unwrap();
    let released = store.entries().await.unwrap().remove(0);
    assert!(!released.is_publishing);
    assert_eq!(released.num_delivery_failures, 1);

    let claimed = store.claim_next(Utc::now(), None).await.unwrap().unwrap();
    store.remove(&claimed).await.unwrap();
    assert!(store.entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn dispatcher_whose_lease_ran_out_cannot_settle_the_entry() {
    let store = Arc::new(InMemoryStore::new());
    stage_reports(&store, 1).await;
    let clock = ManualClock::default();
    let lease = Some(Duration::from_secs(30));

    let slow = store.claim_next(clock.now(), lease).await.unwrap().unwrap();
    clock.advance(Duration::from_secs(31));
    let fast = store.claim_next(clock.now(), lease).await.unwrap().unwrap();
    assert_eq!(fast.id, slow.id);

    assert!(matches!(store.remove(&slow).await, Err(StoreError::ClaimConflict { .. })));
    assert!(matches!(store.release(&slow, None).await, Err(StoreError::ClaimConflict { .. })));
    assert!(store.entries().await.unwrap()[0].is_held_by(&fast));

    store.remove(&fast).await.unwrap();
    assert!(store.entries().await.unwrap().is_empty());
}
