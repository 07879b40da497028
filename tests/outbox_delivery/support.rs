#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_rust::{AggregateRoot, Event, EventKind, InMemoryStore, UnitOfWork};
use serde::{Deserialize, Serialize};

/// Aggregate `A`; raising `A-E` marks it as requested until a consumer
/// confirms it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct A {
    pub root: AggregateRoot,
    pub requested: bool,
    pub confirmations: u32,
}

relay_rust::aggregate!(A, "A", root);

impl A {
    pub fn request(id: &str, note: &str) -> Self {
        let mut a = A {
            root: AggregateRoot::new(id),
            requested: true,
            confirmations: 0,
        };
        a.root.raise(E {
            id: id.to_string(),
            note: note.to_string(),
        });
        a
    }

    pub fn confirm(&mut self) {
        self.confirmations += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct E {
    pub id: String,
    pub note: String,
}

impl Event for E {
    const NAME: &'static str = "A-E";
    const KIND: EventKind = EventKind::Domain;
}

/// Integration event staged without an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRequested {
    pub period: String,
}

impl Event for ReportRequested {
    const NAME: &'static str = "ReportRequested";
}

/// Commit one `A` and its event.
pub async fn commit_request(store: &Arc<InMemoryStore>, id: &str) {
    let mut unit_of_work = UnitOfWork::new(Arc::clone(store));
    unit_of_work.begin().unwrap();
    unit_of_work.save(&mut A::request(id, "first")).unwrap();
    unit_of_work.commit().await.unwrap();
}

/// Stage `count` integration events, one transaction each.
pub async fn stage_reports(store: &Arc<InMemoryStore>, count: usize) {
    for n in 0..count {
        let mut unit_of_work = UnitOfWork::new(Arc::clone(store));
        unit_of_work.begin().unwrap();
        unit_of_work
            .add_event(&ReportRequested {
                period: format!("2026-{n:03}"),
            })
            .unwrap();
        unit_of_work.commit().await.unwrap();
    }
}

pub async fn eventually<F, Fut>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
