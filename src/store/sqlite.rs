use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use super::{ChangeSet, StoreError, StoredAggregate, TransactionalStore};
use crate::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::outbox::lease_deadline;
use crate::outbox::{OutboxEntry, OutboxStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS aggregates (
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    version INTEGER NOT NULL,
    state BLOB NOT NULL,
    PRIMARY KEY (kind, id)
);
CREATE TABLE IF NOT EXISTS outbox (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    event_id TEXT NOT NULL,
    action_id TEXT NOT NULL,
    event_name TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    is_domain_event INTEGER NOT NULL,
    payload BLOB NOT NULL,
    added_at INTEGER NOT NULL,
    is_publishing INTEGER NOT NULL DEFAULT 0,
    num_delivery_failures INTEGER NOT NULL DEFAULT 0,
    claimed_until INTEGER,
    claim_id TEXT,
    retry_at INTEGER
);
CREATE INDEX IF NOT EXISTS outbox_dispatch ON outbox (is_publishing, added_at, seq);
CREATE INDEX IF NOT EXISTS outbox_action ON outbox (action_id);
CREATE TABLE IF NOT EXISTS dead_letters (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    event_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    reason TEXT NOT NULL,
    dead_lettered_at INTEGER NOT NULL
);
";

const OUTBOX_COLUMNS: &str = "id, event_id, action_id, event_name, schema_version, is_domain_event, \
     payload, added_at, is_publishing, num_delivery_failures, claimed_until, claim_id, retry_at";

/// SQLite-backed store. Every change set is one SQL transaction and
/// claim-next is a single conditional `UPDATE`.
///
/// Timestamps are stored as microseconds since the Unix epoch.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::LockPoisoned("sqlite connection"))?;
            op(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Storage(format!("blocking store task failed: {err}")))?
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn conversion_error(index: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn uuid_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(index)?;
    Uuid::parse_str(&text).map_err(|err| conversion_error(index, err))
}

fn time_at(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: i64 = row.get(index)?;
    DateTime::from_timestamp_micros(value).ok_or(rusqlite::Error::IntegralValueOutOfRange(index, value))
}

fn optional_time_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(index)? {
        Some(value) => DateTime::from_timestamp_micros(value)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(index, value)),
        None => Ok(None),
    }
}

fn optional_uuid_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(index)? {
        Some(text) => Uuid::parse_str(&text)
            .map(Some)
            .map_err(|err| conversion_error(index, err)),
        None => Ok(None),
    }
}

fn outbox_row(row: &Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        id: uuid_at(row, 0)?,
        event_id: uuid_at(row, 1)?,
        action_id: uuid_at(row, 2)?,
        event_name: row.get(3)?,
        schema_version: row.get(4)?,
        is_domain_event: row.get(5)?,
        payload: row.get(6)?,
        added_at: time_at(row, 7)?,
        is_publishing: row.get(8)?,
        num_delivery_failures: row.get(9)?,
        claimed_until: optional_time_at(row, 10)?,
        claim_id: optional_uuid_at(row, 11)?,
        retry_at: optional_time_at(row, 12)?,
    })
}

fn insert_outbox(tx: &Transaction<'_>, entry: &OutboxEntry) -> Result<(), StoreError> {
    tx.execute(
        &format!("INSERT INTO outbox ({OUTBOX_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
        params![
            entry.id.to_string(),
            entry.event_id.to_string(),
            entry.action_id.to_string(),
            entry.event_name,
            entry.schema_version,
            entry.is_domain_event,
            entry.payload,
            micros(entry.added_at),
            entry.is_publishing,
            entry.num_delivery_failures,
            entry.claimed_until.map(micros),
            entry.claim_id.map(|id| id.to_string()),
            entry.retry_at.map(micros),
        ],
    )?;
    Ok(())
}

/// Explain why a conditional update on a claimed entry touched no rows.
fn claim_conflict(conn: &Connection, id: Uuid) -> StoreError {
    let publishing = conn
        .query_row(
            "SELECT is_publishing FROM outbox WHERE id = ?1",
            params![id.to_string()],
            |row| row.get::<_, bool>(0),
        )
        .optional();
    match publishing {
        Ok(Some(true)) => StoreError::superseded(id),
        Ok(Some(false)) => StoreError::unclaimed(id),
        Ok(None) => StoreError::missing(id),
        Err(err) => err.into(),
    }
}

#[async_trait]
impl TransactionalStore for SqliteStore {
    async fn apply(&self, changes: ChangeSet) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for write in &changes.aggregates {
                let actual: Option<i64> = tx
                    .query_row(
                        "SELECT version FROM aggregates WHERE kind = ?1 AND id = ?2",
                        params![write.kind, write.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let actual = actual.map(|version| version as u64).unwrap_or(0);
                if actual != write.expected_version {
                    return Err(StoreError::ConcurrentWrite {
                        kind: write.kind.clone(),
                        id: write.id.clone(),
                        expected: write.expected_version,
                        actual,
                    });
                }
                tx.execute(
                    "INSERT INTO aggregates (kind, id, version, state) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (kind, id) DO UPDATE SET version = excluded.version, state = excluded.state",
                    params![write.kind, write.id, write.version as i64, write.state],
                )?;
            }
            for entry in &changes.outbox {
                insert_outbox(&tx, entry)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_aggregate(&self, kind: &str, id: &str) -> Result<Option<StoredAggregate>, StoreError> {
        let (kind, id) = (kind.to_string(), id.to_string());
        self.with_conn(move |conn| {
            let stored = conn
                .query_row(
                    "SELECT version, state FROM aggregates WHERE kind = ?1 AND id = ?2",
                    params![kind, id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
                )
                .optional()?;
            Ok(stored.map(|(version, state)| StoredAggregate {
                kind,
                id,
                version: version as u64,
                state,
            }))
        })
        .await
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Option<Duration>,
    ) -> Result<Option<OutboxEntry>, StoreError> {
        let claimed_until = lease_deadline(now, lease).map(micros);
        let claim_id = Uuid::new_v4().to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE outbox SET is_publishing = 1, claimed_until = ?1, claim_id = ?3, retry_at = NULL
                 WHERE seq = (
                     SELECT seq FROM outbox
                     WHERE (is_publishing = 0 AND (retry_at IS NULL OR retry_at <= ?2))
                        OR (is_publishing = 1 AND claimed_until IS NOT NULL AND claimed_until <= ?2)
                     ORDER BY added_at, seq
                     LIMIT 1
                 )
                 RETURNING {OUTBOX_COLUMNS}"
            );
            let entry = conn
                .query_row(&sql, params![claimed_until, micros(now), claim_id], outbox_row)
                .optional()?;
            Ok(entry)
        })
        .await
    }

    async fn release(&self, claim: &OutboxEntry, retry_at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let (id, claim_id) = (claim.id, claim.claim_id.map(|token| token.to_string()));
        let retry_at = retry_at.map(micros);
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE outbox
                 SET is_publishing = 0, claimed_until = NULL, claim_id = NULL, retry_at = ?3,
                     num_delivery_failures = num_delivery_failures + 1
                 WHERE id = ?1 AND is_publishing = 1 AND claim_id = ?2",
                params![id.to_string(), claim_id, retry_at],
            )?;
            if updated == 0 {
                return Err(claim_conflict(conn, id));
            }
            Ok(())
        })
        .await
    }

    async fn remove(&self, claim: &OutboxEntry) -> Result<(), StoreError> {
        let (id, claim_id) = (claim.id, claim.claim_id.map(|token| token.to_string()));
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM outbox WHERE id = ?1 AND is_publishing = 1 AND claim_id = ?2",
                params![id.to_string(), claim_id],
            )?;
            if deleted == 0 {
                return Err(claim_conflict(conn, id));
            }
            Ok(())
        })
        .await
    }

    async fn list_by_action(&self, action_id: Uuid) -> Result<Vec<OutboxEntry>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE action_id = ?1 ORDER BY added_at, seq"
            ))?;
            let rows = stmt.query_map(params![action_id.to_string()], outbox_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn entries(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox ORDER BY added_at, seq"
            ))?;
            let rows = stmt.query_map([], outbox_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

#[async_trait]
impl DeadLetterStore for SqliteStore {
    async fn enqueue(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO dead_letters (id, event_id, payload, reason, dead_lettered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.id.to_string(),
                    entry.event_id.to_string(),
                    entry.payload,
                    entry.reason,
                    micros(entry.dead_lettered_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_id, payload, reason, dead_lettered_at FROM dead_letters ORDER BY seq",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(DeadLetterEntry {
                    id: uuid_at(row, 0)?,
                    event_id: uuid_at(row, 1)?,
                    payload: row.get(2)?,
                    reason: row.get(3)?,
                    dead_lettered_at: time_at(row, 4)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM dead_letters", [])?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventHeader, EventKind};
    use crate::store::AggregateWrite;

    fn entry(added_at: DateTime<Utc>) -> OutboxEntry {
        let header = EventHeader::new(Uuid::new_v4(), EventKind::Domain, added_at);
        OutboxEntry::new(&header, "Ticket-Sold", 1, b"{\"seat\":4}".to_vec(), added_at)
    }

    #[tokio::test]
    async fn change_set_is_atomic() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut first = ChangeSet::new(Uuid::new_v4());
        first.aggregates.push(AggregateWrite {
            kind: "Ticket".into(),
            id: "t-1".into(),
            expected_version: 0,
            version: 1,
            state: b"{}".to_vec(),
        });
        store.apply(first).await.unwrap();

        let mut stale = ChangeSet::new(Uuid::new_v4());
        stale.outbox.push(entry(Utc::now()));
        stale.aggregates.push(AggregateWrite {
            kind: "Ticket".into(),
            id: "t-1".into(),
            expected_version: 0,
            version: 1,
            state: b"{}".to_vec(),
        });

        let err = store.apply(stale).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentWrite { .. }));
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_release_remove_cycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let staged = entry(now);
        let mut changes = ChangeSet::new(staged.action_id);
        changes.outbox.push(staged.clone());
        store.apply(changes).await.unwrap();

        let claimed = store.claim_next(now, None).await.unwrap().unwrap();
        assert_eq!(claimed.id, staged.id);
        assert_eq!(claimed.payload, staged.payload);
        assert!(claimed.is_publishing);
        assert!(store.claim_next(now, None).await.unwrap().is_none());

        store.release(&claimed, None).await.unwrap();
        assert!(matches!(
            store.release(&claimed, None).await,
            Err(StoreError::ClaimConflict { reason: "entry is not claimed", .. })
        ));

        let again = store.claim_next(now, None).await.unwrap().unwrap();
        assert_eq!(again.num_delivery_failures, 1);
        store.remove(&again).await.unwrap();
        assert!(matches!(
            store.remove(&again).await,
            Err(StoreError::ClaimConflict { reason: "entry does not exist", .. })
        ));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut changes = ChangeSet::new(Uuid::new_v4());
        changes.outbox.push(entry(now));
        store.apply(changes).await.unwrap();
        let lease = Some(Duration::from_secs(10));

        let stale = store.claim_next(now, lease).await.unwrap().unwrap();
        let later = now + chrono::Duration::seconds(11);
        let current = store.claim_next(later, lease).await.unwrap().unwrap();

        assert!(matches!(
            store.remove(&stale).await,
            Err(StoreError::ClaimConflict { reason: "claim is held by someone else", .. })
        ));
        store.remove(&current).await.unwrap();
    }

    #[tokio::test]
    async fn released_entry_is_skipped_until_retry_time() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let older = entry(now - chrono::Duration::seconds(1));
        let newer = entry(now);
        let mut changes = ChangeSet::new(Uuid::new_v4());
        changes.outbox.extend([older.clone(), newer.clone()]);
        store.apply(changes).await.unwrap();

        let claimed = store.claim_next(now, None).await.unwrap().unwrap();
        assert_eq!(claimed.id, older.id);
        let retry_at = now + chrono::Duration::seconds(5);
        store.release(&claimed, Some(retry_at)).await.unwrap();

        assert_eq!(store.claim_next(now, None).await.unwrap().unwrap().id, newer.id);
        assert!(store.claim_next(now, None).await.unwrap().is_none());
        let due = store.claim_next(retry_at, None).await.unwrap().unwrap();
        assert_eq!(due.id, older.id);
        assert_eq!(due.retry_at, None);
    }

    #[tokio::test]
    async fn dead_letters_round_trip_and_clear() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .enqueue(DeadLetterEntry::new(Uuid::nil(), vec![0xff], "undecodable", Utc::now()))
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reason, "undecodable");
        assert_eq!(store.clear().await.unwrap(), 1);
    }
}
