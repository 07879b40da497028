//! One broker connection per transport, re-established on loss.
//!
//! Every publish and every consumer acquires the connection through the
//! manager. Connecting is single-flight: concurrent callers wait on the same
//! attempt instead of opening connections of their own. After a failure the
//! caller reports the generation it saw; only the first report for a
//! generation drops the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ReconnectConfig, TransportError};

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            config: config.clone(),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(self.attempt.min(32) as i32);
        let capped_ms = base_ms.min(self.config.max_delay_ms as f64);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        Duration::from_micros((capped_ms * factor * 1_000.0).round().max(0.0) as u64)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Sleep for the next delay. Returns false if cancelled first.
    pub async fn wait(&mut self, token: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Opens connections to one broker.
#[async_trait]
pub(crate) trait Connector: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Connection, TransportError>;

    fn is_open(connection: &Self::Connection) -> bool;
}

/// A connection together with the generation it belongs to.
#[derive(Clone)]
pub(crate) struct Lease<C> {
    pub generation: u64,
    pub connection: C,
}

pub(crate) struct ConnectionManager<K: Connector> {
    name: &'static str,
    connector: K,
    reconnect: ReconnectConfig,
    current: Mutex<Option<Lease<K::Connection>>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl<K: Connector> ConnectionManager<K> {
    pub fn new(name: &'static str, connector: K, reconnect: ReconnectConfig, shutdown: CancellationToken) -> Self {
        Self {
            name,
            connector,
            reconnect,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Current connection, connecting first if there is none.
    ///
    /// Retries with backoff until connected or the transport is disposed.
    pub async fn acquire(&self) -> Result<Lease<K::Connection>, TransportError> {
        let mut current = self.current.lock().await;
        if let Some(lease) = current.as_ref() {
            if K::is_open(&lease.connection) {
                return Ok(lease.clone());
            }
        }
        *current = None;

        let mut backoff = Backoff::new(&self.reconnect);
        loop {
            if self.shutdown.is_cancelled() {
                return Err(TransportError::Disposed);
            }
            match self.connector.connect().await {
                Ok(connection) => {
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    if generation > 1 || backoff.attempts() > 0 {
                        info!(broker = self.name, generation, "reconnected to broker");
                    } else {
                        info!(broker = self.name, "connected to broker");
                    }
                    let lease = Lease {
                        generation,
                        connection,
                    };
                    *current = Some(lease.clone());
                    return Ok(lease);
                }
                Err(err) => {
                    let attempt = backoff.attempts() + 1;
                    warn!(broker = self.name, attempt, error = %err, "broker connection failed, backing off");
                    if !backoff.wait(&self.shutdown).await {
                        return Err(TransportError::Disposed);
                    }
                }
            }
        }
    }

    /// Drop the connection of `generation` if it is still the current one.
    pub async fn invalidate(&self, generation: u64) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|lease| lease.generation == generation) {
            warn!(broker = self.name, generation, "broker connection lost");
            *current = None;
        }
    }

    pub async fn close(&self) {
        self.current.lock().await.take();
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn quick() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 1,
            max_delay_ms: 4,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        let mut backoff = Backoff::new(&config);
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = ReconnectConfig {
            jitter: 0.2,
            ..ReconnectConfig::default()
        };
        for _ in 0..100 {
            let delay = Backoff::new(&config).next_delay().as_millis();
            assert!((80..=120).contains(&delay), "delay {delay}ms out of range");
        }
    }

    /// Fails a fixed number of times, then hands out numbered connections.
    struct Flaky {
        failures_left: AtomicUsize,
        connects: Arc<AtomicUsize>,
        open: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Connector for Flaky {
        type Connection = (usize, Arc<std::sync::atomic::AtomicBool>);

        async fn connect(&self) -> Result<Self::Connection, TransportError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Connection("refused".into()));
            }
            self.open.store(true, Ordering::SeqCst);
            Ok((self.connects.fetch_add(1, Ordering::SeqCst) + 1, Arc::clone(&self.open)))
        }

        fn is_open(connection: &Self::Connection) -> bool {
            connection.1.load(Ordering::SeqCst)
        }
    }

    fn flaky(failures: usize) -> (Flaky, Arc<AtomicUsize>, Arc<std::sync::atomic::AtomicBool>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let connector = Flaky {
            failures_left: AtomicUsize::new(failures),
            connects: Arc::clone(&connects),
            open: Arc::clone(&open),
        };
        (connector, connects, open)
    }

    #[tokio::test]
    async fn acquire_retries_until_connected() {
        let (connector, connects, _) = flaky(3);
        let manager = ConnectionManager::new("test", connector, quick(), CancellationToken::new());

        let lease = manager.acquire().await.unwrap();

        assert_eq!(lease.generation, 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_connection() {
        let (connector, connects, _) = flaky(0);
        let manager = Arc::new(ConnectionManager::new("test", connector, quick(), CancellationToken::new()));

        let (a, b) = tokio::join!(manager.acquire(), manager.acquire());

        assert_eq!(a.unwrap().generation, b.unwrap().generation);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_connection_is_replaced() {
        let (connector, connects, open) = flaky(0);
        let manager = ConnectionManager::new("test", connector, quick(), CancellationToken::new());
        let first = manager.acquire().await.unwrap();

        open.store(false, Ordering::SeqCst);
        let second = manager.acquire().await.unwrap();

        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_invalidation_is_ignored() {
        let (connector, connects, _) = flaky(0);
        let manager = ConnectionManager::new("test", connector, quick(), CancellationToken::new());
        let first = manager.acquire().await.unwrap();
        manager.invalidate(first.generation).await;
        let second = manager.acquire().await.unwrap();

        manager.invalidate(first.generation).await;
        let third = manager.acquire().await.unwrap();

        assert_eq!(second.generation, third.generation);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_reconnecting() {
        let (connector, _, _) = flaky(usize::MAX);
        let shutdown = CancellationToken::new();
        let manager = Arc::new(ConnectionManager::new("test", connector, quick(), shutdown.clone()));

        let pending = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.acquire().await.map(|lease| lease.generation) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        assert_eq!(pending.await.unwrap(), Err(TransportError::Disposed));
    }
}
