#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_rust::transport::amqp::MemoryAmqpBroker;
use relay_rust::transport::cloud::MemoryCloudBroker;
use relay_rust::transport::log::MemoryLogBroker;
use relay_rust::transport::{self, Backend, Connectors, InProcessBroker, ReconnectConfig};
use relay_rust::{HandlerError, Message, MessageHandler, MessagingTransport, TransportConfig};

/// One broker shared by every transport a test builds.
pub struct Broker {
    backend: Backend,
    connectors: Connectors,
    sever: Option<Box<dyn Fn() + Send + Sync>>,
    reachable: Option<Box<dyn Fn(bool) + Send + Sync>>,
}

impl Broker {
    pub fn in_process() -> Self {
        Self {
            backend: Backend::InProcess,
            connectors: Connectors::new().with_in_process(InProcessBroker::new()),
            sever: None,
            reachable: None,
        }
    }

    pub fn amqp() -> Self {
        let broker = MemoryAmqpBroker::new();
        let (severed, toggled) = (broker.clone(), broker.clone());
        Self {
            backend: Backend::Amqp,
            connectors: Connectors::new().with_amqp(Arc::new(broker)),
            sever: Some(Box::new(move || severed.sever_connections())),
            reachable: Some(Box::new(move |up| toggled.set_reachable(up))),
        }
    }

    pub fn log() -> Self {
        let broker = MemoryLogBroker::new();
        let (severed, toggled) = (broker.clone(), broker.clone());
        Self {
            backend: Backend::Log,
            connectors: Connectors::new().with_log(Arc::new(broker)),
            sever: Some(Box::new(move || severed.sever_connections())),
            reachable: Some(Box::new(move |up| toggled.set_reachable(up))),
        }
    }

    pub fn cloud() -> Self {
        let broker = MemoryCloudBroker::new();
        let (severed, toggled) = (broker.clone(), broker.clone());
        Self {
            backend: Backend::Cloud,
            connectors: Connectors::new().with_cloud(Arc::new(broker)),
            sever: Some(Box::new(move || severed.sever_connections())),
            reachable: Some(Box::new(move |up| toggled.set_reachable(up))),
        }
    }

    /// Short timings so redelivery and reconnects happen within a test.
    pub fn config(&self) -> TransportConfig {
        let mut config = TransportConfig::new(self.backend)
            .with_redelivery_delay(Duration::from_millis(10))
            .with_ack_timeout(Duration::from_secs(2))
            .with_reconnect(ReconnectConfig {
                initial_delay_ms: 5,
                max_delay_ms: 50,
                multiplier: 2.0,
                jitter: 0.1,
            });
        config.log.poll_interval_ms = 5;
        config.cloud.receive_wait_ms = 20;
        config
    }

    pub fn transport(&self) -> Arc<dyn MessagingTransport> {
        self.transport_with(self.config())
    }

    pub fn transport_with(&self, config: TransportConfig) -> Arc<dyn MessagingTransport> {
        transport::build(&config, &self.connectors).expect("transport builds")
    }

    /// Drop every live connection while keeping the broker unreachable.
    /// Returns false for brokers without connections.
    pub fn sever_and_hold(&self) -> bool {
        let (Some(sever), Some(reachable)) = (&self.sever, &self.reachable) else {
            return false;
        };
        reachable(false);
        sever();
        true
    }

    pub fn restore(&self) {
        if let Some(reachable) = &self.reachable {
            reachable(true);
        }
    }
}

/// Deliveries seen by a handler, in arrival order.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Message>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledges everything.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.handler_with(Duration::ZERO, false)
    }

    /// Fails every delivery.
    pub fn failing_handler(&self) -> Arc<dyn MessageHandler> {
        self.handler_with(Duration::ZERO, true)
    }

    pub fn handler_with(&self, work: Duration, fail: bool) -> Arc<dyn MessageHandler> {
        let seen = Arc::clone(&self.seen);
        Arc::new(move |message: Message| {
            let seen = Arc::clone(&seen);
            async move {
                if !work.is_zero() {
                    tokio::time::sleep(work).await;
                }
                seen.lock().unwrap().push(message);
                if fail {
                    Err(HandlerError::new("handler refused"))
                } else {
                    Ok(())
                }
            }
        })
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.payload_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn has(&self, payload: &str) -> bool {
        self.payloads().iter().any(|seen| seen == payload)
    }

    pub fn attempts_by_id(&self) -> HashMap<String, Vec<u32>> {
        let mut attempts: HashMap<String, Vec<u32>> = HashMap::new();
        for message in self.seen.lock().unwrap().iter() {
            attempts
                .entry(message.id.clone())
                .or_default()
                .push(message.delivery_attempt);
        }
        attempts
    }
}

pub fn text(id: &str, payload: &str) -> Message {
    Message::new(id, payload.as_bytes().to_vec())
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run `future` with a generous upper bound so a hang fails the test
/// instead of stalling the suite.
pub async fn bounded<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(20), future)
        .await
        .expect("operation finished in time")
}
