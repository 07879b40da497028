use std::sync::Arc;

use super::amqp::{AmqpConnector, AmqpTransport};
use super::cloud::{CloudConnector, CloudTransport};
use super::log::{LogConnector, LogTransport};
use super::{Backend, InProcessBroker, InProcessTransport, MessagingTransport, TransportConfig, TransportError};

/// Broker clients the host makes available to [`build`].
///
/// Native client libraries plug in by implementing the connector trait of
/// their backend.
#[derive(Clone, Default)]
pub struct Connectors {
    in_process: Option<InProcessBroker>,
    amqp: Option<Arc<dyn AmqpConnector>>,
    log: Option<Arc<dyn LogConnector>>,
    cloud: Option<Arc<dyn CloudConnector>>,
}

impl Connectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_in_process(mut self, broker: InProcessBroker) -> Self {
        self.in_process = Some(broker);
        self
    }

    pub fn with_amqp(mut self, connector: Arc<dyn AmqpConnector>) -> Self {
        self.amqp = Some(connector);
        self
    }

    pub fn with_log(mut self, connector: Arc<dyn LogConnector>) -> Self {
        self.log = Some(connector);
        self
    }

    pub fn with_cloud(mut self, connector: Arc<dyn CloudConnector>) -> Self {
        self.cloud = Some(connector);
        self
    }
}

/// With the `kafka` feature the log backend talks to Kafka unless the host
/// registers another connector.
#[cfg(feature = "kafka")]
fn default_log_connector() -> Result<Arc<dyn LogConnector>, TransportError> {
    Ok(Arc::new(super::log::KafkaConnector::new()))
}

#[cfg(not(feature = "kafka"))]
fn default_log_connector() -> Result<Arc<dyn LogConnector>, TransportError> {
    Err(TransportError::Configuration(format!("no {} connector registered", Backend::Log)))
}

/// Build the transport selected by `config.backend`.
pub fn build(config: &TransportConfig, connectors: &Connectors) -> Result<Arc<dyn MessagingTransport>, TransportError> {
    config.validate()?;
    let missing = |backend: Backend| TransportError::Configuration(format!("no {backend} connector registered"));

    let transport: Arc<dyn MessagingTransport> = match config.backend {
        Backend::InProcess => {
            let broker = connectors.in_process.clone().unwrap_or_default();
            Arc::new(InProcessTransport::new(broker, config.clone()))
        }
        Backend::Amqp => {
            let connector = connectors.amqp.clone().ok_or_else(|| missing(Backend::Amqp))?;
            Arc::new(AmqpTransport::new(connector, config.clone()))
        }
        Backend::Log => {
            let connector = connectors.log.clone().map_or_else(default_log_connector, Ok)?;
            Arc::new(LogTransport::new(connector, config.clone()))
        }
        Backend::Cloud => {
            let connector = connectors.cloud.clone().ok_or_else(|| missing(Backend::Cloud))?;
            Arc::new(CloudTransport::new(connector, config.clone()))
        }
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::amqp::MemoryAmqpBroker;

    #[test]
    fn selects_backend_from_config() {
        let connectors = Connectors::new().with_amqp(Arc::new(MemoryAmqpBroker::new()));

        let amqp = build(&TransportConfig::new(Backend::Amqp), &connectors).unwrap();
        let local = build(&TransportConfig::default(), &connectors).unwrap();

        assert_eq!(amqp.backend(), Backend::Amqp);
        assert_eq!(local.backend(), Backend::InProcess);
    }

    #[test]
    fn missing_connector_is_a_configuration_error() {
        let result = build(&TransportConfig::new(Backend::Cloud), &Connectors::new());
        assert!(matches!(result, Err(TransportError::Configuration(reason)) if reason.contains("cloud")));
    }

    #[cfg(feature = "kafka")]
    #[test]
    fn log_backend_defaults_to_kafka() {
        let transport = build(&TransportConfig::new(Backend::Log), &Connectors::new()).unwrap();
        assert_eq!(transport.backend(), Backend::Log);
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn log_backend_needs_a_connector_without_kafka() {
        let result = build(&TransportConfig::new(Backend::Log), &Connectors::new());
        assert!(matches!(result, Err(TransportError::Configuration(reason)) if reason.contains("log")));
    }
}
