//! rumqttc-backed broker sessions

use super::connection::{configure_mqtt_options, Credentials, MqttError};
use super::message_handler::MessageHandler;
use crate::config::MqttSection;
use crate::transport::{BrokerLink, Connector, LinkError, LinkEvent, LinkEvents};
use rumqttc::{AsyncClient, ClientError, EventLoop, QoS};

/// Capacity of the request channel between client handle and event loop
const REQUEST_CAPACITY: usize = 64;

/// Opens rumqttc sessions from a fixed configuration
#[derive(Debug, Clone)]
pub struct RumqttcConnector {
    config: MqttSection,
    credentials: Option<Credentials>,
}

impl RumqttcConnector {
    /// Validate the configuration and capture credentials once
    pub fn new(config: &MqttSection) -> Result<Self, MqttError> {
        let credentials = Credentials::from_config(config);
        // Surface bad options now rather than on the first attempt
        configure_mqtt_options(config, credentials.as_ref())?;
        Ok(Self {
            config: config.clone(),
            credentials,
        })
    }
}

impl Connector for RumqttcConnector {
    type Link = RumqttcLink;
    type Events = RumqttcEvents;

    fn open(&self) -> Result<(RumqttcLink, RumqttcEvents), MqttError> {
        let options = configure_mqtt_options(&self.config, self.credentials.as_ref())?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok((RumqttcLink { client }, RumqttcEvents { event_loop }))
    }
}

/// Submission handle for one rumqttc session
pub struct RumqttcLink {
    client: AsyncClient,
}

fn rejected(error: ClientError) -> LinkError {
    LinkError::Rejected(error.to_string())
}

impl BrokerLink for RumqttcLink {
    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(rejected)
    }

    fn try_subscribe(&self, filter: &str) -> Result<(), LinkError> {
        self.client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(rejected)
    }

    fn try_unsubscribe(&self, filter: &str) -> Result<(), LinkError> {
        self.client.try_unsubscribe(filter).map_err(rejected)
    }

    fn try_disconnect(&self) -> Result<(), LinkError> {
        self.client.try_disconnect().map_err(rejected)
    }
}

/// Event loop for one rumqttc session
pub struct RumqttcEvents {
    event_loop: EventLoop,
}

#[async_trait::async_trait]
impl LinkEvents for RumqttcEvents {
    async fn next_event(&mut self) -> Result<LinkEvent, LinkError> {
        self.event_loop
            .poll()
            .await
            .map(|event| MessageHandler::route_mqtt_event(&event))
            .map_err(|e| LinkError::Connection(crate::error::redact_secrets(&e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_rejects_invalid_client_id() {
        let config = MqttSection::new("", "localhost", "out");
        assert!(matches!(
            RumqttcConnector::new(&config),
            Err(MqttError::ClientCreate(_))
        ));
    }

    #[tokio::test]
    async fn test_open_creates_independent_sessions() {
        let config = MqttSection::new("gw", "localhost", "out");
        let connector = RumqttcConnector::new(&config).unwrap();

        let (first, _first_events) = connector.open().unwrap();
        let (second, _second_events) = connector.open().unwrap();

        // Nothing is polled, so submissions just queue on each session
        assert!(first.try_publish("out", b"one".to_vec()).is_ok());
        assert!(second.try_subscribe("in/#").is_ok());
    }
}
