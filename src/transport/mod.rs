//! Transport seam for the broker connection manager
//!
//! The manager never talks to a network library directly. A [`Connector`]
//! produces one fresh [`BrokerLink`] / [`LinkEvents`] pair per connection
//! attempt; the production implementation wraps rumqttc and the test
//! implementation lives in [`crate::testing::mocks`].

use thiserror::Error;

pub mod mqtt;

/// Everything the manager needs to know about what happened on a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Broker accepted the session
    Connected,
    /// A submitted publish left the client and was assigned this packet id
    PublishSent { token: u16 },
    /// Broker confirmed delivery of the publish carrying this packet id
    DeliveryAck { token: u16 },
    /// Inbound application message
    Message { topic: String, payload: Vec<u8> },
    /// Broker answered a subscribe request
    SubscriptionAck { token: u16, rejected: bool },
    /// Broker closed the session
    Disconnected,
    /// Our own DISCONNECT reached the wire
    DisconnectSent,
    /// Keep-alives and other protocol chatter
    Other,
}

/// Failures reported by a link
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The request was refused before reaching the wire
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The network session failed
    #[error("connection error: {0}")]
    Connection(String),
    /// Waiting for the broker took longer than allowed
    #[error("timed out waiting for broker after {0:?}")]
    TimedOut(std::time::Duration),
    /// Event stream ended
    #[error("link closed")]
    Closed,
}

/// Submission side of one broker session. Every call is non-blocking.
pub trait BrokerLink: Send + Sync + 'static {
    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError>;
    fn try_subscribe(&self, filter: &str) -> Result<(), LinkError>;
    fn try_unsubscribe(&self, filter: &str) -> Result<(), LinkError>;
    fn try_disconnect(&self) -> Result<(), LinkError>;
}

/// Event side of one broker session
#[async_trait::async_trait]
pub trait LinkEvents: Send + 'static {
    /// Drive the session and return the next event.
    /// An error means the session is gone and must be replaced.
    async fn next_event(&mut self) -> Result<LinkEvent, LinkError>;
}

/// Factory for broker sessions; called once per connection attempt
pub trait Connector: Send + Sync + 'static {
    type Link: BrokerLink;
    type Events: LinkEvents;

    fn open(&self) -> Result<(Self::Link, Self::Events), mqtt::MqttError>;
}
