//! Resilient MQTT broker connection manager
//!
//! This module separates pure decisions from I/O so the state machine,
//! correlation table and routing can be tested without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Lifecycle state machine, errors and rumqttc options
//! - [`deliveries`] - Correlation of publishes with broker acknowledgements
//! - [`message_handler`] - Event routing and per-filter subscription map
//! - [`supervisor`] - Fixed-delay reconnect loop
//! - [`native`] - rumqttc-backed sessions
//! - [`client`] - The manager that ties them together
//!
//! # Usage
//!
//! ```rust,no_run
//! use repertory::config::MqttSection;
//! use repertory::transport::mqtt::BrokerConnection;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection::new("sensor-gw", "localhost", "sensors/out");
//! let connection = BrokerConnection::connect(&config).await?;
//!
//! connection.subscribe("sensors/in/#", |topic, payload| {
//!     println!("{topic}: {} bytes", payload.len());
//! })?;
//! connection.publish("sensors/out", "21.5", |result| {
//!     println!("delivery: {result:?}");
//! })?;
//!
//! connection.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod deliveries;
pub mod message_handler;
pub mod native;
pub mod supervisor;

pub use client::BrokerConnection;
pub use connection::{ConnectionEvent, ConnectionState, MqttError};
pub use deliveries::{DeliveryError, DeliveryResult, DeliveryTable};
pub use message_handler::{topic_matches, MessageHandler, MessageHandlerFn, SubscriptionTable};
pub use native::RumqttcConnector;
pub use supervisor::ReconnectPolicy;
