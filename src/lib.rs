//! Repertory - resilient messaging adapters
//!
//! Two independent adapters that keep long-lived remote channels alive and
//! hide their failure modes from the application.
//!
//! # Overview
//!
//! - [`transport::mqtt::BrokerConnection`] holds one MQTT session, reconnects
//!   it on loss, re-issues subscriptions and reports the outcome of every
//!   publish exactly once.
//! - [`telegram::BotChannel`] long-polls the Bot API, confirms each batch of
//!   updates, dispatches bot commands to registered handlers and sends replies.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use repertory::config::RepertoryConfig;
//! use repertory::transport::mqtt::BrokerConnection;
//!
//! # async fn example() -> Result<(), repertory::RepertoryError> {
//! let config = RepertoryConfig::load_from_file(std::path::Path::new("repertory.toml"))?;
//! if let Some(mqtt) = &config.mqtt {
//!     let connection = BrokerConnection::connect(mqtt).await?;
//!     connection.publish(&mqtt.topic, "online", |result| {
//!         if let Err(e) = result {
//!             eprintln!("not delivered: {e}");
//!         }
//!     })?;
//!     connection.shutdown().await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod shutdown;
pub mod telegram;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, MqttSection, RepertoryConfig, TelegramSection};
pub use error::{RepertoryError, RepertoryResult};
pub use shutdown::{Shutdown, ShutdownListener};
pub use telegram::{BotChannel, BotHandle, BotStatus, CommandRegistry};
pub use transport::mqtt::{BrokerConnection, ConnectionState, DeliveryError};
