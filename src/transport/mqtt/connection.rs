//! Pure connection state management for the broker connection manager
//!
//! This module contains the lifecycle state machine, the transport error
//! type and the translation of configuration into rumqttc options.

use crate::config::{validate_client_id, MqttSection};
use crate::transport::LinkError;
use rumqttc::MqttOptions;
use thiserror::Error;

/// Lifecycle of one managed broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing has been created yet
    Uninitialized,
    /// Client handle exists, no connection attempted
    Created,
    /// First connection attempt in flight
    Connecting,
    /// Broker session established; publishing allowed
    Connected,
    /// Supervisor is retrying (attempt count)
    Reconnecting(u32),
    /// Teardown in progress
    TearingDown,
    /// Terminal; never left
    Terminated,
}

/// Inputs to the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ClientCreated,
    ConnectStarted,
    ConnAckReceived,
    ConnectionLost,
    ReconnectAttempt(u32),
    TeardownRequested,
    TeardownComplete,
}

impl ConnectionState {
    /// Compute the next state, rejecting moves the lifecycle does not allow
    pub fn transition(&self, event: ConnectionEvent) -> Result<ConnectionState, MqttError> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self, event) {
            (S::Terminated, _) => None,
            (S::Uninitialized, E::ClientCreated) => Some(S::Created),
            (S::Created, E::ConnectStarted) => Some(S::Connecting),
            (S::Connecting | S::Reconnecting(_), E::ConnAckReceived) => Some(S::Connected),
            (S::Connecting | S::Connected, E::ConnectionLost) => Some(S::Reconnecting(0)),
            (S::Reconnecting(_), E::ReconnectAttempt(attempt)) => Some(S::Reconnecting(attempt)),
            (S::Uninitialized | S::TearingDown, E::TeardownRequested) => None,
            (_, E::TeardownRequested) => Some(S::TearingDown),
            (S::TearingDown, E::TeardownComplete) => Some(S::Terminated),
            _ => None,
        };

        next.ok_or_else(|| MqttError::InvalidTransition {
            from: self.clone(),
            event,
        })
    }

    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn can_subscribe(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self,
            ConnectionState::TearingDown | ConnectionState::Terminated
        )
    }
}

/// Broker transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Failed to create client: {0}")]
    ClientCreate(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Subscription request failed")]
    SubscriptionFailed(#[source] LinkError),
    #[error("Invalid topic filter: {0}")]
    InvalidFilter(String),
    #[error("Invalid state transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },
}

/// Credentials resolved once at construction and reused by every attempt
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn from_config(config: &MqttSection) -> Option<Self> {
        config.username().map(|username| Credentials {
            username,
            password: config.password().unwrap_or_default(),
        })
    }
}

/// Pure function to configure rumqttc options for one connection attempt
pub fn configure_mqtt_options(
    config: &MqttSection,
    credentials: Option<&Credentials>,
) -> Result<MqttOptions, MqttError> {
    // rumqttc panics on client ids it does not like
    validate_client_id(&config.client_id).map_err(|e| MqttError::ClientCreate(e.to_string()))?;
    if config.host.trim().is_empty() {
        return Err(MqttError::ClientCreate("broker host is empty".to_string()));
    }

    let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
    mqtt_options.set_keep_alive(config.keep_alive());
    mqtt_options.set_clean_session(true);

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    Ok(mqtt_options)
}
