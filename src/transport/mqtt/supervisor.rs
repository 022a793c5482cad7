//! Reconnect supervision for the broker connection manager
//!
//! Decisions are pure functions; the retry loop itself only sequences
//! connector calls, connect confirmation and interruptible sleeps.

use crate::config::MqttSection;
use crate::shutdown::ShutdownListener;
use crate::transport::{Connector, LinkError, LinkEvent, LinkEvents};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing for connection attempts and teardown
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Fixed pause between failed attempts
    pub delay: Duration,
    /// How long one attempt may wait for the broker's acceptance
    pub connect_timeout: Duration,
    /// How long teardown waits for the DISCONNECT to be flushed
    pub disconnect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(2),
            disconnect_timeout: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &MqttSection) -> Self {
        Self {
            delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
            disconnect_timeout: config.disconnect_timeout(),
        }
    }
}

/// Outcome of deciding whether another attempt should be made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32 },
    AbortShutdownRequested,
}

/// Determine if reconnection should be attempted (pure function).
/// There is no attempt ceiling; only teardown stops the supervisor.
pub fn should_attempt_reconnection(
    current_attempts: u32,
    shutdown_requested: bool,
) -> ReconnectionDecision {
    if shutdown_requested {
        return ReconnectionDecision::AbortShutdownRequested;
    }
    ReconnectionDecision::Proceed {
        attempt: current_attempts.saturating_add(1),
    }
}

/// Drive a fresh session until the broker accepts it or `timeout` elapses
pub async fn await_connected<E: LinkEvents>(
    events: &mut E,
    timeout: Duration,
) -> Result<(), LinkError> {
    let confirmation = async {
        loop {
            match events.next_event().await? {
                LinkEvent::Connected => return Ok(()),
                LinkEvent::Disconnected => {
                    return Err(LinkError::Connection(
                        "broker closed the session before accepting it".to_string(),
                    ))
                }
                other => debug!("Event before connection acknowledgement: {other:?}"),
            }
        }
    };

    tokio::time::timeout(timeout, confirmation)
        .await
        .map_err(|_| LinkError::TimedOut(timeout))?
}

/// Retry with a fixed delay until a session is accepted or teardown is requested.
///
/// Every attempt opens a brand-new session; a failed session is dropped
/// before the next one is opened. `on_attempt` observes each attempt number.
pub async fn reconnect_until_connected<C, F>(
    connector: &C,
    policy: &ReconnectPolicy,
    shutdown: &mut ShutdownListener,
    mut on_attempt: F,
) -> Option<(C::Link, C::Events)>
where
    C: Connector,
    F: FnMut(u32),
{
    let mut attempts = 0;

    loop {
        match should_attempt_reconnection(attempts, shutdown.is_requested()) {
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Reconnect supervisor stopping: teardown requested");
                return None;
            }
            ReconnectionDecision::Proceed { attempt } => {
                attempts = attempt;
                on_attempt(attempt);
            }
        }

        match connector.open() {
            Ok((link, mut events)) => {
                let outcome = tokio::select! {
                    _ = shutdown.requested() => return None,
                    outcome = await_connected(&mut events, policy.connect_timeout) => outcome,
                };
                match outcome {
                    Ok(()) => {
                        info!(attempt = attempts, "Broker session re-established");
                        return Some((link, events));
                    }
                    Err(e) => warn!(attempt = attempts, error = %e, "Reconnect attempt failed"),
                }
            }
            Err(e) => warn!(attempt = attempts, error = %e, "Could not create broker session"),
        }

        if !shutdown.sleep(policy.delay).await {
            info!("Reconnect supervisor stopping: teardown requested");
            return None;
        }
    }
}
