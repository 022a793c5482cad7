//! Broker connection manager
//!
//! Owns one logical broker session. A single event task drives the current
//! link's events, correlates delivery acknowledgements, dispatches inbound
//! messages and, when the session dies, runs the reconnect supervisor until a
//! fresh session is accepted. Publish and subscribe calls never block.

use super::connection::{ConnectionEvent, ConnectionState, MqttError};
use super::deliveries::{Completion, DeliveryError, DeliveryResult, DeliveryTable};
use super::message_handler::{validate_filter, MessageHandlerFn, SubscriptionTable};
use super::native::RumqttcConnector;
use super::supervisor::{self, ReconnectPolicy};
use crate::config::MqttSection;
use crate::shutdown::{Shutdown, ShutdownListener};
use crate::transport::{BrokerLink, Connector, LinkEvent, LinkEvents};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Extra time granted to the event task beyond the disconnect timeout
const JOIN_GRACE: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fire_all(completions: impl IntoIterator<Item = Completion>) {
    completions.into_iter().for_each(Completion::fire);
}

struct Session<L> {
    link: Option<Arc<L>>,
    deliveries: DeliveryTable,
}

/// State shared between the public handle and the event task
struct Shared<L> {
    client_id: String,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Session<L>>,
    subscriptions: Mutex<SubscriptionTable>,
}

impl<L: BrokerLink> Shared<L> {
    fn new(client_id: &str) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            client_id: client_id.to_string(),
            state_tx,
            session: Mutex::new(Session {
                link: None,
                deliveries: DeliveryTable::new(),
            }),
            subscriptions: Mutex::new(SubscriptionTable::new()),
        }
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Apply a lifecycle event; illegal moves are logged and leave the state alone
    fn apply(&self, event: ConnectionEvent) -> bool {
        self.state_tx
            .send_if_modified(|state| match state.transition(event) {
                Ok(next) => {
                    debug!(from = ?state, to = ?next, "Connection state change");
                    *state = next;
                    true
                }
                Err(e) => {
                    debug!("{e}");
                    false
                }
            })
    }

    fn current_link(&self) -> Option<Arc<L>> {
        lock(&self.session).link.clone()
    }

    fn install(&self, link: L) {
        lock(&self.session).link = Some(Arc::new(link));
    }

    fn release_link(&self) -> bool {
        lock(&self.session).link.take().is_some()
    }

    fn fail_all(&self, error: DeliveryError) {
        let completions = lock(&self.session).deliveries.fail_all(error);
        if !completions.is_empty() {
            warn!(count = completions.len(), "Failing unconfirmed publishes");
        }
        fire_all(completions);
    }

    /// Re-issue every subscription on the freshly installed session
    fn resubscribe(&self) {
        let subscriptions = lock(&self.subscriptions);
        let Some(link) = self.current_link() else {
            return;
        };
        for filter in subscriptions.filters() {
            match link.try_subscribe(&filter) {
                Ok(()) => debug!(filter = %filter, "Resubscribed"),
                Err(e) => warn!(filter = %filter, error = %e, "Failed to resubscribe"),
            }
        }
    }

    fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::PublishSent { token } => {
                let completion = lock(&self.session).deliveries.assign(token);
                fire_all(completion);
            }
            LinkEvent::DeliveryAck { token } => {
                let completion = lock(&self.session).deliveries.acknowledge(token);
                fire_all(completion);
            }
            LinkEvent::Message { topic, payload } => self.dispatch_message(&topic, &payload),
            LinkEvent::SubscriptionAck { token, rejected } => {
                if rejected {
                    warn!(token, "Broker rejected subscription");
                } else {
                    debug!(token, "Subscription confirmed");
                }
            }
            LinkEvent::Connected => debug!("Connection acknowledgement on a live session"),
            LinkEvent::Disconnected | LinkEvent::DisconnectSent | LinkEvent::Other => {}
        }
    }

    fn dispatch_message(&self, topic: &str, payload: &[u8]) {
        let handlers = lock(&self.subscriptions).handlers_for(topic);
        if handlers.is_empty() {
            debug!(topic, "No handler for inbound message");
            return;
        }
        for handler in handlers {
            handler(topic, payload);
        }
    }

    fn connection_lost(&self, reason: &str) {
        warn!(client_id = %self.client_id, reason, "Broker connection lost, reconnecting");
        self.apply(ConnectionEvent::ConnectionLost);
        self.release_link();
        self.fail_all(DeliveryError::ConnectionLost);
    }
}

/// Resilient connection to one MQTT broker
pub struct BrokerConnection<C: Connector = RumqttcConnector> {
    shared: Arc<Shared<C::Link>>,
    shutdown: Shutdown,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    policy: ReconnectPolicy,
}

impl BrokerConnection<RumqttcConnector> {
    /// Connect with rumqttc using the given configuration.
    ///
    /// Fails only if the client cannot be created. A broker that is down is
    /// not an error: the manager keeps retrying in the background.
    pub async fn connect(config: &MqttSection) -> Result<Self, MqttError> {
        let connector = RumqttcConnector::new(config)?;
        Self::connect_with(
            connector,
            &config.client_id,
            ReconnectPolicy::from_config(config),
        )
        .await
    }
}

impl<C: Connector> BrokerConnection<C> {
    /// Connect through an arbitrary connector
    pub async fn connect_with(
        connector: C,
        client_id: &str,
        policy: ReconnectPolicy,
    ) -> Result<Self, MqttError> {
        let shared = Arc::new(Shared::new(client_id));

        let (link, mut events) = connector.open()?;
        shared.apply(ConnectionEvent::ClientCreated);
        info!(client_id, "Broker client created");

        shared.apply(ConnectionEvent::ConnectStarted);
        let initial = match supervisor::await_connected(&mut events, policy.connect_timeout).await
        {
            Ok(()) => {
                shared.install(link);
                shared.apply(ConnectionEvent::ConnAckReceived);
                info!(client_id, "Connected to broker");
                Some(events)
            }
            Err(e) => {
                warn!(client_id, error = %e, "Initial connection failed, retrying in background");
                shared.apply(ConnectionEvent::ConnectionLost);
                None
            }
        };

        let (shutdown, listener) = Shutdown::new();
        let handle = tokio::spawn(
            run_event_loop(
                Arc::clone(&shared),
                connector,
                policy.clone(),
                initial,
                listener,
            )
            .instrument(crate::broker_span!(client_id)),
        );

        Ok(Self {
            shared,
            shutdown,
            event_loop_handle: Mutex::new(Some(handle)),
            policy,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().can_publish()
    }

    /// Publishes submitted but not yet resolved
    pub fn pending_deliveries(&self) -> usize {
        lock(&self.shared.session).deliveries.len()
    }

    /// Publish at QoS 1.
    ///
    /// Returns `NotConnected` without touching `on_delivery` unless the
    /// session is connected. Otherwise `on_delivery` is invoked exactly once:
    /// inline if the client refuses the request, later with the broker's
    /// acknowledgement, or with `ConnectionLost`/`ShutDown` if the session
    /// ends first.
    pub fn publish<F>(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        on_delivery: F,
    ) -> Result<(), MqttError>
    where
        F: FnOnce(DeliveryResult) + Send + 'static,
    {
        let state = self.state();
        if !state.can_publish() {
            debug!(topic, ?state, "Publish skipped while not connected");
            return Err(MqttError::NotConnected { state });
        }

        let refused = {
            let mut session = lock(&self.shared.session);
            let Some(link) = session.link.clone() else {
                return Err(MqttError::NotConnected { state });
            };
            match link.try_publish(topic, payload.into()) {
                Ok(()) => {
                    session.deliveries.submit(Box::new(on_delivery));
                    None
                }
                Err(e) => Some((on_delivery, e)),
            }
        };

        if let Some((on_delivery, e)) = refused {
            warn!(topic, error = %e, "Publish refused by client");
            on_delivery(Err(DeliveryError::Rejected(e.to_string())));
        }
        Ok(())
    }

    /// Publish and wait for the delivery outcome
    pub async fn publish_confirmed(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<DeliveryResult, MqttError> {
        let (tx, rx) = oneshot::channel();
        self.publish(topic, payload, move |result| {
            let _ = tx.send(result);
        })?;
        Ok(rx.await.unwrap_or(Err(DeliveryError::ShutDown)))
    }

    /// Route messages matching `filter` to `on_message`, replacing any
    /// handler already registered for the same filter
    pub fn subscribe<F>(&self, filter: &str, on_message: F) -> Result<(), MqttError>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        validate_filter(filter)?;
        let state = self.state();
        if !state.can_subscribe() {
            return Err(MqttError::NotConnected { state });
        }

        let mut subscriptions = lock(&self.shared.subscriptions);
        let link = self
            .shared
            .current_link()
            .ok_or(MqttError::NotConnected { state })?;
        link.try_subscribe(filter)
            .map_err(MqttError::SubscriptionFailed)?;

        let handler: MessageHandlerFn = Arc::new(on_message);
        if subscriptions.insert(filter, handler) {
            info!(filter, "Replaced subscription handler");
        } else {
            info!(filter, "Subscribed");
        }
        Ok(())
    }

    /// Stop routing `filter`. The handler is dropped even when disconnected,
    /// so the next session will not resubscribe it.
    pub fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        let mut subscriptions = lock(&self.shared.subscriptions);
        if !subscriptions.remove(filter) {
            debug!(filter, "Unsubscribe for unknown filter");
        }

        let state = self.state();
        if !state.can_subscribe() {
            return Err(MqttError::NotConnected { state });
        }
        let link = self
            .shared
            .current_link()
            .ok_or(MqttError::NotConnected { state })?;
        link.try_unsubscribe(filter)
            .map_err(MqttError::SubscriptionFailed)?;
        info!(filter, "Unsubscribed");
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.shared.subscriptions).filters()
    }

    /// Tear down the connection.
    ///
    /// Stops the reconnect supervisor, sends a DISCONNECT if a session is
    /// live, fails every unconfirmed publish with `ShutDown` and ends in
    /// `Terminated`. Later calls return immediately.
    pub async fn shutdown(&self) {
        if !self.shared.apply(ConnectionEvent::TeardownRequested) {
            debug!(client_id = %self.client_id(), "Shutdown already performed");
            return;
        }
        info!(client_id = %self.client_id(), "Shutting down broker connection");
        self.shutdown.request();

        let handle = lock(&self.event_loop_handle).take();
        if let Some(mut handle) = handle {
            let grace = self.policy.disconnect_timeout + JOIN_GRACE;
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!("Event task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event task didn't shut down in time, aborting");
                    handle.abort();
                }
            }
        }

        if self.shared.release_link() {
            debug!("Released broker client handle");
        }
        self.shared.fail_all(DeliveryError::ShutDown);
        self.shared.apply(ConnectionEvent::TeardownComplete);
        info!(client_id = %self.client_id(), "Broker connection terminated");
    }
}

impl<C: Connector> Drop for BrokerConnection<C> {
    fn drop(&mut self) {
        // Dropped without shutdown(): stop the task and keep the
        // one-callback-per-publish promise
        if let Some(handle) = lock(&self.event_loop_handle).take() {
            self.shutdown.request();
            handle.abort();
            self.shared.release_link();
            self.shared.fail_all(DeliveryError::ShutDown);
            debug!("Broker connection dropped without shutdown; event task aborted");
        }
    }
}

async fn run_event_loop<C: Connector>(
    shared: Arc<Shared<C::Link>>,
    connector: C,
    policy: ReconnectPolicy,
    mut events: Option<C::Events>,
    mut shutdown: ShutdownListener,
) {
    loop {
        let mut current = match events.take() {
            Some(current) => current,
            None => {
                let reconnected = supervisor::reconnect_until_connected(
                    &connector,
                    &policy,
                    &mut shutdown,
                    |attempt| {
                        shared.apply(ConnectionEvent::ReconnectAttempt(attempt));
                    },
                )
                .await;
                let Some((link, current)) = reconnected else {
                    break;
                };
                shared.install(link);
                shared.resubscribe();
                shared.apply(ConnectionEvent::ConnAckReceived);
                current
            }
        };

        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => {
                    graceful_disconnect(&shared, &mut current, policy.disconnect_timeout).await;
                    return;
                }
                event = current.next_event() => match event {
                    Ok(LinkEvent::Disconnected) => break "broker closed the session".to_string(),
                    Ok(event) => shared.handle_event(event),
                    Err(e) => break e.to_string(),
                },
            }
        };
        shared.connection_lost(&reason);
    }
    debug!("Broker event task exiting");
}

/// Send DISCONNECT and keep driving the session until it is flushed or `timeout` elapses
async fn graceful_disconnect<L: BrokerLink, E: LinkEvents>(
    shared: &Shared<L>,
    events: &mut E,
    timeout: Duration,
) {
    let Some(link) = shared.current_link() else {
        return;
    };
    if let Err(e) = link.try_disconnect() {
        warn!(error = %e, "Disconnect request failed");
        return;
    }

    let flushed = tokio::time::timeout(timeout, async {
        loop {
            match events.next_event().await {
                Ok(LinkEvent::DisconnectSent | LinkEvent::Disconnected) | Err(_) => break,
                Ok(event) => shared.handle_event(event),
            }
        }
    })
    .await;

    match flushed {
        Ok(()) => info!("Disconnected from broker"),
        Err(_) => warn!(?timeout, "Disconnect not confirmed before timeout"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockBroker;

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(200),
            disconnect_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let broker = MockBroker::new();
        let connection = BrokerConnection::connect_with(broker.connector(), "gw", fast_policy())
            .await
            .unwrap();

        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.client_id(), "gw");
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_not_fatal() {
        let broker = MockBroker::unreachable();
        let connection = BrokerConnection::connect_with(broker.connector(), "gw", fast_policy())
            .await
            .unwrap();

        assert!(matches!(
            connection.state(),
            ConnectionState::Reconnecting(_)
        ));
        connection.shutdown().await;
        assert_eq!(connection.state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn test_construction_failure_is_fatal() {
        let broker = MockBroker::new();
        broker.set_fail_open(true);
        let result = BrokerConnection::connect_with(broker.connector(), "gw", fast_policy()).await;
        assert!(matches!(result, Err(MqttError::ClientCreate(_))));
    }

    #[tokio::test]
    async fn test_subscribe_validates_filter() {
        let broker = MockBroker::new();
        let connection = BrokerConnection::connect_with(broker.connector(), "gw", fast_policy())
            .await
            .unwrap();

        let result = connection.subscribe("bad/#/filter", |_, _| {});
        assert!(matches!(result, Err(MqttError::InvalidFilter(_))));
        assert!(connection.subscriptions().is_empty());
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_fails_pending_deliveries() {
        let broker = MockBroker::new();
        broker.set_auto_ack(false);
        let connection = BrokerConnection::connect_with(broker.connector(), "gw", fast_policy())
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        connection
            .publish("out", b"x".to_vec(), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
        drop(connection);

        assert_eq!(rx.await.unwrap(), Err(DeliveryError::ShutDown));
    }
}
