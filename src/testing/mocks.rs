//! Mock implementations for testing
//!
//! Provides an in-memory broker behind the [`Connector`] seam and a scripted
//! Bot API session behind [`RequestSession`], so both adapters can be driven
//! without a network.

use crate::telegram::session::{HttpVerb, RequestSession, SessionError};
use crate::telegram::types::GET_UPDATES;
use crate::transport::mqtt::MqttError;
use crate::transport::{BrokerLink, Connector, LinkError, LinkEvent, LinkEvents};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

pub type PublishedMessage = (String, Vec<u8>);

type EventSender = mpsc::UnboundedSender<Result<LinkEvent, LinkError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct BrokerInner {
    reachable: bool,
    silent: bool,
    fail_open: bool,
    reject_publishes: bool,
    auto_ack: bool,
    next_token: u16,
    sessions_opened: u32,
    disconnects: u32,
    published: Vec<PublishedMessage>,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    live: Option<EventSender>,
}

impl BrokerInner {
    fn take_token(&mut self) -> u16 {
        let token = self.next_token;
        self.next_token = match self.next_token.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        token
    }
}

/// In-memory broker shared between a test and the sessions it hands out
#[derive(Debug, Clone)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Reachable broker that acknowledges every publish
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                reachable: true,
                silent: false,
                fail_open: false,
                reject_publishes: false,
                auto_ack: true,
                next_token: 1,
                sessions_opened: 0,
                disconnects: 0,
                published: Vec::new(),
                subscribed: Vec::new(),
                unsubscribed: Vec::new(),
                live: None,
            })),
        }
    }

    /// Broker that refuses every session until made reachable
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.set_reachable(false);
        broker
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.inner).reachable = reachable;
    }

    /// New sessions neither accept nor refuse; the connect wait runs out
    pub fn set_silent(&self, silent: bool) {
        lock(&self.inner).silent = silent;
    }

    /// Session construction itself fails
    pub fn set_fail_open(&self, fail_open: bool) {
        lock(&self.inner).fail_open = fail_open;
    }

    /// Publishes are refused before reaching the wire
    pub fn set_reject_publishes(&self, reject: bool) {
        lock(&self.inner).reject_publishes = reject;
    }

    /// When off, publishes get a packet id but no acknowledgement until [`MockBroker::ack`]
    pub fn set_auto_ack(&self, auto_ack: bool) {
        lock(&self.inner).auto_ack = auto_ack;
    }

    /// Force the packet id handed to the next publish
    pub fn set_next_token(&self, token: u16) {
        lock(&self.inner).next_token = token;
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    /// Inject an event into the current session; false if there is none
    pub fn inject(&self, event: Result<LinkEvent, LinkError>) -> bool {
        match lock(&self.inner).live.as_ref() {
            Some(live) => live.send(event).is_ok(),
            None => false,
        }
    }

    /// Acknowledge delivery of the publish carrying `token`
    pub fn ack(&self, token: u16) -> bool {
        self.inject(Ok(LinkEvent::DeliveryAck { token }))
    }

    /// Deliver an inbound application message
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        self.inject(Ok(LinkEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }))
    }

    /// Kill the current session from the network side
    pub fn drop_connection(&self) -> bool {
        let live = lock(&self.inner).live.take();
        match live {
            Some(live) => live
                .send(Err(LinkError::Connection("connection reset by peer".into())))
                .is_ok(),
            None => false,
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.inner).published.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.inner).subscribed.clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        lock(&self.inner).unsubscribed.clone()
    }

    pub fn sessions_opened(&self) -> u32 {
        lock(&self.inner).sessions_opened
    }

    pub fn disconnects(&self) -> u32 {
        lock(&self.inner).disconnects
    }
}

/// Opens one fresh in-memory session per call
#[derive(Debug, Clone)]
pub struct MockConnector {
    broker: MockBroker,
}

impl Connector for MockConnector {
    type Link = MockLink;
    type Events = MockEvents;

    fn open(&self) -> Result<(MockLink, MockEvents), MqttError> {
        let mut inner = lock(&self.broker.inner);
        if inner.fail_open {
            return Err(MqttError::ClientCreate("mock client refused".into()));
        }
        inner.sessions_opened += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        if !inner.reachable {
            let _ = tx.send(Err(LinkError::Connection("connection refused".into())));
        } else if !inner.silent {
            let _ = tx.send(Ok(LinkEvent::Connected));
        }
        inner.live = Some(tx.clone());

        Ok((
            MockLink {
                broker: self.broker.clone(),
                events: tx,
            },
            MockEvents { rx },
        ))
    }
}

/// Submission side of a mock session
#[derive(Debug)]
pub struct MockLink {
    broker: MockBroker,
    events: EventSender,
}

impl MockLink {
    fn emit(&self, event: LinkEvent) -> Result<(), LinkError> {
        self.events
            .send(Ok(event))
            .map_err(|_| LinkError::Connection("session closed".into()))
    }
}

impl BrokerLink for MockLink {
    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        let (token, auto_ack) = {
            let mut inner = lock(&self.broker.inner);
            if inner.reject_publishes {
                return Err(LinkError::Rejected("request queue full".into()));
            }
            inner.published.push((topic.to_string(), payload));
            (inner.take_token(), inner.auto_ack)
        };

        self.emit(LinkEvent::PublishSent { token })?;
        if auto_ack {
            self.emit(LinkEvent::DeliveryAck { token })?;
        }
        Ok(())
    }

    fn try_subscribe(&self, filter: &str) -> Result<(), LinkError> {
        let token = {
            let mut inner = lock(&self.broker.inner);
            inner.subscribed.push(filter.to_string());
            inner.take_token()
        };
        self.emit(LinkEvent::SubscriptionAck {
            token,
            rejected: false,
        })
    }

    fn try_unsubscribe(&self, filter: &str) -> Result<(), LinkError> {
        lock(&self.broker.inner)
            .unsubscribed
            .push(filter.to_string());
        Ok(())
    }

    fn try_disconnect(&self) -> Result<(), LinkError> {
        lock(&self.broker.inner).disconnects += 1;
        self.emit(LinkEvent::DisconnectSent)
    }
}

/// Event side of a mock session
#[derive(Debug)]
pub struct MockEvents {
    rx: mpsc::UnboundedReceiver<Result<LinkEvent, LinkError>>,
}

#[async_trait]
impl LinkEvents for MockEvents {
    async fn next_event(&mut self) -> Result<LinkEvent, LinkError> {
        self.rx.recv().await.unwrap_or(Err(LinkError::Closed))
    }
}

/// One request seen by [`MockSession`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub verb: HttpVerb,
    pub method: String,
    pub body: Value,
}

#[derive(Debug, Default)]
struct SessionInner {
    polls: VecDeque<Result<String, SessionError>>,
    requests: Vec<RecordedRequest>,
    request_delay: Duration,
}

/// Scripted Bot API session.
///
/// getUpdates answers from a queue of scripted responses and otherwise waits,
/// like a long poll with nothing to report. Every other method succeeds, after
/// the configured delay; it is recorded only once it has completed.
#[derive(Debug, Clone, Default)]
pub struct MockSession {
    inner: Arc<Mutex<SessionInner>>,
}

const POLL_CHECK_INTERVAL: Duration = Duration::from_millis(5);

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_poll_response(&self, response: Result<String, SessionError>) {
        lock(&self.inner).polls.push_back(response);
    }

    /// Delay every method other than getUpdates
    pub fn set_request_delay(&self, delay: Duration) {
        lock(&self.inner).request_delay = delay;
    }

    /// Queue a successful getUpdates batch
    pub fn push_updates(&self, updates: Value) {
        let body = serde_json::json!({ "ok": true, "result": updates });
        self.push_poll_response(Ok(body.to_string()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.inner).requests.clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<RecordedRequest> {
        lock(&self.inner)
            .requests
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    /// Wait until `count` requests for `method` were seen; returns them, or
    /// whatever arrived when `timeout` ran out
    pub async fn wait_for_requests(
        &self,
        method: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<RecordedRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let seen = self.requests_for(method);
            if seen.len() >= count || tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(POLL_CHECK_INTERVAL).await;
        }
    }
}

#[async_trait]
impl RequestSession for MockSession {
    async fn request(
        &self,
        verb: HttpVerb,
        method: &str,
        body: String,
    ) -> Result<String, SessionError> {
        let recorded = RecordedRequest {
            verb,
            method: method.to_string(),
            body: serde_json::from_str(&body).unwrap_or(Value::Null),
        };

        if method != GET_UPDATES {
            let delay = lock(&self.inner).request_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            lock(&self.inner).requests.push(recorded);
            return Ok(r#"{"ok":true,"result":true}"#.to_string());
        }

        lock(&self.inner).requests.push(recorded);
        loop {
            if let Some(response) = lock(&self.inner).polls.pop_front() {
                return response;
            }
            tokio::time::sleep(POLL_CHECK_INTERVAL).await;
        }
    }
}
