//! Pure event routing and subscription matching
//!
//! Translates rumqttc events into [`LinkEvent`]s and keeps the per-filter
//! handler map used to dispatch inbound messages.

use super::connection::MqttError;
use crate::transport::LinkEvent;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Callback for inbound messages on a subscribed filter
pub type MessageHandlerFn = Arc<dyn Fn(&str, &[u8]) + Send + Sync + 'static>;

/// Pure routing decisions for rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    /// Route a rumqttc event to the manager's vocabulary (pure function)
    pub fn route_mqtt_event(event: &Event) -> LinkEvent {
        match event {
            Event::Incoming(packet) => match packet {
                Packet::ConnAck(_) => LinkEvent::Connected,
                Packet::PubAck(ack) => LinkEvent::DeliveryAck { token: ack.pkid },
                Packet::Publish(publish) => LinkEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Packet::SubAck(suback) => LinkEvent::SubscriptionAck {
                    token: suback.pkid,
                    rejected: suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure)),
                },
                Packet::Disconnect { .. } => LinkEvent::Disconnected,
                other => {
                    trace!("Incoming protocol packet: {other:?}");
                    LinkEvent::Other
                }
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => LinkEvent::PublishSent { token: *pkid },
                Outgoing::Disconnect { .. } => LinkEvent::DisconnectSent,
                _ => LinkEvent::Other,
            },
        }
    }
}

/// Per-filter handler map; replayed onto every new broker session
#[derive(Default, Clone)]
pub struct SubscriptionTable {
    handlers: BTreeMap<String, MessageHandlerFn>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for `filter`. Returns true if it replaced one.
    pub fn insert(&mut self, filter: &str, handler: MessageHandlerFn) -> bool {
        self.handlers.insert(filter.to_string(), handler).is_some()
    }

    pub fn remove(&mut self, filter: &str) -> bool {
        self.handlers.remove(filter).is_some()
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.handlers.contains_key(filter)
    }

    pub fn filters(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Every handler whose filter matches `topic`
    pub fn handlers_for(&self, topic: &str) -> Vec<MessageHandlerFn> {
        self.handlers
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// MQTT filter matching with `+` (one level) and `#` (remaining levels).
/// Wildcards at the first level never match `$`-prefixed system topics.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check that a subscription filter is well formed
pub fn validate_filter(filter: &str) -> Result<(), MqttError> {
    if filter.is_empty() {
        return Err(MqttError::InvalidFilter("filter is empty".to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(MqttError::InvalidFilter(format!(
                "'{filter}': '#' must be the whole last level"
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(MqttError::InvalidFilter(format!(
                "'{filter}': '+' must occupy a whole level"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish, QoS, SubAck};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(MessageHandler::route_mqtt_event(&event), LinkEvent::Connected);
    }

    #[test]
    fn test_route_publish_lifecycle() {
        let sent = Event::Outgoing(Outgoing::Publish(12));
        assert_eq!(
            MessageHandler::route_mqtt_event(&sent),
            LinkEvent::PublishSent { token: 12 }
        );

        let acked = Event::Incoming(Packet::PubAck(PubAck { pkid: 12 }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&acked),
            LinkEvent::DeliveryAck { token: 12 }
        );
    }

    #[test]
    fn test_route_inbound_message() {
        let publish = Publish::new("sensors/kitchen/temp", QoS::AtLeastOnce, b"21.5".to_vec());
        let routed = MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Publish(publish)));
        assert_eq!(
            routed,
            LinkEvent::Message {
                topic: "sensors/kitchen/temp".to_string(),
                payload: b"21.5".to_vec(),
            }
        );
    }

    #[test]
    fn test_route_rejected_suback() {
        let suback = SubAck::new(
            4,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::SubAck(suback))),
            LinkEvent::SubscriptionAck {
                token: 4,
                rejected: true
            }
        );
    }

    #[test]
    fn test_route_keepalive_is_other() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            LinkEvent::Other
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            LinkEvent::Other
        );
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("home/kitchen/temp", "home/kitchen/temp"));
        assert!(topic_matches("home/+/temp", "home/kitchen/temp"));
        assert!(topic_matches("home/#", "home/kitchen/temp"));
        assert!(topic_matches("home/#", "home"));
        assert!(topic_matches("#", "anything/at/all"));

        assert!(!topic_matches("home/+/temp", "home/kitchen/humidity"));
        assert!(!topic_matches("home/+", "home/kitchen/temp"));
        assert!(!topic_matches("home/kitchen", "home"));
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("home/+/temp").is_ok());
        assert!(validate_filter("home/#").is_ok());
        assert!(validate_filter("#").is_ok());

        assert!(validate_filter("").is_err());
        assert!(validate_filter("home/#/temp").is_err());
        assert!(validate_filter("home/kit#").is_err());
        assert!(validate_filter("home/kit+chen").is_err());
    }

    #[test]
    fn test_subscription_table_dispatch() {
        let mut table = SubscriptionTable::new();
        let noop: MessageHandlerFn = Arc::new(|_, _| {});

        assert!(!table.insert("home/+/temp", Arc::clone(&noop)));
        assert!(!table.insert("home/#", Arc::clone(&noop)));
        assert!(table.insert("home/#", Arc::clone(&noop)));
        assert_eq!(table.len(), 2);

        assert_eq!(table.handlers_for("home/kitchen/temp").len(), 2);
        assert_eq!(table.handlers_for("home/door").len(), 1);
        assert!(table.handlers_for("garage/door").is_empty());

        assert!(table.remove("home/#"));
        assert!(!table.remove("home/#"));
        assert_eq!(table.filters(), vec!["home/+/temp".to_string()]);
    }
}
