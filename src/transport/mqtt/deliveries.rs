//! Delivery correlation for publishes
//!
//! A publish is known to the manager in three phases: submitted (handed to
//! the link, no packet id yet), pending (packet id assigned, waiting for the
//! broker's acknowledgement) and resolved. The packet id only becomes known
//! after submission, and the acknowledgement can in principle be observed
//! before the id assignment, so the table keeps an early-ack placeholder for
//! that case.
//!
//! The table never invokes callbacks itself. Every operation that resolves a
//! delivery returns a [`Completion`] which the caller fires after releasing
//! whatever lock guards the table.

use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

/// Generic client failure code
pub const CODE_REJECTED: i32 = -1;
/// Session dropped before acknowledgement
pub const CODE_CONNECTION_LOST: i32 = -3;
/// Manager torn down before acknowledgement
pub const CODE_SHUT_DOWN: i32 = -4;
/// Packet id handed out again while the old delivery was unresolved
pub const CODE_TOKEN_REUSED: i32 = -5;

/// Why a publish was not confirmed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("publish rejected by client: {0}")]
    Rejected(String),
    #[error("connection lost before delivery was confirmed")]
    ConnectionLost,
    #[error("connection shut down before delivery was confirmed")]
    ShutDown,
    #[error("packet id {0} reused while delivery was unresolved")]
    TokenReused(u16),
}

impl DeliveryError {
    /// Numeric code handed to completion callbacks
    pub fn code(&self) -> i32 {
        match self {
            DeliveryError::Rejected(_) => CODE_REJECTED,
            DeliveryError::ConnectionLost => CODE_CONNECTION_LOST,
            DeliveryError::ShutDown => CODE_SHUT_DOWN,
            DeliveryError::TokenReused(_) => CODE_TOKEN_REUSED,
        }
    }
}

pub type DeliveryResult = Result<(), DeliveryError>;

/// Completion callback for one publish; invoked exactly once
pub type OnDelivery = Box<dyn FnOnce(DeliveryResult) + Send + 'static>;

/// A resolved delivery, ready to be reported
#[must_use = "a completion does nothing until fired"]
pub struct Completion {
    on_delivery: OnDelivery,
    result: DeliveryResult,
}

impl Completion {
    pub fn new(on_delivery: OnDelivery, result: DeliveryResult) -> Self {
        Self {
            on_delivery,
            result,
        }
    }

    pub fn result(&self) -> &DeliveryResult {
        &self.result
    }

    pub fn fire(self) {
        (self.on_delivery)(self.result)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

enum Slot {
    Pending(OnDelivery),
    /// Acknowledgement seen before the id was assigned
    EarlyAck,
}

/// Correlation table keyed by broker packet id
#[derive(Default)]
pub struct DeliveryTable {
    submitted: VecDeque<OnDelivery>,
    in_flight: HashMap<u16, Slot>,
}

impl DeliveryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a publish accepted by the link. Ids are assigned in submission order.
    pub fn submit(&mut self, on_delivery: OnDelivery) {
        self.submitted.push_back(on_delivery);
    }

    /// Bind the oldest submitted publish to the packet id the client assigned
    pub fn assign(&mut self, token: u16) -> Option<Completion> {
        let Some(on_delivery) = self.submitted.pop_front() else {
            debug!(token, "Packet id assigned to an untracked publish");
            return None;
        };

        match self.in_flight.remove(&token) {
            Some(Slot::EarlyAck) => {
                debug!(token, "Resolving publish from early acknowledgement");
                Some(Completion::new(on_delivery, Ok(())))
            }
            Some(Slot::Pending(stale)) => {
                warn!(token, "Packet id reused while previous delivery was unresolved");
                self.in_flight.insert(token, Slot::Pending(on_delivery));
                Some(Completion::new(stale, Err(DeliveryError::TokenReused(token))))
            }
            None => {
                self.in_flight.insert(token, Slot::Pending(on_delivery));
                None
            }
        }
    }

    /// Resolve the publish carrying `token`, or remember the ack if it is early
    pub fn acknowledge(&mut self, token: u16) -> Option<Completion> {
        match self.in_flight.remove(&token) {
            Some(Slot::Pending(on_delivery)) => Some(Completion::new(on_delivery, Ok(()))),
            Some(Slot::EarlyAck) => {
                debug!(token, "Duplicate acknowledgement ignored");
                self.in_flight.insert(token, Slot::EarlyAck);
                None
            }
            None => {
                self.in_flight.insert(token, Slot::EarlyAck);
                None
            }
        }
    }

    /// Fail every unresolved publish and forget all placeholders
    pub fn fail_all(&mut self, error: DeliveryError) -> Vec<Completion> {
        let submitted = self.submitted.drain(..);
        let pending = self.in_flight.drain().filter_map(|(_, slot)| match slot {
            Slot::Pending(on_delivery) => Some(on_delivery),
            Slot::EarlyAck => None,
        });

        submitted
            .chain(pending)
            .map(|on_delivery| Completion::new(on_delivery, Err(error.clone())))
            .collect()
    }

    /// Unresolved publishes, placeholders excluded
    pub fn len(&self) -> usize {
        self.submitted.len()
            + self
                .in_flight
                .values()
                .filter(|slot| matches!(slot, Slot::Pending(_)))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn placeholders(&self) -> usize {
        self.in_flight
            .values()
            .filter(|slot| matches!(slot, Slot::EarlyAck))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(&'static str, DeliveryResult)>>>;

    fn recorder(log: &Log, name: &'static str) -> OnDelivery {
        let log = Arc::clone(log);
        Box::new(move |result| log.lock().unwrap().push((name, result)))
    }

    fn fire_all(completions: impl IntoIterator<Item = Completion>) {
        completions.into_iter().for_each(Completion::fire);
    }

    #[test]
    fn test_submit_assign_acknowledge() {
        let log = Log::default();
        let mut table = DeliveryTable::new();

        table.submit(recorder(&log, "a"));
        assert_eq!(table.len(), 1);
        assert!(table.assign(7).is_none());
        assert_eq!(table.len(), 1);

        fire_all(table.acknowledge(7));
        assert!(table.is_empty());
        assert_eq!(*log.lock().unwrap(), vec![("a", Ok(()))]);
    }

    #[test]
    fn test_ids_assigned_in_submission_order() {
        let log = Log::default();
        let mut table = DeliveryTable::new();
        table.submit(recorder(&log, "first"));
        table.submit(recorder(&log, "second"));

        assert!(table.assign(1).is_none());
        assert!(table.assign(2).is_none());
        fire_all(table.acknowledge(2));
        fire_all(table.acknowledge(1));

        assert_eq!(
            *log.lock().unwrap(),
            vec![("second", Ok(())), ("first", Ok(()))]
        );
    }

    #[test]
    fn test_early_ack_resolved_on_assignment() {
        let log = Log::default();
        let mut table = DeliveryTable::new();
        table.submit(recorder(&log, "early"));

        assert!(table.acknowledge(9).is_none());
        assert_eq!(table.placeholders(), 1);
        assert_eq!(table.len(), 1);

        fire_all(table.assign(9));
        assert!(table.is_empty());
        assert_eq!(table.placeholders(), 0);
        assert_eq!(*log.lock().unwrap(), vec![("early", Ok(()))]);
    }

    #[test]
    fn test_reused_token_fails_stale_entry() {
        let log = Log::default();
        let mut table = DeliveryTable::new();
        table.submit(recorder(&log, "stale"));
        table.submit(recorder(&log, "fresh"));

        assert!(table.assign(3).is_none());
        fire_all(table.assign(3));
        assert_eq!(
            *log.lock().unwrap(),
            vec![("stale", Err(DeliveryError::TokenReused(3)))]
        );

        fire_all(table.acknowledge(3));
        assert_eq!(log.lock().unwrap()[1], ("fresh", Ok(())));
        assert!(table.is_empty());
    }

    #[test]
    fn test_fail_all_reports_each_delivery_once() {
        let log = Log::default();
        let mut table = DeliveryTable::new();
        table.submit(recorder(&log, "pending"));
        table.submit(recorder(&log, "submitted"));
        assert!(table.assign(1).is_none());
        assert!(table.acknowledge(50).is_none());

        let completions = table.fail_all(DeliveryError::ConnectionLost);
        assert_eq!(completions.len(), 2);
        assert!(completions
            .iter()
            .all(|c| c.result() == &Err(DeliveryError::ConnectionLost)));
        fire_all(completions);

        assert!(table.is_empty());
        assert_eq!(table.placeholders(), 0);
        assert!(table.fail_all(DeliveryError::ShutDown).is_empty());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_assign_without_submission_is_ignored() {
        let mut table = DeliveryTable::new();
        assert!(table.assign(4).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DeliveryError::Rejected("x".into()).code(), CODE_REJECTED);
        assert_eq!(DeliveryError::ConnectionLost.code(), CODE_CONNECTION_LOST);
        assert_eq!(DeliveryError::ShutDown.code(), CODE_SHUT_DOWN);
        assert_eq!(DeliveryError::TokenReused(1).code(), CODE_TOKEN_REUSED);
    }
}
