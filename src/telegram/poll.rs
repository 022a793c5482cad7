//! Pure long-poll logic: cursor, backoff, failure policy and command extraction

use super::registry::CommandInvocation;
use super::session::SessionError;
use super::types::{ApiResponse, Message, Update};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Recently consumed update ids.
///
/// Only exact repeats are refused. The remote side may restart numbering below
/// ids seen earlier, so no ordering between batches is assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollCursor {
    recent: VecDeque<u64>,
    capacity: usize,
}

impl Default for PollCursor {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CURSOR_CAPACITY)
    }
}

/// Twice the largest batch getUpdates hands out
const DEFAULT_CURSOR_CAPACITY: usize = 200;

impl PollCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Accept `update_id` unless it was consumed recently
    pub fn accept(&mut self, update_id: u64) -> bool {
        if self.recent.contains(&update_id) {
            return false;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(update_id);
        true
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.recent.back().copied()
    }
}

/// Offset confirming a batch: one past its highest id, or 0 for an empty batch
pub fn batch_offset(highest_id: Option<u64>) -> u64 {
    highest_id.map_or(0, |id| id.saturating_add(1))
}

/// Stepped backoff for failing polls
#[derive(Debug, Clone)]
pub struct PollBackoff {
    /// Delays in milliseconds for consecutive failures
    pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    sustained_delay: u64,
    failures: u32,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            pattern: vec![0, 250, 1000, 2000, 5000],
            sustained_delay: 10_000,
            failures: 0,
        }
    }
}

impl PollBackoff {
    pub fn with_pattern(pattern: Vec<u64>, sustained_delay: u64) -> Self {
        Self {
            pattern,
            sustained_delay,
            failures: 0,
        }
    }

    /// Delay for the given 1-based consecutive failure count (pure function)
    pub fn calculate_backoff_delay(&self, failure: u32) -> u64 {
        let index = failure.saturating_sub(1) as usize;
        self.pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Record a failure and return how long to wait before the next poll
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        Duration::from_millis(self.calculate_backoff_delay(self.failures))
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// What to do after a poll finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollDecision {
    /// Issue the next poll with `offset` after `delay`
    Resubmit { offset: u64, delay: Duration },
    /// Stop polling for good
    Halt(String),
}

impl PollDecision {
    fn retry(delay: Duration) -> Self {
        PollDecision::Resubmit {
            offset: 0,
            delay,
        }
    }
}

/// Error envelope returned by the remote side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiFailure {
    pub error_code: Option<i64>,
    pub description: String,
    pub retry_after: Option<u64>,
}

impl ApiFailure {
    /// Parse an error body; bodies that are not an envelope keep their text
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<ApiResponse<serde_json::Value>>(body) {
            Ok(envelope) => Self {
                error_code: envelope.error_code,
                retry_after: envelope.retry_after(),
                description: envelope.description.unwrap_or_default(),
            },
            Err(_) => Self {
                description: body.to_string(),
                ..Self::default()
            },
        }
    }
}

/// Decide how to continue after a remote error (pure apart from the backoff counter)
pub fn classify_api_failure(
    status: Option<u16>,
    failure: &ApiFailure,
    backoff: &mut PollBackoff,
) -> PollDecision {
    let code = failure
        .error_code
        .or(status.map(i64::from))
        .unwrap_or_default();

    match code {
        401 | 404 => PollDecision::Halt(format!(
            "access token rejected ({code}): {}",
            failure.description
        )),
        429 => {
            let delay = failure
                .retry_after
                .map(Duration::from_secs)
                .unwrap_or_else(|| backoff.next_delay());
            PollDecision::retry(delay)
        }
        _ => PollDecision::retry(backoff.next_delay()),
    }
}

/// Decide how to continue after a failed poll
pub fn classify_failure(error: &SessionError, backoff: &mut PollBackoff) -> PollDecision {
    match error {
        // The server-side wait simply ran out
        SessionError::TimedOut => PollDecision::retry(Duration::ZERO),
        SessionError::Status { status, body } => {
            classify_api_failure(Some(*status), &ApiFailure::from_body(body), backoff)
        }
        SessionError::Resolve(_)
        | SessionError::NoRoute(_)
        | SessionError::Connect(_)
        | SessionError::Request(_) => PollDecision::retry(backoff.next_delay()),
    }
}

/// One element of a decoded batch
#[derive(Debug, Clone)]
pub enum DecodedUpdate {
    Update(Box<Update>),
    /// Could not be decoded; the id is kept when readable so the cursor can skip it
    Malformed {
        update_id: Option<u64>,
        error: String,
    },
}

#[derive(Debug)]
pub enum BatchError {
    Json(serde_json::Error),
    Api(ApiFailure),
}

/// Decode a getUpdates body, isolating undecodable updates
pub fn decode_batch(body: &str) -> Result<Vec<DecodedUpdate>, BatchError> {
    let envelope: ApiResponse<Vec<serde_json::Value>> =
        serde_json::from_str(body).map_err(BatchError::Json)?;

    if !envelope.ok {
        return Err(BatchError::Api(ApiFailure {
            error_code: envelope.error_code,
            retry_after: envelope.retry_after(),
            description: envelope.description.unwrap_or_default(),
        }));
    }

    let updates = envelope
        .result
        .unwrap_or_default()
        .into_iter()
        .map(|value| {
            let update_id = value.get("update_id").and_then(serde_json::Value::as_u64);
            match serde_json::from_value::<Update>(value) {
                Ok(update) => DecodedUpdate::Update(Box::new(update)),
                Err(e) => DecodedUpdate::Malformed {
                    update_id,
                    error: e.to_string(),
                },
            }
        })
        .collect();
    Ok(updates)
}

/// Map a UTF-16 code unit range onto byte indices of `text`
fn utf16_range(text: &str, offset: usize, length: usize) -> Option<(usize, usize)> {
    let end_units = offset.checked_add(length)?;
    let mut units = 0;
    let mut start = None;

    for (byte_index, ch) in text.char_indices() {
        if units == offset {
            start = Some(byte_index);
        }
        if units == end_units {
            return start.map(|s| (s, byte_index));
        }
        units += ch.len_utf16();
    }

    if units == offset {
        start = Some(text.len());
    }
    if units == end_units {
        return start.map(|s| (s, text.len()));
    }
    None
}

/// Extract every `bot_command` entity of a message as an invocation.
///
/// Arguments are the text between the end of the command token and the next
/// command (or the end of the message), trimmed.
pub fn extract_commands(message: &Message, update_id: u64) -> Vec<CommandInvocation> {
    let Some(text) = message.text.as_deref() else {
        return Vec::new();
    };

    let mut spans = Vec::new();
    for entity in &message.entities {
        let Some((start, end)) = utf16_range(text, entity.offset, entity.length) else {
            warn!(
                kind = %entity.kind,
                offset = entity.offset,
                length = entity.length,
                "Entity outside message text"
            );
            continue;
        };
        if entity.kind == "bot_command" {
            spans.push((start, end));
        } else {
            debug!(kind = %entity.kind, text = &text[start..end], "Other entity");
        }
    }
    spans.sort_unstable();

    spans
        .iter()
        .enumerate()
        .filter_map(|(index, &(start, end))| {
            let token = text[start..end].strip_prefix('/')?;
            let command = token.split('@').next().unwrap_or(token);
            if command.is_empty() {
                return None;
            }
            let args_end = spans.get(index + 1).map_or(text.len(), |next| next.0);
            let args = text.get(end..args_end.max(end)).unwrap_or("").trim();

            Some(CommandInvocation {
                command: command.to_string(),
                args: args.to_string(),
                chat_id: message.chat.id,
                update_id,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::types::{Chat, MessageEntity};
    use proptest::prelude::*;

    fn message(text: &str, entities: Vec<(&str, usize, usize)>) -> Message {
        Message {
            message_id: 1,
            from: None,
            chat: Chat {
                id: 77,
                kind: "private".to_string(),
                first_name: None,
                last_name: None,
                username: None,
            },
            date: 0,
            text: Some(text.to_string()),
            entities: entities
                .into_iter()
                .map(|(kind, offset, length)| MessageEntity {
                    kind: kind.to_string(),
                    offset,
                    length,
                })
                .collect(),
        }
    }

    #[test]
    fn test_cursor_refuses_only_repeats() {
        let mut cursor = PollCursor::new();
        assert!(cursor.accept(10));
        assert!(!cursor.accept(10));
        // Numbering restarted lower
        assert!(cursor.accept(3));
        assert!(cursor.accept(12));
        assert_eq!(cursor.last_seen(), Some(12));
    }

    #[test]
    fn test_cursor_forgets_oldest_ids() {
        let mut cursor = PollCursor::with_capacity(2);
        assert!(cursor.accept(1));
        assert!(cursor.accept(2));
        assert!(cursor.accept(3));
        assert!(cursor.accept(1));
        assert!(!cursor.accept(3));
    }

    #[test]
    fn test_batch_offset() {
        assert_eq!(batch_offset(None), 0);
        assert_eq!(batch_offset(Some(100)), 101);
        assert_eq!(batch_offset(Some(u64::MAX)), u64::MAX);
    }

    #[test]
    fn test_backoff_pattern() {
        let mut backoff = PollBackoff::default();
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 250, 1000, 2000, 5000, 10_000, 10_000]);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_timeout_retries_immediately_without_backoff() {
        let mut backoff = PollBackoff::default();
        for _ in 0..3 {
            assert_eq!(
                classify_failure(&SessionError::TimedOut, &mut backoff),
                PollDecision::Resubmit {
                    offset: 0,
                    delay: Duration::ZERO
                }
            );
        }
        assert_eq!(backoff.failures(), 0);
    }

    #[test]
    fn test_resolution_failure_retries_now_then_backs_off() {
        let mut backoff = PollBackoff::default();
        let error = SessionError::Resolve("dns error".to_string());
        assert_eq!(
            classify_failure(&error, &mut backoff),
            PollDecision::retry(Duration::ZERO)
        );
        assert_eq!(
            classify_failure(&error, &mut backoff),
            PollDecision::retry(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let mut backoff = PollBackoff::default();
        let error = SessionError::Status {
            status: 429,
            body: r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 5","parameters":{"retry_after":5}}"#.to_string(),
        };
        assert_eq!(
            classify_failure(&error, &mut backoff),
            PollDecision::retry(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_rejected_token_halts() {
        let mut backoff = PollBackoff::default();
        for status in [401, 404] {
            let error = SessionError::Status {
                status,
                body: r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#.to_string(),
            };
            assert!(matches!(
                classify_failure(&error, &mut backoff),
                PollDecision::Halt(_)
            ));
        }
    }

    #[test]
    fn test_server_error_backs_off() {
        let mut backoff = PollBackoff::default();
        backoff.next_delay();
        let error = SessionError::Status {
            status: 502,
            body: "<html>Bad Gateway</html>".to_string(),
        };
        assert_eq!(
            classify_failure(&error, &mut backoff),
            PollDecision::retry(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_decode_batch_isolates_poison_update() {
        let body = r#"{"ok":true,"result":[
            {"update_id":5,"message":{"message_id":1,"chat":{"id":9,"type":"private"},"date":0,"text":"hi"}},
            {"update_id":6,"message":{"message_id":"not-a-number"}},
            {"no_id":true}
        ]}"#;
        let updates = decode_batch(body).unwrap();
        assert_eq!(updates.len(), 3);
        assert!(matches!(&updates[0], DecodedUpdate::Update(u) if u.update_id == 5));
        assert!(matches!(
            &updates[1],
            DecodedUpdate::Malformed {
                update_id: Some(6),
                ..
            }
        ));
        assert!(matches!(
            &updates[2],
            DecodedUpdate::Malformed {
                update_id: None,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_batch_errors() {
        assert!(matches!(decode_batch("not json"), Err(BatchError::Json(_))));
        let failure = decode_batch(r#"{"ok":false,"error_code":409,"description":"Conflict"}"#);
        assert!(matches!(
            failure,
            Err(BatchError::Api(ApiFailure {
                error_code: Some(409),
                ..
            }))
        ));
    }

    #[test]
    fn test_extract_simple_command() {
        let msg = message("/start", vec![("bot_command", 0, 6)]);
        let commands = extract_commands(&msg, 3);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command, "start");
        assert_eq!(commands[0].args, "");
        assert_eq!(commands[0].chat_id, 77);
        assert_eq!(commands[0].update_id, 3);
    }

    #[test]
    fn test_extract_strips_bot_name_and_keeps_args() {
        let msg = message("/publish@gw_bot 21.5 C", vec![("bot_command", 0, 15)]);
        let commands = extract_commands(&msg, 1);
        assert_eq!(commands[0].command, "publish");
        assert_eq!(commands[0].args, "21.5 C");
    }

    #[test]
    fn test_extract_uses_utf16_offsets() {
        // The emoji is two UTF-16 units and four bytes
        let msg = message("🚀 go /status now", vec![("bot_command", 6, 7)]);
        let commands = extract_commands(&msg, 1);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command, "status");
        assert_eq!(commands[0].args, "now");
    }

    #[test]
    fn test_extract_multiple_commands_and_other_entities() {
        let msg = message(
            "/a one #tag /b two",
            vec![("bot_command", 0, 2), ("hashtag", 7, 4), ("bot_command", 12, 2)],
        );
        let commands = extract_commands(&msg, 1);
        let names: Vec<_> = commands.iter().map(|c| c.command.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(commands[0].args, "one #tag");
        assert_eq!(commands[1].args, "two");
    }

    #[test]
    fn test_extract_ignores_out_of_range_entity() {
        let msg = message("/x", vec![("bot_command", 0, 10)]);
        assert!(extract_commands(&msg, 1).is_empty());
    }

    #[test]
    fn test_message_without_text_yields_nothing() {
        let mut msg = message("", vec![]);
        msg.text = None;
        assert!(extract_commands(&msg, 1).is_empty());
    }

    proptest! {
        #[test]
        fn prop_cursor_refuses_exactly_the_repeats(ids in proptest::collection::vec(0u64..1000, 0..50)) {
            let mut cursor = PollCursor::new();
            let mut seen = std::collections::HashSet::new();
            for id in ids {
                prop_assert_eq!(cursor.accept(id), seen.insert(id));
            }
        }
    }
}
