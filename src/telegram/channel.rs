//! Bot channel manager
//!
//! One task owns the poll cursor, the counterpart chat id and the command
//! registry. Callers talk to it through a cloneable [`BotHandle`]; requests
//! land in a mailbox and are handled between poll completions, so no state
//! is ever shared across threads. Outbound one-shot requests (messages,
//! command list updates) run as their own tasks and never delay the poll;
//! shutdown waits for them before the channel reports it has stopped.

use super::poll::{
    batch_offset, classify_api_failure, classify_failure, decode_batch, extract_commands,
    BatchError, DecodedUpdate, PollBackoff, PollCursor, PollDecision,
};
use super::registry::{
    validate_command_name, CommandHandler, CommandInvocation, CommandRegistry, DispatchOutcome,
    RegistryError,
};
use super::session::{HttpVerb, RequestSession, SessionError};
use super::types::{
    ApiResponse, BotCommand, GetUpdatesRequest, SendMessageRequest, GET_ME, GET_UPDATES,
    SEND_MESSAGE,
};
use crate::config::TelegramSection;
use crate::shutdown::{Shutdown, ShutdownListener};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn, Instrument};

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on waiting for outbound requests at shutdown; stays below `JOIN_TIMEOUT`
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime options for the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotOptions {
    /// Server-side long-poll wait in seconds
    pub poll_timeout_secs: u64,
    pub parse_mode: String,
}

impl Default for BotOptions {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 43,
            parse_mode: "HTML".to_string(),
        }
    }
}

impl From<&TelegramSection> for BotOptions {
    fn from(config: &TelegramSection) -> Self {
        Self {
            poll_timeout_secs: config.poll_timeout_secs,
            parse_mode: config.parse_mode.clone(),
        }
    }
}

/// Observable condition of the poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotStatus {
    Polling,
    /// The remote side refused the access token; nothing more will be polled
    Halted(String),
    Stopped,
}

enum BotRequest {
    Send(String),
    SetCommand {
        name: String,
        description: Option<String>,
        handler: Option<CommandHandler>,
        publish_now: bool,
    },
    DeleteCommand(String),
    SetChatId(i64),
    ChatId(oneshot::Sender<Option<i64>>),
    Commands(oneshot::Sender<Vec<BotCommand>>),
    GetMe,
}

/// Cloneable mailbox handle; safe to use from command handlers
#[derive(Clone)]
pub struct BotHandle {
    tx: mpsc::UnboundedSender<BotRequest>,
}

impl BotHandle {
    fn post(&self, request: BotRequest) {
        if self.tx.send(request).is_err() {
            debug!("Bot channel is stopped, request dropped");
        }
    }

    /// Send `text` to the last known chat. Dropped with a warning if no chat is known yet.
    pub fn send(&self, text: impl Into<String>) {
        self.post(BotRequest::Send(text.into()));
    }

    /// Register or update a command; `publish_now` pushes the command list
    pub fn set_command<F>(
        &self,
        name: &str,
        description: &str,
        publish_now: bool,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&CommandInvocation) + Send + Sync + 'static,
    {
        validate_command_name(name)?;
        self.post(BotRequest::SetCommand {
            name: name.to_string(),
            description: Some(description.to_string()),
            handler: Some(Arc::new(handler)),
            publish_now,
        });
        Ok(())
    }

    /// Replace the handler of a command, keeping its description
    pub fn set_handler<F>(&self, name: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&CommandInvocation) + Send + Sync + 'static,
    {
        validate_command_name(name)?;
        self.post(BotRequest::SetCommand {
            name: name.to_string(),
            description: None,
            handler: Some(Arc::new(handler)),
            publish_now: false,
        });
        Ok(())
    }

    /// Remove a command and push the resulting command list
    pub fn delete_command(&self, name: &str) {
        self.post(BotRequest::DeleteCommand(name.to_string()));
    }

    pub fn set_chat_id(&self, chat_id: i64) {
        self.post(BotRequest::SetChatId(chat_id));
    }

    /// Chat id of the most recent counterpart, if any
    pub async fn chat_id(&self) -> Option<i64> {
        let (tx, rx) = oneshot::channel();
        self.post(BotRequest::ChatId(tx));
        rx.await.ok().flatten()
    }

    /// Current registry contents
    pub async fn commands(&self) -> Vec<BotCommand> {
        let (tx, rx) = oneshot::channel();
        self.post(BotRequest::Commands(tx));
        rx.await.unwrap_or_default()
    }

    /// Ask the remote side who we are; the answer is logged
    pub fn get_me(&self) {
        self.post(BotRequest::GetMe);
    }
}

/// Long-poll bot channel
pub struct BotChannel {
    handle: BotHandle,
    status_rx: watch::Receiver<BotStatus>,
    shutdown: Shutdown,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BotChannel {
    /// Start polling with offset 0 and push the registry's command list
    pub fn start<S: RequestSession>(
        session: S,
        options: BotOptions,
        registry: CommandRegistry,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(BotStatus::Polling);
        let (shutdown, listener) = Shutdown::new();
        let span = crate::bot_span!(poll_timeout_secs = options.poll_timeout_secs);

        let actor = BotActor {
            session: Arc::new(session),
            options,
            state: BotState::new(registry),
            backoff: PollBackoff::default(),
            status_tx,
            requests: JoinSet::new(),
        };
        let task = tokio::spawn(actor.run(rx, listener).instrument(span));

        Self {
            handle: BotHandle { tx },
            status_rx,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn handle(&self) -> BotHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> BotStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<BotStatus> {
        self.status_rx.clone()
    }

    pub fn send(&self, text: impl Into<String>) {
        self.handle.send(text);
    }

    pub fn set_command<F>(
        &self,
        name: &str,
        description: &str,
        publish_now: bool,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&CommandInvocation) + Send + Sync + 'static,
    {
        self.handle
            .set_command(name, description, publish_now, handler)
    }

    pub fn delete_command(&self, name: &str) {
        self.handle.delete_command(name);
    }

    /// Stop polling. Queued and in-flight outbound requests get a bounded chance
    /// to finish first. Later calls return immediately.
    pub async fn shutdown(&self) {
        if !self.shutdown.request() {
            return;
        }
        info!("Shutting down bot channel");

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut task) = task {
            match tokio::time::timeout(JOIN_TIMEOUT, &mut task).await {
                Ok(Ok(())) => debug!("Bot task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Bot task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Bot task didn't shut down in time, aborting");
                    task.abort();
                }
            }
        }
    }
}

impl Drop for BotChannel {
    fn drop(&mut self) {
        self.shutdown.request();
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// What a processed batch amounted to
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub accepted: usize,
    pub repeated: usize,
    pub malformed: usize,
    pub dispatched: usize,
    /// Highest readable update id in the batch, repeats included
    pub highest_id: Option<u64>,
}

impl BatchSummary {
    /// Offset that confirms this batch
    pub fn next_offset(&self) -> u64 {
        batch_offset(self.highest_id)
    }

    fn saw(&mut self, update_id: u64) {
        self.highest_id = Some(self.highest_id.map_or(update_id, |id| id.max(update_id)));
    }
}

/// Channel state without any I/O
pub struct BotState {
    pub cursor: PollCursor,
    pub registry: CommandRegistry,
    pub chat_id: Option<i64>,
}

impl BotState {
    pub fn new(registry: CommandRegistry) -> Self {
        Self {
            cursor: PollCursor::new(),
            registry,
            chat_id: None,
        }
    }

    /// Dispatch the commands of a batch, skipping updates consumed recently
    pub fn process_batch(&mut self, updates: Vec<DecodedUpdate>) -> BatchSummary {
        let mut summary = BatchSummary::default();

        for decoded in updates {
            let update = match decoded {
                DecodedUpdate::Update(update) => update,
                DecodedUpdate::Malformed { update_id, error } => {
                    warn!(?update_id, error = %error, "Skipping undecodable update");
                    if let Some(id) = update_id {
                        summary.saw(id);
                        self.cursor.accept(id);
                    }
                    summary.malformed += 1;
                    continue;
                }
            };

            summary.saw(update.update_id);
            if !self.cursor.accept(update.update_id) {
                warn!(update_id = update.update_id, "Repeated update ignored");
                summary.repeated += 1;
                continue;
            }
            summary.accepted += 1;

            let Some(message) = update.message.as_ref() else {
                debug!(update_id = update.update_id, "Update without message");
                continue;
            };
            self.chat_id = Some(message.chat.id);
            info!(
                update_id = update.update_id,
                from = ?message.from.as_ref().map(|u| u.id),
                username = ?message.from.as_ref().and_then(|u| u.username.as_deref()),
                chat_id = message.chat.id,
                chat_type = %message.chat.kind,
                sent_at = ?message.sent_at(),
                "Message received"
            );

            for invocation in extract_commands(message, update.update_id) {
                info!(command = %invocation.command, args = %invocation.args, "Bot command");
                if self.registry.dispatch(&invocation) == DispatchOutcome::Handled {
                    summary.dispatched += 1;
                }
            }
        }

        summary
    }
}

type PollFuture = Pin<Box<dyn Future<Output = Result<String, SessionError>> + Send>>;

struct BotActor<S> {
    session: Arc<S>,
    options: BotOptions,
    state: BotState,
    backoff: PollBackoff,
    status_tx: watch::Sender<BotStatus>,
    requests: JoinSet<()>,
}

impl<S: RequestSession> BotActor<S> {
    async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<BotRequest>,
        mut shutdown: ShutdownListener,
    ) {
        info!("Bot channel started");
        let mut poll = self.poll_after(0, Duration::ZERO);
        self.sync_commands();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                request = mailbox.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(finished) = self.requests.join_next(), if !self.requests.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "Bot API request task failed");
                    }
                }
                outcome = &mut poll => {
                    poll = match self.on_poll_complete(outcome) {
                        PollDecision::Resubmit { offset, delay } => self.poll_after(offset, delay),
                        PollDecision::Halt(reason) => {
                            error!(reason = %reason, "Polling halted");
                            self.status_tx.send_replace(BotStatus::Halted(reason));
                            Box::pin(std::future::pending())
                        }
                    };
                }
            }
        }

        drop(poll);
        mailbox.close();
        while let Ok(request) = mailbox.try_recv() {
            self.handle_request(request);
        }
        self.drain_requests().await;

        self.status_tx.send_if_modified(|status| {
            if matches!(status, BotStatus::Halted(_)) {
                false
            } else {
                *status = BotStatus::Stopped;
                true
            }
        });
        info!("Bot channel stopped");
    }

    async fn drain_requests(&mut self) {
        if self.requests.is_empty() {
            return;
        }
        debug!(pending = self.requests.len(), "Waiting for outbound requests");
        let requests = &mut self.requests;
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while requests.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                pending = self.requests.len(),
                "Outbound requests didn't finish in time, aborting"
            );
            self.requests.abort_all();
        }
    }

    fn poll_after(&self, offset: u64, delay: Duration) -> PollFuture {
        let session = Arc::clone(&self.session);
        let request = GetUpdatesRequest::new(self.options.poll_timeout_secs, offset);
        debug!(offset, ?delay, "Scheduling poll");

        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let body = serde_json::to_string(&request)
                .map_err(|e| SessionError::Request(e.to_string()))?;
            session.get(GET_UPDATES, body).await
        })
    }

    fn on_poll_complete(&mut self, outcome: Result<String, SessionError>) -> PollDecision {
        match outcome {
            Ok(body) => match decode_batch(&body) {
                Ok(updates) => {
                    self.backoff.reset();
                    let summary = self.state.process_batch(updates);
                    if summary != BatchSummary::default() {
                        debug!(?summary, "Batch processed");
                    }
                    PollDecision::Resubmit {
                        offset: summary.next_offset(),
                        delay: Duration::ZERO,
                    }
                }
                Err(BatchError::Api(failure)) => {
                    warn!(
                        error_code = ?failure.error_code,
                        description = %failure.description,
                        "Poll refused by remote side"
                    );
                    classify_api_failure(None, &failure, &mut self.backoff)
                }
                Err(BatchError::Json(e)) => {
                    error!(error = %e, "Undecodable poll response");
                    PollDecision::Resubmit {
                        offset: 0,
                        delay: self.backoff.next_delay(),
                    }
                }
            },
            Err(e) => {
                if e.is_retry_now() {
                    debug!(error = %e, "Poll interrupted, retrying");
                } else {
                    warn!(error = %e, failures = self.backoff.failures() + 1, "Poll failed");
                }
                classify_failure(&e, &mut self.backoff)
            }
        }
    }

    fn handle_request(&mut self, request: BotRequest) {
        match request {
            BotRequest::Send(text) => self.send_message(&text),
            BotRequest::SetCommand {
                name,
                description,
                handler,
                publish_now,
            } => {
                let result = match (description.as_deref(), handler) {
                    (None, Some(handler)) => self.state.registry.set_handler(&name, handler),
                    (description, handler) => self
                        .state
                        .registry
                        .upsert(&name, description, handler)
                        .map(|_| ()),
                };
                match result {
                    Ok(()) if publish_now => self.sync_commands(),
                    Ok(()) => debug!(command = %name, "Command registered"),
                    Err(e) => warn!(command = %name, error = %e, "Command not registered"),
                }
            }
            BotRequest::DeleteCommand(name) => {
                if !self.state.registry.remove(&name) {
                    debug!(command = %name, "Delete for unknown command");
                }
                self.sync_commands();
            }
            BotRequest::SetChatId(chat_id) => self.state.chat_id = Some(chat_id),
            BotRequest::ChatId(reply) => {
                let _ = reply.send(self.state.chat_id);
            }
            BotRequest::Commands(reply) => {
                let _ = reply.send(self.state.registry.commands());
            }
            BotRequest::GetMe => self.spawn_request(HttpVerb::Get, GET_ME, String::new()),
        }
    }

    fn send_message(&mut self, text: &str) {
        let Some(chat_id) = self.state.chat_id else {
            warn!("No chat id known yet, message not sent");
            return;
        };
        let request = SendMessageRequest {
            chat_id,
            parse_mode: &self.options.parse_mode,
            text,
        };
        match serde_json::to_string(&request) {
            Ok(body) => {
                trace!(body = %body, "Outbound message");
                self.spawn_request(HttpVerb::Post, SEND_MESSAGE, body);
            }
            Err(e) => error!(error = %e, "Could not encode message"),
        }
    }

    fn sync_commands(&mut self) {
        let sync = self.state.registry.sync_request();
        match sync.body() {
            Ok(body) => self.spawn_request(HttpVerb::Post, sync.method(), body),
            Err(e) => error!(error = %e, "Could not encode command list"),
        }
    }

    /// One-shot request whose outcome is only logged
    fn spawn_request(&mut self, verb: HttpVerb, method: &'static str, body: String) {
        let session = Arc::clone(&self.session);
        self.requests.spawn(
            async move {
                match session.request(verb, method, body).await {
                    Ok(response) => log_response(method, &response),
                    Err(e) => warn!(method, error = %e, "Bot API request failed"),
                }
            }
            .in_current_span(),
        );
    }
}

fn log_response(method: &str, body: &str) {
    match serde_json::from_str::<ApiResponse<serde_json::Value>>(body) {
        Ok(response) if response.ok => match method {
            GET_ME => info!(method, result = ?response.result, "Bot identity"),
            _ => trace!(method, response = %body, "Bot API response"),
        },
        Ok(response) => warn!(
            method,
            error_code = ?response.error_code,
            description = ?response.description,
            "Bot API request refused"
        ),
        Err(e) => warn!(method, error = %e, "Unreadable Bot API response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::poll::decode_batch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn batch(body: serde_json::Value) -> Vec<DecodedUpdate> {
        decode_batch(&body.to_string()).unwrap()
    }

    fn command_update(update_id: u64, chat_id: i64, text: &str, length: usize) -> serde_json::Value {
        serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id,
                "chat": { "id": chat_id, "type": "private" },
                "date": 0,
                "text": text,
                "entities": [{ "type": "bot_command", "offset": 0, "length": length }]
            }
        })
    }

    #[test]
    fn test_process_batch_dispatches_and_tracks_chat() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = CommandRegistry::new()
            .with_command("start", "Begin", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let mut state = BotState::new(registry);

        let summary = state.process_batch(batch(serde_json::json!({
            "ok": true,
            "result": [command_update(10, 55, "/start", 6), command_update(11, 56, "/unknown", 8)]
        })));

        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.chat_id, Some(56));
        assert_eq!(summary.next_offset(), 12);
    }

    #[test]
    fn test_process_batch_skips_repeats_but_not_lower_ids() {
        let mut state = BotState::new(CommandRegistry::new());
        state.cursor.accept(20);

        let summary = state.process_batch(batch(serde_json::json!({
            "ok": true,
            "result": [command_update(20, 1, "/start", 6), command_update(4, 2, "/start", 6)]
        })));

        assert_eq!(summary.repeated, 1);
        assert_eq!(summary.accepted, 1);
        assert_eq!(state.chat_id, Some(2));
        assert_eq!(summary.next_offset(), 21);
    }

    #[test]
    fn test_empty_batch_confirms_nothing() {
        let mut state = BotState::new(CommandRegistry::new());
        state.cursor.accept(20);
        let summary = state.process_batch(Vec::new());
        assert_eq!(summary, BatchSummary::default());
        assert_eq!(summary.next_offset(), 0);
    }

    #[test]
    fn test_malformed_update_advances_cursor() {
        let mut state = BotState::new(CommandRegistry::new());
        let summary = state.process_batch(batch(serde_json::json!({
            "ok": true,
            "result": [{ "update_id": 30, "message": { "chat": "broken" } }]
        })));

        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.next_offset(), 31);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = TelegramSection::new("TOKEN");
        config.poll_timeout_secs = 5;
        let options = BotOptions::from(&config);
        assert_eq!(options.poll_timeout_secs, 5);
        assert_eq!(options.parse_mode, "HTML");
        assert_eq!(BotOptions::default().poll_timeout_secs, 43);
    }
}
