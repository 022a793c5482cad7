//! One-shot request sessions against the Bot API
//!
//! Every request is independent: build the URL, send, read the body, done.
//! The channel only ever sees the raw body or a classified [`SessionError`].

use crate::config::TelegramSection;
use crate::error::redact_secrets;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Slack added on top of the server-side long-poll wait
pub const POLL_TIMEOUT_MARGIN_SECS: u64 = 10;

/// OS error number for "no route to host"
const EHOSTUNREACH: i32 = 113;

/// Classified request failures. Messages are redacted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("request timed out")]
    TimedOut,
    #[error("name resolution failed: {0}")]
    Resolve(String),
    #[error("no route to host: {0}")]
    NoRoute(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Request(String),
}

impl SessionError {
    /// Timeouts, resolution and routing failures are worth retrying right away
    pub fn is_retry_now(&self) -> bool {
        matches!(
            self,
            SessionError::TimedOut | SessionError::Resolve(_) | SessionError::NoRoute(_)
        )
    }

    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return SessionError::TimedOut;
        }

        let detail = redact_secrets(&error_chain(&error));
        if error.is_connect() {
            let lowered = detail.to_lowercase();
            if lowered.contains("dns error") || lowered.contains("failed to lookup address") {
                SessionError::Resolve(detail)
            } else if raw_os_error(&error) == Some(EHOSTUNREACH)
                || lowered.contains("no route to host")
            {
                SessionError::NoRoute(detail)
            } else {
                SessionError::Connect(detail)
            }
        } else {
            SessionError::Request(detail)
        }
    }
}

fn error_chain(error: &dyn StdError) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}

fn raw_os_error(error: &dyn StdError) -> Option<i32> {
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(code) = io.raw_os_error() {
                return Some(code);
            }
        }
        source = cause.source();
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Post,
}

/// Transport for Bot API method calls
#[async_trait]
pub trait RequestSession: Send + Sync + 'static {
    /// Issue `method` and return the response body on HTTP success
    async fn request(
        &self,
        verb: HttpVerb,
        method: &str,
        body: String,
    ) -> Result<String, SessionError>;

    async fn get(&self, method: &str, body: String) -> Result<String, SessionError> {
        self.request(HttpVerb::Get, method, body).await
    }

    async fn post(&self, method: &str, body: String) -> Result<String, SessionError> {
        self.request(HttpVerb::Post, method, body).await
    }
}

/// reqwest-backed session; one client, one connection pool, rustls trust store
#[derive(Clone)]
pub struct HttpsSession {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl std::fmt::Debug for HttpsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsSession")
            .field("api_base", &self.api_base)
            .field("token", &"***")
            .finish()
    }
}

impl HttpsSession {
    /// Build a session whose request timeout covers the long-poll wait
    pub fn new(config: &TelegramSection, token: String) -> Result<Self, SessionError> {
        let timeout = Duration::from_secs(config.poll_timeout_secs + POLL_TIMEOUT_MARGIN_SECS);
        Self::with_timeout(&config.api_base, token, timeout)
    }

    pub fn with_timeout(
        api_base: &str,
        token: String,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SessionError::from_reqwest)?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }
}

#[async_trait]
impl RequestSession for HttpsSession {
    async fn request(
        &self,
        verb: HttpVerb,
        method: &str,
        body: String,
    ) -> Result<String, SessionError> {
        let url = self.endpoint(method);
        let builder = match verb {
            HttpVerb::Get => self.client.get(url),
            HttpVerb::Post => self.client.post(url),
        };

        trace!(method, ?verb, "Bot API request");
        let response = builder
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(SessionError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(SessionError::from_reqwest)?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(SessionError::Status {
                status: status.as_u16(),
                body: redact_secrets(&text),
            })
        }
    }
}
