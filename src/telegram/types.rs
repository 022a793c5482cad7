//! Bot API wire types (subset used by the channel)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const GET_UPDATES: &str = "getUpdates";
pub const SEND_MESSAGE: &str = "sendMessage";
pub const SET_MY_COMMANDS: &str = "setMyCommands";
pub const DELETE_MY_COMMANDS: &str = "deleteMyCommands";
pub const GET_ME: &str = "getMe";

/// Envelope around every Bot API response
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub error_code: Option<i64>,
    pub description: Option<String>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
}

impl<T> ApiResponse<T> {
    pub fn retry_after(&self) -> Option<u64> {
        self.parameters.as_ref().and_then(|p| p.retry_after)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: u64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub date: i64,
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
}

impl Message {
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.date, 0)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

/// Annotated span of message text. Offsets count UTF-16 code units.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetUpdatesRequest {
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl GetUpdatesRequest {
    /// Offset 0 means "no cursor" and is left off the wire
    pub fn new(timeout: u64, offset: u64) -> Self {
        Self {
            timeout,
            offset: (offset > 0).then_some(offset),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest<'a> {
    pub chat_id: i64,
    pub parse_mode: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BotCommandScope {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl Default for BotCommandScope {
    fn default() -> Self {
        Self { kind: "default" }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SetMyCommandsRequest {
    pub commands: Vec<BotCommand>,
    pub scope: BotCommandScope,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DeleteMyCommandsRequest {
    pub scope: BotCommandScope,
}
