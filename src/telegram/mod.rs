//! Telegram bot channel
//!
//! Long-polls the Bot API for updates, turns `bot_command` entities into
//! handler calls and sends plain messages back to the most recent chat.
//!
//! ```no_run
//! use repertory::config::TelegramSection;
//! use repertory::telegram::{BotChannel, BotOptions, CommandRegistry, HttpsSession};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TelegramSection::new("TELEGRAM_BOT_TOKEN");
//! let session = HttpsSession::new(&config, config.token()?)?;
//! let registry = CommandRegistry::new().with_command("ping", "Liveness check", |call| {
//!     println!("ping from chat {}", call.chat_id);
//! })?;
//!
//! let bot = BotChannel::start(session, BotOptions::from(&config), registry);
//! bot.send("hello");
//! bot.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod poll;
pub mod registry;
pub mod session;
pub mod types;

pub use channel::{BatchSummary, BotChannel, BotHandle, BotOptions, BotState, BotStatus};
pub use poll::{PollBackoff, PollCursor, PollDecision};
pub use registry::{
    CommandHandler, CommandInvocation, CommandRegistry, DispatchOutcome, RegistryError,
};
pub use session::{HttpVerb, HttpsSession, RequestSession, SessionError};
pub use types::BotCommand;
