//! Command registry
//!
//! Pure data: name to description and optional handler. Pushing the command
//! list to the remote side is the channel's job; the registry only produces
//! the request that describes its current contents.

use super::types::{
    BotCommand, BotCommandScope, DeleteMyCommandsRequest, SetMyCommandsRequest,
    DELETE_MY_COMMANDS, SET_MY_COMMANDS,
};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// Most commands the remote side accepts
pub const MAX_COMMANDS: usize = 100;
pub const MAX_COMMAND_NAME_LEN: usize = 32;
pub const MAX_DESCRIPTION_LEN: usize = 256;

/// One recognised command in an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    /// Command name without the leading `/` or `@botname` suffix
    pub command: String,
    /// Text following the command token, trimmed
    pub args: String,
    pub chat_id: i64,
    pub update_id: u64,
}

pub type CommandHandler = Arc<dyn Fn(&CommandInvocation) + Send + Sync + 'static>;

#[derive(Clone)]
pub struct CommandDescriptor {
    pub description: String,
    handler: Option<CommandHandler>,
}

impl CommandDescriptor {
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }
}

impl std::fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("description", &self.description)
            .field("has_handler", &self.has_handler())
            .finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid command name '{0}': use 1-32 lowercase letters, digits or underscores")]
    InvalidName(String),
    #[error("invalid description for '{0}': must be 1-256 characters")]
    InvalidDescription(String),
    #[error("command '{0}' is not registered and no description was given")]
    DescriptionRequired(String),
    #[error("command registry is full (100 commands)")]
    Full,
    #[error("command '{0}' is not registered")]
    UnknownCommand(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// What happened when an invocation was routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    UnknownCommand,
    NoHandler,
    HandlerPanicked(String),
}

/// Request that replaces the remote command list with the registry contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSync {
    Set(SetMyCommandsRequest),
    Delete(DeleteMyCommandsRequest),
}

impl CommandSync {
    pub fn method(&self) -> &'static str {
        match self {
            CommandSync::Set(_) => SET_MY_COMMANDS,
            CommandSync::Delete(_) => DELETE_MY_COMMANDS,
        }
    }

    pub fn body(&self) -> Result<String, serde_json::Error> {
        match self {
            CommandSync::Set(request) => serde_json::to_string(request),
            CommandSync::Delete(request) => serde_json::to_string(request),
        }
    }
}

/// Names may contain only lowercase letters, digits and underscores
pub fn validate_command_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_COMMAND_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

fn validate_description(name: &str, description: &str) -> Result<(), RegistryError> {
    let length = description.chars().count();
    if description.trim().is_empty() || length > MAX_DESCRIPTION_LEN {
        return Err(RegistryError::InvalidDescription(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CommandDescriptor>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a command.
    ///
    /// For an existing command the handler is always replaced and the
    /// description only when one is given. A new command needs a description.
    pub fn upsert(
        &mut self,
        name: &str,
        description: Option<&str>,
        handler: Option<CommandHandler>,
    ) -> Result<Upsert, RegistryError> {
        validate_command_name(name)?;
        if let Some(description) = description {
            validate_description(name, description)?;
        }

        if let Some(existing) = self.commands.get_mut(name) {
            existing.handler = handler;
            if let Some(description) = description {
                existing.description = description.to_string();
            }
            return Ok(Upsert::Updated);
        }

        let description =
            description.ok_or_else(|| RegistryError::DescriptionRequired(name.to_string()))?;
        if self.commands.len() >= MAX_COMMANDS {
            return Err(RegistryError::Full);
        }
        self.commands.insert(
            name.to_string(),
            CommandDescriptor {
                description: description.to_string(),
                handler,
            },
        );
        Ok(Upsert::Inserted)
    }

    /// Builder-style registration for use before the channel starts
    pub fn with_command<F>(
        mut self,
        name: &str,
        description: &str,
        handler: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(&CommandInvocation) + Send + Sync + 'static,
    {
        self.upsert(name, Some(description), Some(Arc::new(handler)))?;
        Ok(self)
    }

    /// Replace only the handler of a registered command
    pub fn set_handler(&mut self, name: &str, handler: CommandHandler) -> Result<(), RegistryError> {
        let existing = self
            .commands
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownCommand(name.to_string()))?;
        existing.handler = Some(handler);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.commands.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands in name order, as published to the remote side
    pub fn commands(&self) -> Vec<BotCommand> {
        self.commands
            .iter()
            .map(|(name, descriptor)| BotCommand {
                command: name.clone(),
                description: descriptor.description.clone(),
            })
            .collect()
    }

    pub fn sync_request(&self) -> CommandSync {
        if self.is_empty() {
            CommandSync::Delete(DeleteMyCommandsRequest::default())
        } else {
            CommandSync::Set(SetMyCommandsRequest {
                commands: self.commands(),
                scope: BotCommandScope::default(),
            })
        }
    }

    /// Run the handler for an invocation. Handler panics are contained.
    pub fn dispatch(&self, invocation: &CommandInvocation) -> DispatchOutcome {
        let Some(descriptor) = self.commands.get(&invocation.command) else {
            warn!(command = %invocation.command, "No entry for command");
            return DispatchOutcome::UnknownCommand;
        };
        let Some(handler) = descriptor.handler.as_ref() else {
            return DispatchOutcome::NoHandler;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(invocation))) {
            Ok(()) => DispatchOutcome::Handled,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(command = %invocation.command, panic = %message, "Command handler panicked");
                DispatchOutcome::HandlerPanicked(message)
            }
        }
    }
}
