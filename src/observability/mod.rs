//! Observability for the adapters: structured logging and loop spans

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{bot_span, broker_span};
