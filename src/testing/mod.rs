//! Testing utilities and mock implementations
//!
//! In-memory stand-ins for the broker and the Bot API so both adapters can be
//! exercised without external services.

pub mod mocks;

pub use mocks::*;
