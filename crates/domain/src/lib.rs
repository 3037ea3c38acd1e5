//! Shared value types and error taxonomy for the agent execution engine.
//!
//! Every crate above this one builds on these types rather than defining
//! its own copies: messages, tool calls, the plan/session data model, the
//! error taxonomy, and the trace-event idiom used for structured logging.

pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod plan;
pub mod session;
pub mod stream;
pub mod trace;

pub use error::{Error, Result};
