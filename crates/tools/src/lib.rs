//! The tool contract: a uniform invocation envelope and a name→tool registry.
//!
//! `exec` is kept as a single worked example of the `Tool` trait; concrete
//! tool implementations beyond that are outside this crate's scope.

pub mod contract;
pub mod exec;

pub use contract::{EnvelopeConfig, Tool, ToolRegistry, ToolResult};
