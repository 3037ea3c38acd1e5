//! The event stream wire type: one `AgentEvent` per user-visible state
//! transition of an `execute` call (spec §4.7).
//!
//! Events for a single session are totally ordered and correspond
//! one-for-one to the executor's state-machine transitions; the stream is
//! single-consumer and the caller must drain it to completion or cancel.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Thought {
        task_position: Option<usize>,
        content: String,
    },
    Action {
        task_position: Option<usize>,
        #[serde(flatten)]
        kind: ActionKind,
    },
    Observation {
        task_position: usize,
        success: bool,
        payload: serde_json::Value,
        attempts: u32,
    },
    StateUpdate {
        version: u64,
        summary: String,
    },
    AskUser {
        question: String,
    },
    Complete {
        summary: String,
    },
    Error {
        kind: String,
        message: String,
        recoverable: bool,
    },
}

/// The specific action an `Action` event reports. Tagged separately from
/// `AgentEvent` so `tool_call`'s `name`/`arguments` fields don't leak into
/// the other variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    ToolCall {
        tool_name: String,
        arguments: serde_json::Value,
    },
    AskUser,
    Replan,
    Complete,
}
