//! Structured trace events for the engine's suspension points.
//!
//! Each variant is emitted as a single `tracing::info!` call carrying the
//! event as a JSON blob under the `trace_event` field, so a subscriber can
//! filter on the `agent_trace` message without parsing log text. This crate
//! never ships the events anywhere itself — attaching a collector (file,
//! OTel, whatever) is left to the embedding application.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    PlanGenerated {
        session_id: String,
        todolist_id: String,
        item_count: usize,
        open_question_count: usize,
    },
    PlanValidationFailed {
        session_id: String,
        reason: String,
    },
    Thought {
        session_id: String,
        task_position: Option<usize>,
    },
    Action {
        session_id: String,
        task_position: Option<usize>,
        kind: String,
    },
    Observation {
        session_id: String,
        task_position: usize,
        success: bool,
        attempts: u32,
    },
    ToolInvoked {
        tool_name: String,
        call_id: String,
        attempt: u32,
        outcome: String,
    },
    LlmRequest {
        role: String,
        provider: String,
        model: String,
        duration_ms: u64,
    },
    LlmFallback {
        role: String,
        from_provider: String,
        to_provider: String,
        reason: String,
    },
    CompressionRun {
        session_id: String,
        before_len: usize,
        after_len: usize,
        fell_back_to_tail_retention: bool,
    },
    StateSaved {
        session_id: String,
        version: u64,
    },
    SessionReset {
        session_id: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "agent_trace");
    }
}
