//! Versioned session state, independent of the plan/message data it points at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    #[serde(default)]
    pub todolist_id: Option<String>,
    #[serde(default)]
    pub mission: Option<String>,
    #[serde(default)]
    pub answers: HashMap<String, String>,
    #[serde(default)]
    pub pending_question: Option<String>,
    #[serde(rename = "_version")]
    pub version: u64,
    #[serde(rename = "_updated_at")]
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            todolist_id: None,
            mission: None,
            answers: HashMap::new(),
            pending_question: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Clear plan-related fields ahead of re-planning, per spec §4.6's
    /// between-query reset. Message history is owned elsewhere and is
    /// never touched by this call.
    pub fn reset_plan(&mut self) {
        self.todolist_id = None;
        self.mission = None;
        self.pending_question = None;
        self.answers.clear();
    }

    pub fn is_awaiting_user(&self) -> bool {
        self.pending_question.is_some()
    }

    /// Bump `version` and `updated_at`. Called by the state store immediately
    /// before a successful save; never called directly by the executor.
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_plan_clears_plan_fields_only() {
        let mut s = SessionState::new("s1");
        s.todolist_id = Some("t1".into());
        s.mission = Some("do things".into());
        s.pending_question = Some("which repo?".into());
        s.answers.insert("which repo?".into(), "acme".into());
        s.version = 3;

        s.reset_plan();

        assert!(s.todolist_id.is_none());
        assert!(s.mission.is_none());
        assert!(s.pending_question.is_none());
        assert!(s.answers.is_empty());
        assert_eq!(s.version, 3, "version is owned by the store, not reset_plan");
    }

    #[test]
    fn bump_version_increments_and_touches_timestamp() {
        let mut s = SessionState::new("s1");
        let before = s.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.bump_version();
        assert_eq!(s.version, 1);
        assert!(s.updated_at >= before);
    }
}
