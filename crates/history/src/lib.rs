//! Rolling conversation history with LLM-driven compression.
//!
//! The system prompt is never evicted or summarized. Everything else is
//! kept up to `max_messages`; once the history crosses `summary_threshold`,
//! the oldest compressible segment is replaced by a single summary message.
//! If compression fails for any reason, a tail-retention fallback keeps the
//! history bounded without ever aborting execution.

use ag_domain::message::{Message, MessageContent, Role};
use ag_domain::trace::TraceEvent;
use ag_domain::Result;
use ag_providers::router::LlmRouter;
use ag_providers::traits::ChatRequest;
use ag_domain::capability::ModelRole;

/// Outcome of a [`MessageHistory::maybe_compress`] call, reported to the
/// executor as a `StateUpdate` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// Length was under the threshold; nothing happened.
    NotNeeded,
    /// The oldest segment was replaced with an LLM-generated summary.
    Compressed { before_len: usize, after_len: usize },
    /// The LLM summarization call failed; history was instead truncated to
    /// the system prompt plus the most recent `max_messages - 1` messages.
    FallbackTailRetention { before_len: usize, after_len: usize },
}

pub struct MessageHistory {
    session_id: String,
    system_prompt: Message,
    messages: Vec<Message>,
    max_messages: usize,
    summary_threshold: usize,
}

impl MessageHistory {
    pub fn new(
        session_id: impl Into<String>,
        system_prompt: impl Into<String>,
        max_messages: usize,
        summary_threshold: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            system_prompt: Message::system(system_prompt),
            messages: Vec::new(),
            max_messages,
            summary_threshold,
        }
    }

    /// Append a message, enforcing the hard `max_messages` cap as a backstop
    /// in case compression has not run recently.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
        self.enforce_tail_cap();
    }

    /// Total message count including the system prompt.
    pub fn len(&self) -> usize {
        1 + self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn enforce_tail_cap(&mut self) {
        let budget = self.max_messages.saturating_sub(1);
        if self.messages.len() > budget {
            let excess = self.messages.len() - budget;
            self.messages.drain(0..excess);
        }
    }

    /// The system prompt followed by the last `n` logical turns. A turn is
    /// a user or assistant message plus any tool messages immediately
    /// following it. `n < 0` returns the full history.
    pub fn snapshot(&self, n: i64) -> Vec<Message> {
        if n < 0 {
            let mut out = Vec::with_capacity(self.len());
            out.push(self.system_prompt.clone());
            out.extend(self.messages.iter().cloned());
            return out;
        }

        let turns = group_into_turns(&self.messages);
        let keep = turns.len().min(n as usize);
        let mut out = vec![self.system_prompt.clone()];
        for turn in &turns[turns.len() - keep..] {
            out.extend(turn.iter().cloned());
        }
        out
    }

    fn needs_compression(&self) -> bool {
        self.len() > self.summary_threshold
    }

    /// Compress the oldest compressible segment via the `Summarizer` role,
    /// or fall back to tail retention if the LLM call fails.
    pub async fn maybe_compress(&mut self, router: &LlmRouter) -> Result<CompressionOutcome> {
        if !self.needs_compression() {
            return Ok(CompressionOutcome::NotNeeded);
        }

        let before_len = self.len();
        let keep_last_turns = (self.summary_threshold / 2).max(1);
        let (to_compact, to_keep) = split_for_compression(&self.messages, keep_last_turns);

        if to_compact.is_empty() {
            return Ok(CompressionOutcome::NotNeeded);
        }

        match generate_summary(router, to_compact).await {
            Ok(summary) => {
                let mut new_messages = vec![Message::assistant(summary)];
                new_messages.extend(to_keep.iter().cloned());
                self.messages = new_messages;
                let after_len = self.len();

                TraceEvent::CompressionRun {
                    session_id: self.session_id.clone(),
                    before_len,
                    after_len,
                    fell_back_to_tail_retention: false,
                }
                .emit();

                Ok(CompressionOutcome::Compressed { before_len, after_len })
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "compression failed, falling back to tail retention");
                self.enforce_tail_cap();
                let after_len = self.len();

                TraceEvent::CompressionRun {
                    session_id: self.session_id.clone(),
                    before_len,
                    after_len,
                    fell_back_to_tail_retention: true,
                }
                .emit();

                Ok(CompressionOutcome::FallbackTailRetention { before_len, after_len })
            }
        }
    }
}

/// Group a flat message list into logical turns: a user/assistant message
/// starts a new turn, and any tool messages immediately following it are
/// appended to that turn. This is the unit both `snapshot` and compression
/// split along, so neither ever separates a tool_use from its tool_result.
fn group_into_turns(messages: &[Message]) -> Vec<Vec<Message>> {
    let mut turns: Vec<Vec<Message>> = Vec::new();
    for msg in messages {
        match msg.role {
            Role::User | Role::Assistant => turns.push(vec![msg.clone()]),
            Role::Tool => {
                if let Some(turn) = turns.last_mut() {
                    turn.push(msg.clone());
                } else {
                    turns.push(vec![msg.clone()]);
                }
            }
            Role::System => {
                // Embedded system messages (shouldn't normally occur outside
                // the dedicated system_prompt) are kept with the prior turn.
                if let Some(turn) = turns.last_mut() {
                    turn.push(msg.clone());
                } else {
                    turns.push(vec![msg.clone()]);
                }
            }
        }
    }
    turns
}

/// Split the non-system messages into (to_compact, to_keep), keeping the
/// most recent `keep_last_turns` turns intact.
fn split_for_compression(messages: &[Message], keep_last_turns: usize) -> (Vec<Message>, Vec<Message>) {
    let turns = group_into_turns(messages);
    if turns.len() <= keep_last_turns {
        return (Vec::new(), messages.to_vec());
    }
    let split_at = turns.len() - keep_last_turns;
    let to_compact = turns[..split_at].iter().flatten().cloned().collect();
    let to_keep = turns[split_at..].iter().flatten().cloned().collect();
    (to_compact, to_keep)
}

async fn generate_summary(router: &LlmRouter, segment: &[Message]) -> Result<String> {
    let conversation = build_conversation_text(segment);

    let prompt = format!(
        "You are a conversation summarizer. Summarize the following conversation \
         history into a concise summary that preserves:\n\
         1. The current goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Important facts learned during the conversation\n\
         5. The outcome of any tool calls relevant to ongoing work\n\n\
         Be concise but preserve all actionable context. Write in present tense.\n\
         Omit greetings and pleasantries. Focus on substance.\n\n\
         CONVERSATION:\n{conversation}"
    );

    let req = ChatRequest {
        messages: vec![Message::user(prompt)],
        tools: vec![],
        temperature: Some(0.1),
        max_tokens: Some(2000),
        json_mode: false,
        model: None,
    };

    let resp = router.chat_for_role(ModelRole::Summarizer, req).await?;
    Ok(resp.content)
}

fn build_conversation_text(messages: &[Message]) -> String {
    let mut buf = String::new();
    for msg in messages {
        let role_label = match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        let text = match &msg.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(_) => msg.content.extract_all_text(),
        };
        buf.push_str(role_label);
        buf.push_str(": ");
        if text.len() > 2000 {
            buf.push_str(&text[..1000]);
            buf.push_str(" [...] ");
            buf.push_str(&text[text.len() - 500..]);
        } else {
            buf.push_str(&text);
        }
        buf.push('\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(max: usize, threshold: usize) -> MessageHistory {
        MessageHistory::new("s1", "be terse", max, threshold)
    }

    #[test]
    fn append_enforces_tail_cap() {
        let mut h = history(5, 3);
        for i in 0..10 {
            h.append(Message::user(format!("msg {i}")));
        }
        assert_eq!(h.len(), 5);
    }

    #[test]
    fn snapshot_all_includes_system_prompt() {
        let mut h = history(50, 40);
        h.append(Message::user("hi"));
        h.append(Message::assistant("hello"));
        let all = h.snapshot(-1);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].role, Role::System);
    }

    #[test]
    fn snapshot_n_returns_last_n_turns_with_tool_messages_attached() {
        let mut h = history(50, 40);
        h.append(Message::user("turn 1"));
        h.append(Message::assistant("reply 1"));
        h.append(Message::user("turn 2"));
        h.append(Message::assistant("calling a tool"));
        h.append(Message::tool_result("call_1", "tool output"));

        let snap = h.snapshot(1);
        // system prompt + assistant("calling a tool") + tool_result, since
        // the last turn started at the assistant message.
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].role, Role::System);
        assert_eq!(snap[2].role, Role::Tool);
    }

    #[test]
    fn needs_compression_respects_threshold() {
        let mut h = history(50, 3);
        assert!(!h.needs_compression());
        h.append(Message::user("a"));
        h.append(Message::assistant("b"));
        h.append(Message::user("c"));
        assert!(h.needs_compression());
    }

    #[test]
    fn split_for_compression_keeps_recent_turns_intact() {
        let mut messages = Vec::new();
        for i in 0..6 {
            messages.push(Message::user(format!("u{i}")));
            messages.push(Message::assistant(format!("a{i}")));
        }
        let (to_compact, to_keep) = split_for_compression(&messages, 2);
        // 12 turns total (each user+assistant pair is 2 turns); keep last 2 turns = 2 messages.
        assert_eq!(to_keep.len(), 2);
        assert_eq!(to_compact.len(), 10);
    }
}
