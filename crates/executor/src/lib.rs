//! The ReAct executor: the state machine that turns a validated `TodoList`
//! into tool invocations, one task at a time, per spec §4.6.
//!
//! `Executor::execute` and `Executor::answer` each spawn the run loop as a
//! background task and hand back a channel of [`AgentEvent`]s; the session
//! lock (`ag_sessions::SessionLockMap`) is held by that task for the whole
//! call, so concurrent calls against the same session serialize while
//! different sessions run independently (spec §5).

pub mod cancel;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use ag_domain::capability::ModelRole;
use ag_domain::config::ExecutorConfig;
use ag_domain::message::Message;
use ag_domain::plan::{TaskStatus, TodoList};
use ag_domain::session::SessionState;
use ag_domain::trace::TraceEvent;
use ag_domain::Result as DomainResult;
use ag_history::{CompressionOutcome, MessageHistory};
use ag_planner::Planner;
use ag_protocol::{ActionKind, AgentEvent};
use ag_providers::router::LlmRouter;
use ag_providers::traits::ChatRequest;
use ag_sessions::{SessionLockMap, StateStore};
use ag_tools::contract::invoke_safely;
use ag_tools::{EnvelopeConfig, ToolRegistry, ToolResult};

use cancel::{CancelMap, CancelToken};

/// Caller-recognized options for an `execute` call, per spec §6.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_steps: Option<usize>,
    pub tool_allowlist: Option<HashSet<String>>,
    pub user_context: Option<Value>,
    pub reset_on_terminal_plan: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_steps: None,
            tool_allowlist: None,
            user_context: None,
            reset_on_terminal_plan: true,
        }
    }
}

enum RunKind {
    NewMessage(String),
    Answer(String),
}

/// The shape requested from the LLM at each `Thinking` transition. Field
/// names are part of the wire-level contract (spec §6) and must not change
/// independently of this struct.
#[derive(Debug, Deserialize)]
struct RawThinking {
    thought: String,
    action: RawAction,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawAction {
    ToolCall { tool_name: String, arguments: Value },
    AskUser { question: String },
    Replan { reason: String },
    Complete { summary: String },
}

/// Turns a mission into tool invocations, one ReAct step at a time.
///
/// Must be held behind an `Arc` to call `execute`/`answer`, since each call
/// spawns the run loop as its own task.
pub struct Executor {
    router: Arc<LlmRouter>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn StateStore>,
    locks: SessionLockMap,
    cancels: CancelMap,
    histories: Mutex<HashMap<String, MessageHistory>>,
    plans: Mutex<HashMap<String, TodoList>>,
    config: ExecutorConfig,
    envelope: EnvelopeConfig,
    system_prompt: String,
}

impl Executor {
    pub fn new(
        router: Arc<LlmRouter>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn StateStore>,
        config: ExecutorConfig,
    ) -> Self {
        let envelope = EnvelopeConfig {
            timeout: Duration::from_secs(config.tool_timeout_sec),
            max_attempts: config.max_attempts,
            ..EnvelopeConfig::default()
        };

        Self {
            router,
            tools,
            store,
            locks: SessionLockMap::new(),
            cancels: CancelMap::new(),
            histories: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            config,
            envelope,
            system_prompt: "You are an autonomous agent. You complete missions by decomposing \
                             them into tasks and invoking tools one task at a time."
                .to_string(),
        }
    }

    /// Start or continue a mission on `session_id`. Per spec §4.6, if the
    /// session's current plan is terminal and `options.reset_on_terminal_plan`
    /// is set (the default), plan-related state is reset and a fresh plan is
    /// generated for the new mission; the message history carries over
    /// unchanged.
    pub fn execute(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        user_message: impl Into<String>,
        options: ExecuteOptions,
    ) -> mpsc::Receiver<AgentEvent> {
        self.spawn_run(session_id.into(), RunKind::NewMessage(user_message.into()), options)
    }

    /// Resume a session parked in `AwaitingUser`.
    pub fn answer(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        text: impl Into<String>,
    ) -> mpsc::Receiver<AgentEvent> {
        self.spawn_run(session_id.into(), RunKind::Answer(text.into()), ExecuteOptions::default())
    }

    /// Cooperatively cancel the in-flight call for a session, if any.
    /// Returns `true` if a running call was found.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.cancels.cancel(session_id)
    }

    fn spawn_run(
        self: &Arc<Self>,
        session_id: String,
        kind: RunKind,
        options: ExecuteOptions,
    ) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(64);
        let this = Arc::clone(self);
        let token = this.cancels.register(&session_id);

        tokio::spawn(async move {
            this.run_session(session_id.clone(), kind, options, tx, token).await;
            this.cancels.remove(&session_id);
        });

        rx
    }

    /// Acquire the session lock for the whole call (spec §5), load state and
    /// history, apply the reset/answer preamble, then drive the state
    /// machine until the stream yields control back to the caller.
    async fn run_session(
        &self,
        session_id: String,
        kind: RunKind,
        options: ExecuteOptions,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancelToken,
    ) {
        let _permit = self.locks.acquire(&session_id).await;

        let mut state = match self.store.load(&session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => SessionState::new(&session_id),
            Err(e) => {
                let _ = tx
                    .send(AgentEvent::Error {
                        kind: "state_consistency_error".into(),
                        message: e.to_string(),
                        recoverable: false,
                    })
                    .await;
                return;
            }
        };

        let mut history = self.take_history(&session_id);

        match kind {
            RunKind::Answer(text) => {
                let Some(question) = state.pending_question.clone() else {
                    let _ = tx
                        .send(AgentEvent::Error {
                            kind: "validation_error".into(),
                            message: "session has no pending question to answer".into(),
                            recoverable: true,
                        })
                        .await;
                    self.put_history(session_id, history);
                    return;
                };
                state.answers.insert(question, text.clone());
                state.pending_question = None;
                history.append(Message::user(text));
            }
            RunKind::NewMessage(text) => {
                history.append(Message::user(text.clone()));

                if options.reset_on_terminal_plan
                    && !state.is_awaiting_user()
                    && self.plan_is_terminal(&state)
                {
                    TraceEvent::SessionReset {
                        session_id: session_id.clone(),
                        reason: "execute called on a terminal plan; resetting for new mission".into(),
                    }
                    .emit();
                    self.remove_plan(&state);
                    state.reset_plan();
                    let outcome = history.maybe_compress(&self.router).await;
                    self.report_compression(&state, outcome, &tx).await;
                }

                if state.mission.is_none() {
                    state.mission = Some(text);
                }
            }
        }

        self.drive(&session_id, &mut state, &mut history, &options, &tx, &cancel).await;

        self.put_history(session_id, history);
    }

    /// The Planning → Ready/Thinking/Acting/Observing loop. Returns once the
    /// call reaches `Done`, `Failed`, `AwaitingUser`, or is cancelled.
    async fn drive(
        &self,
        session_id: &str,
        state: &mut SessionState,
        history: &mut MessageHistory,
        options: &ExecuteOptions,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancelToken,
    ) {
        if state.todolist_id.is_none() {
            let mission = state.mission.clone().unwrap_or_default();
            if !self.plan_mission(session_id, state, &mission, tx).await {
                return;
            }
        }

        let max_steps = options.max_steps.unwrap_or(self.config.max_steps);
        let mut steps = 0usize;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            steps += 1;
            if steps > max_steps {
                let _ = tx
                    .send(AgentEvent::Error {
                        kind: "budget_exceeded_error".into(),
                        message: format!("step budget of {max_steps} exceeded"),
                        recoverable: false,
                    })
                    .await;
                return;
            }

            let outcome = history.maybe_compress(&self.router).await;
            self.report_compression(state, outcome, tx).await;

            let todolist_id = state.todolist_id.clone().expect("plan generated above");
            self.propagate_dependency_failures(&todolist_id);

            let eligible = self.eligible_positions(&todolist_id);
            let Some(&position) = eligible.first() else {
                self.finish_without_eligible_task(session_id, &todolist_id, state, tx).await;
                return;
            };

            match self.think(session_id, &todolist_id, position, history, options, tx).await {
                Some(ThinkOutcome::ToolCall { tool_name, arguments }) => {
                    self.act(session_id, &todolist_id, position, tool_name, arguments, history, options, tx)
                        .await;
                    self.persist(session_id, state, tx, "observation recorded").await;
                }
                Some(ThinkOutcome::AskUser { question }) => {
                    TraceEvent::Action { session_id: session_id.to_string(), task_position: Some(position), kind: "ask_user".into() }
                        .emit();
                    let _ = tx
                        .send(AgentEvent::Action { task_position: Some(position), kind: ActionKind::AskUser })
                        .await;
                    state.pending_question = Some(question.clone());
                    let _ = tx.send(AgentEvent::AskUser { question }).await;
                    self.persist(session_id, state, tx, "awaiting user").await;
                    return;
                }
                Some(ThinkOutcome::Replan { reason }) => {
                    TraceEvent::Action { session_id: session_id.to_string(), task_position: Some(position), kind: "replan".into() }
                        .emit();
                    let _ = tx
                        .send(AgentEvent::Action { task_position: Some(position), kind: ActionKind::Replan })
                        .await;
                    self.remove_plan(state);
                    state.reset_plan();
                    let mission = history_replan_mission(state, &reason);
                    state.mission = Some(mission.clone());
                    history.append(Message::user(format!("Replanning requested: {reason}")));
                    if !self.plan_mission(session_id, state, &mission, tx).await {
                        return;
                    }
                }
                Some(ThinkOutcome::Complete { summary }) => {
                    TraceEvent::Action { session_id: session_id.to_string(), task_position: Some(position), kind: "complete".into() }
                        .emit();
                    let _ = tx
                        .send(AgentEvent::Action { task_position: Some(position), kind: ActionKind::Complete })
                        .await;
                    let _ = tx.send(AgentEvent::Complete { summary }).await;
                    self.persist(session_id, state, tx, "complete").await;
                    return;
                }
                None => return,
            }
        }
    }

    /// Run the planner and either install the new plan or report the
    /// failure. Returns `false` if the call should stop.
    async fn plan_mission(
        &self,
        session_id: &str,
        state: &mut SessionState,
        mission: &str,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> bool {
        let planner = Planner::new(&self.router, &self.tools);
        match planner.plan(session_id, mission).await {
            Ok(list) => {
                state.todolist_id = Some(list.id.clone());
                self.plans.lock().insert(list.id.clone(), list);
                self.persist(session_id, state, tx, "plan generated").await;
                true
            }
            Err(e) => {
                let _ = tx
                    .send(AgentEvent::Error {
                        kind: "plan_generation_error".into(),
                        message: e.to_string(),
                        recoverable: false,
                    })
                    .await;
                false
            }
        }
    }

    /// The `Thinking` transition: prompt the executor role with the current
    /// task, parse the response, and emit `Thought`.
    async fn think(
        &self,
        session_id: &str,
        todolist_id: &str,
        position: usize,
        history: &mut MessageHistory,
        options: &ExecuteOptions,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Option<ThinkOutcome> {
        let prompt = self.compose_thinking_prompt(todolist_id, position, history);
        let req = ChatRequest {
            messages: vec![Message::user(prompt)],
            tools: vec![],
            temperature: options.temperature.or(Some(0.2)),
            max_tokens: Some(2048),
            json_mode: true,
            model: options.model.clone(),
        };

        let resp = match self.router.chat_for_role(ModelRole::Executor, req).await {
            Ok(r) => r,
            Err(e) => {
                let _ = tx
                    .send(AgentEvent::Error { kind: "provider_error".into(), message: e.to_string(), recoverable: true })
                    .await;
                return None;
            }
        };

        let thinking: RawThinking = match serde_json::from_str(&resp.content) {
            Ok(t) => t,
            Err(e) => {
                let _ = tx
                    .send(AgentEvent::Error {
                        kind: "validation_error".into(),
                        message: format!("executor response failed to parse: {e}"),
                        recoverable: false,
                    })
                    .await;
                return None;
            }
        };

        TraceEvent::Thought { session_id: session_id.to_string(), task_position: Some(position) }.emit();
        let _ = tx
            .send(AgentEvent::Thought { task_position: Some(position), content: thinking.thought.clone() })
            .await;
        history.append(Message::assistant(thinking.thought));

        Some(match thinking.action {
            RawAction::ToolCall { tool_name, arguments } => ThinkOutcome::ToolCall { tool_name, arguments },
            RawAction::AskUser { question } => ThinkOutcome::AskUser { question },
            RawAction::Replan { reason } => ThinkOutcome::Replan { reason },
            RawAction::Complete { summary } => ThinkOutcome::Complete { summary },
        })
    }

    /// The `Acting`/`Observing` transitions for a tool call: emit `Action`,
    /// run the tool through the envelope, record attempts/status on the
    /// task, and emit `Observation`.
    async fn act(
        &self,
        session_id: &str,
        todolist_id: &str,
        position: usize,
        tool_name: String,
        arguments: Value,
        history: &mut MessageHistory,
        options: &ExecuteOptions,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        TraceEvent::Action { session_id: session_id.to_string(), task_position: Some(position), kind: "tool_call".into() }
            .emit();
        let _ = tx
            .send(AgentEvent::Action {
                task_position: Some(position),
                kind: ActionKind::ToolCall { tool_name: tool_name.clone(), arguments: arguments.clone() },
            })
            .await;

        let recorded_arguments = arguments.clone();
        let result = if let Some(allowlist) = &options.tool_allowlist {
            if !allowlist.contains(&tool_name) {
                ToolResult::failure(format!("tool '{tool_name}' is not in the allowlist for this call"))
            } else {
                self.invoke_tool(&tool_name, arguments).await
            }
        } else {
            self.invoke_tool(&tool_name, arguments).await
        };

        history.append(Message::tool_result(&tool_name, &result.payload.to_string()));

        let attempts =
            self.record_observation(todolist_id, position, &tool_name, recorded_arguments, &result);
        TraceEvent::Observation {
            session_id: session_id.to_string(),
            task_position: position,
            success: result.success,
            attempts,
        }
        .emit();
        let _ = tx
            .send(AgentEvent::Observation { task_position: position, success: result.success, payload: result.payload, attempts })
            .await;
    }

    async fn invoke_tool(&self, tool_name: &str, arguments: Value) -> ToolResult {
        let Some(tool) = self.tools.get(tool_name) else {
            return ToolResult::failure(format!("no tool registered with name '{tool_name}'"));
        };
        invoke_safely(tool.as_ref(), arguments, self.envelope)
            .await
            .unwrap_or_else(|e| ToolResult::failure(e.to_string()))
    }

    /// No task is currently eligible: decide between `Done` and `Failed`.
    async fn finish_without_eligible_task(
        &self,
        session_id: &str,
        todolist_id: &str,
        state: &mut SessionState,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        let (terminal, failed) = {
            let plans = self.plans.lock();
            match plans.get(todolist_id) {
                Some(list) => (list.is_terminal(), list.has_failed()),
                None => (true, true),
            }
        };

        if terminal && !failed {
            let _ = tx.send(AgentEvent::Complete { summary: "all tasks completed".into() }).await;
        } else {
            let _ = tx
                .send(AgentEvent::Error {
                    kind: "budget_exceeded_error".into(),
                    message: "one or more tasks failed and no eligible task remains".into(),
                    recoverable: false,
                })
                .await;
        }

        self.persist(session_id, state, tx, "terminal").await;
    }

    /// Mark every still-pending task whose dependency closure includes a
    /// failed task as `Failed`, to a fixpoint. Spec §4.6 default policy is
    /// to propagate failure rather than auto-skip.
    fn propagate_dependency_failures(&self, todolist_id: &str) {
        let mut plans = self.plans.lock();
        let Some(list) = plans.get_mut(todolist_id) else { return };

        loop {
            let to_fail: Vec<usize> = list
                .items
                .iter()
                .filter(|i| i.status == TaskStatus::Pending && i.blocked_by_failure(&list.items))
                .map(|i| i.position)
                .collect();
            if to_fail.is_empty() {
                break;
            }
            for pos in to_fail {
                if let Some(item) = list.item_mut(pos) {
                    item.status = TaskStatus::Failed;
                }
            }
        }
    }

    fn eligible_positions(&self, todolist_id: &str) -> Vec<usize> {
        self.plans
            .lock()
            .get(todolist_id)
            .map(|l| l.eligible_positions())
            .unwrap_or_default()
    }

    /// Apply a tool outcome to the task's `chosen_tool`/`tool_input`/
    /// `attempts`/`status`, recording what actually ran rather than just
    /// what the planner guessed (spec §3). Returns the attempts count
    /// after this observation.
    fn record_observation(
        &self,
        todolist_id: &str,
        position: usize,
        tool_name: &str,
        arguments: Value,
        result: &ToolResult,
    ) -> u32 {
        let mut plans = self.plans.lock();
        let Some(list) = plans.get_mut(todolist_id) else { return 0 };
        let max_attempts = self.config.max_attempts;
        let Some(item) = list.item_mut(position) else { return 0 };

        item.chosen_tool = Some(tool_name.to_string());
        item.tool_input = Some(arguments);
        item.execution_result = Some(result.payload.clone());
        if result.success {
            item.status = TaskStatus::Completed;
        } else {
            item.attempts += 1;
            if item.attempts >= max_attempts {
                item.status = TaskStatus::Failed;
            }
        }
        item.attempts
    }

    fn plan_is_terminal(&self, state: &SessionState) -> bool {
        match &state.todolist_id {
            Some(id) => self.plans.lock().get(id).map(|l| l.is_terminal()).unwrap_or(true),
            None => true,
        }
    }

    fn remove_plan(&self, state: &SessionState) {
        if let Some(id) = &state.todolist_id {
            self.plans.lock().remove(id);
        }
    }

    fn compose_thinking_prompt(&self, todolist_id: &str, position: usize, history: &MessageHistory) -> String {
        let (task_desc, acceptance) = {
            let plans = self.plans.lock();
            let item = plans.get(todolist_id).and_then(|l| l.item(position));
            (
                item.map(|i| i.description.clone()).unwrap_or_default(),
                item.map(|i| i.acceptance_criteria.join("; ")).unwrap_or_default(),
            )
        };

        let tool_lines: Vec<String> = self
            .tools
            .names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect();

        let convo = render_messages(&history.snapshot(6));

        format!(
            "You are executing one task of a larger plan via a Thought/Action loop.\n\n\
             CURRENT TASK (position {position}): {task_desc}\n\
             ACCEPTANCE CRITERIA: {acceptance}\n\n\
             AVAILABLE TOOLS:\n{}\n\n\
             RECENT CONVERSATION:\n{convo}\n\n\
             Return a JSON object with exactly these fields:\n\
             {{\"thought\": string, \"action\": {{...}}}}\n\
             where \"action\" is exactly one of:\n\
             {{\"kind\": \"tool_call\", \"tool_name\": string, \"arguments\": object}}\n\
             {{\"kind\": \"ask_user\", \"question\": string}}\n\
             {{\"kind\": \"replan\", \"reason\": string}}\n\
             {{\"kind\": \"complete\", \"summary\": string}}\n\
             Do not include any text outside the JSON object.",
            if tool_lines.is_empty() { "(none)".to_string() } else { tool_lines.join("\n") }
        )
    }

    /// Save `state` (bumping its version through the store) and emit the
    /// corresponding `StateUpdate` event.
    async fn persist(&self, session_id: &str, state: &mut SessionState, tx: &mpsc::Sender<AgentEvent>, summary: &str) {
        match self.store.save(state.clone()).await {
            Ok(saved) => {
                state.version = saved.version;
                state.updated_at = saved.updated_at;
                let _ = tx.send(AgentEvent::StateUpdate { version: saved.version, summary: summary.to_string() }).await;
            }
            Err(e) => {
                let _ = tx
                    .send(AgentEvent::Error {
                        kind: "state_consistency_error".into(),
                        message: e.to_string(),
                        recoverable: false,
                    })
                    .await;
            }
        }
        let _ = session_id;
    }

    /// Surface a `maybe_compress` outcome to the caller. Per spec §4.3/§7,
    /// a compression run — including the `FallbackTailRetention` failure
    /// path — is reported as a `StateUpdate`, never as an `Error`; it never
    /// aborts execution.
    async fn report_compression(
        &self,
        state: &SessionState,
        outcome: DomainResult<CompressionOutcome>,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        let summary = match outcome {
            Ok(CompressionOutcome::NotNeeded) => return,
            Ok(CompressionOutcome::Compressed { before_len, after_len }) => {
                format!("history compressed: {before_len} -> {after_len} messages")
            }
            Ok(CompressionOutcome::FallbackTailRetention { before_len, after_len }) => {
                format!("compression failed, fell back to tail retention: {before_len} -> {after_len} messages")
            }
            Err(e) => format!("compression error: {e}"),
        };
        let _ = tx.send(AgentEvent::StateUpdate { version: state.version, summary }).await;
    }

    fn take_history(&self, session_id: &str) -> MessageHistory {
        if let Some(h) = self.histories.lock().remove(session_id) {
            return h;
        }
        MessageHistory::new(session_id, self.system_prompt.clone(), self.config.max_messages, self.config.summary_threshold)
    }

    fn put_history(&self, session_id: String, history: MessageHistory) {
        self.histories.lock().insert(session_id, history);
    }
}

enum ThinkOutcome {
    ToolCall { tool_name: String, arguments: Value },
    AskUser { question: String },
    Replan { reason: String },
    Complete { summary: String },
}

fn history_replan_mission(state: &SessionState, reason: &str) -> String {
    match &state.mission {
        Some(m) if !m.is_empty() => m.clone(),
        _ => format!("(mission lost; replanning on reason: {reason})"),
    }
}

fn render_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content.extract_all_text()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::capability::{LlmCapabilities, ToolSupport};
    use ag_domain::config::RoleConfig;
    use ag_domain::stream::Usage;
    use ag_domain::Result;
    use ag_providers::registry::ProviderRegistry;
    use ag_providers::traits::{ChatResponse, LlmProvider};
    use ag_sessions::InMemoryStateStore;
    use ag_tools::Tool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        responses: Mutex<Vec<String>>,
        capabilities: LlmCapabilities,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, _req: ChatRequest) -> Result<ChatResponse> {
            let content = {
                let mut responses = self.responses.lock();
                if responses.is_empty() {
                    "{}".to_string()
                } else {
                    responses.remove(0)
                }
            };
            Ok(ChatResponse {
                content,
                tool_calls: vec![],
                usage: Some(Usage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 }),
                model: "stub".into(),
                finish_reason: Some("stop".into()),
            })
        }
        fn capabilities(&self) -> &LlmCapabilities {
            &self.capabilities
        }
        fn provider_id(&self) -> &str {
            "stub"
        }
    }

    struct WebFetchTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for WebFetchTool {
        fn name(&self) -> &str {
            "web_fetch"
        }
        fn description(&self) -> &str {
            "fetches a URL"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "required": ["url"]})
        }
        async fn execute(&self, _params: Value) -> Result<ToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::ok(json!({"status": 200})))
        }
    }

    fn capable() -> LlmCapabilities {
        LlmCapabilities {
            supports_tools: ToolSupport::StrictJson,
            supports_streaming: false,
            supports_json_mode: true,
            supports_vision: false,
            context_window_tokens: None,
            max_output_tokens: None,
        }
    }

    fn router_scripted(responses: Vec<&str>) -> LlmRouter {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert(
            "stub".to_string(),
            Arc::new(ScriptedProvider {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                capabilities: capable(),
            }),
        );

        let mut role_configs = HashMap::new();
        for role in ["planner", "executor", "summarizer"] {
            role_configs.insert(
                role.to_string(),
                RoleConfig { model: "stub/stub-model".into(), require_tools: false, require_json: true, fallbacks: vec![] },
            );
        }

        let mut role_models = HashMap::new();
        for role in ["planner", "executor", "summarizer"] {
            role_models.insert(role.to_string(), "stub/stub-model".to_string());
        }

        LlmRouter::new(ProviderRegistry::new(providers, role_models), role_configs, 5000)
    }

    fn executor_with(router: LlmRouter, tools: ToolRegistry) -> Arc<Executor> {
        Arc::new(Executor::new(
            Arc::new(router),
            Arc::new(tools),
            Arc::new(InMemoryStateStore::new()),
            ExecutorConfig::default(),
        ))
    }

    async fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn single_tool_mission_completes() {
        let plan_response = json!({
            "items": [{"position": 0, "description": "fetch the page", "acceptance_criteria": ["200 status"], "dependencies": [], "chosen_tool": "web_fetch"}],
            "open_questions": [],
            "notes": ""
        }).to_string();
        let think_response = json!({
            "thought": "I should fetch the URL now.",
            "action": {"kind": "tool_call", "tool_name": "web_fetch", "arguments": {"url": "https://example.com"}}
        }).to_string();
        let complete_response = json!({
            "thought": "Done.",
            "action": {"kind": "complete", "summary": "fetched successfully"}
        }).to_string();

        let router = router_scripted(vec![&plan_response, &think_response, &complete_response]);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(WebFetchTool { calls: AtomicUsize::new(0) })).unwrap();

        let executor = executor_with(router, tools);
        let rx = executor.execute("s1", "Fetch https://example.com and report its status.", ExecuteOptions::default());
        let events = drain(rx).await;

        assert!(matches!(events.last(), Some(AgentEvent::Complete { .. })));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::Observation { success: true, .. })));
    }

    #[tokio::test]
    async fn retry_then_fail_marks_task_failed_after_max_attempts() {
        struct AlwaysFailTool;
        #[async_trait]
        impl Tool for AlwaysFailTool {
            fn name(&self) -> &str {
                "flaky"
            }
            fn description(&self) -> &str {
                "always fails"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _params: Value) -> Result<ToolResult> {
                Ok(ToolResult::failure("nope"))
            }
        }

        let plan_response = json!({
            "items": [{"position": 0, "description": "do a flaky thing", "acceptance_criteria": [], "dependencies": [], "chosen_tool": "flaky"}],
            "open_questions": [],
            "notes": ""
        }).to_string();
        let think_response = json!({
            "thought": "trying",
            "action": {"kind": "tool_call", "tool_name": "flaky", "arguments": {}}
        }).to_string();

        let router = router_scripted(vec![
            &plan_response,
            &think_response,
            &think_response,
            &think_response,
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(AlwaysFailTool)).unwrap();

        let executor = executor_with(router, tools);
        let rx = executor.execute("s1", "do the flaky thing", ExecuteOptions::default());
        let events = drain(rx).await;

        let observations: Vec<&AgentEvent> =
            events.iter().filter(|e| matches!(e, AgentEvent::Observation { .. })).collect();
        assert_eq!(observations.len(), 3);
        if let AgentEvent::Observation { attempts, success, .. } = observations[2] {
            assert_eq!(*attempts, 3);
            assert!(!success);
        }
        assert!(matches!(events.last(), Some(AgentEvent::Error { .. })));
    }

    #[tokio::test]
    async fn ask_user_then_answer_resumes_the_plan() {
        let plan_response = json!({
            "items": [{"position": 0, "description": "find the repo", "acceptance_criteria": [], "dependencies": []}],
            "open_questions": [],
            "notes": ""
        }).to_string();
        let ask_response = json!({
            "thought": "I need more info.",
            "action": {"kind": "ask_user", "question": "Which repo?"}
        }).to_string();
        let complete_response = json!({
            "thought": "Got it.",
            "action": {"kind": "complete", "summary": "resolved"}
        }).to_string();

        let router = router_scripted(vec![&plan_response, &ask_response, &complete_response]);
        let tools = ToolRegistry::new();
        let executor = executor_with(router, tools);

        let events = drain(executor.execute("s1", "Find the right repo.", ExecuteOptions::default())).await;
        assert!(matches!(events.last(), Some(AgentEvent::AskUser { .. })));

        let events = drain(executor.answer("s1", "acme/widgets")).await;
        assert!(matches!(events.last(), Some(AgentEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn dependency_ordering_blocks_second_task_until_first_completes() {
        let plan_response = json!({
            "items": [
                {"position": 0, "description": "get x", "acceptance_criteria": [], "dependencies": [], "chosen_tool": "web_fetch"},
                {"position": 1, "description": "summarize x", "acceptance_criteria": [], "dependencies": [0]}
            ],
            "open_questions": [],
            "notes": ""
        }).to_string();
        let think0 = json!({
            "thought": "fetching x",
            "action": {"kind": "tool_call", "tool_name": "web_fetch", "arguments": {"url": "https://x"}}
        }).to_string();
        let think1 = json!({
            "thought": "summarizing",
            "action": {"kind": "complete", "summary": "done"}
        }).to_string();

        let router = router_scripted(vec![&plan_response, &think0, &think1]);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(WebFetchTool { calls: AtomicUsize::new(0) })).unwrap();

        let executor = executor_with(router, tools);
        let events = drain(executor.execute("s1", "Get X then summarize X.", ExecuteOptions::default())).await;

        let thoughts: Vec<&AgentEvent> = events.iter().filter(|e| matches!(e, AgentEvent::Thought { .. })).collect();
        if let AgentEvent::Thought { task_position, .. } = thoughts[0] {
            assert_eq!(*task_position, Some(0));
        }
        assert!(matches!(events.last(), Some(AgentEvent::Complete { .. })));
    }
}
