//! The planner: turns a mission plus the tool registry into a validated
//! `TodoList`, per spec §4.5.
//!
//! Protocol: compose a prompt enumerating tool schemas → call the LLM port
//! bound to the `Planner` role, requesting JSON mode → parse, retrying
//! with feedback on failure → normalize positions/dependencies → validate
//! the dependency DAG. Unknown `chosen_tool` names are recorded, never
//! rejected here — enforcement happens when the executor tries to act.

use ag_domain::plan::TodoList;
use ag_domain::trace::TraceEvent;
use ag_domain::{capability::ModelRole, Error, Result};
use ag_providers::router::LlmRouter;
use ag_providers::traits::ChatRequest;
use ag_tools::ToolRegistry;
use serde::Deserialize;

const MAX_PARSE_RETRIES: u32 = 2;

pub struct Planner<'a> {
    router: &'a LlmRouter,
    tools: &'a ToolRegistry,
}

/// The raw shape requested from the LLM — field names are part of the
/// wire-level contract and must not change independently of this struct.
#[derive(Debug, Deserialize)]
struct RawPlan {
    items: Vec<RawItem>,
    #[serde(default)]
    open_questions: Vec<String>,
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    position: usize,
    description: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    dependencies: Vec<usize>,
    #[serde(default)]
    chosen_tool: Option<String>,
    #[serde(default)]
    tool_input: Option<serde_json::Value>,
}

impl<'a> Planner<'a> {
    pub fn new(router: &'a LlmRouter, tools: &'a ToolRegistry) -> Self {
        Self { router, tools }
    }

    /// Produce a validated `TodoList` for `mission`, or a `PlanGeneration`/
    /// `PlanValidation` error after exhausting retries.
    pub async fn plan(&self, session_id: &str, mission: &str) -> Result<TodoList> {
        let mut feedback: Option<String> = None;

        for attempt in 0..=MAX_PARSE_RETRIES {
            let prompt = self.compose_prompt(mission, feedback.as_deref());
            let req = ChatRequest {
                messages: vec![ag_domain::message::Message::user(prompt)],
                tools: vec![],
                temperature: Some(0.2),
                max_tokens: Some(4096),
                json_mode: true,
                model: None,
            };

            let resp = self.router.chat_for_role(ModelRole::Planner, req).await?;

            match serde_json::from_str::<RawPlan>(&resp.content) {
                Ok(raw) => {
                    let list = self.build_and_validate(session_id, mission, raw)?;
                    return Ok(list);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "planner output failed to parse, retrying");
                    feedback = Some(format!(
                        "Your previous response failed to parse as the required JSON schema: {e}. \
                         Return ONLY a JSON object matching the schema, with no surrounding text."
                    ));
                }
            }
        }

        Err(Error::PlanGeneration(format!(
            "failed to parse a valid plan after {} attempts",
            MAX_PARSE_RETRIES + 1
        )))
    }

    fn build_and_validate(&self, session_id: &str, mission: &str, raw: RawPlan) -> Result<TodoList> {
        let items = raw
            .items
            .into_iter()
            .map(|r| ag_domain::plan::TodoItem {
                position: r.position,
                description: r.description,
                acceptance_criteria: r.acceptance_criteria,
                dependencies: r.dependencies,
                status: ag_domain::plan::TaskStatus::Pending,
                chosen_tool: r.chosen_tool,
                tool_input: r.tool_input,
                execution_result: None,
                attempts: 0,
            })
            .collect();

        let mut list = TodoList::new(mission, items);
        list.open_questions = raw.open_questions;
        list.notes = raw.notes;
        list.normalize();

        if let Err(e) = list.validate() {
            TraceEvent::PlanValidationFailed { session_id: session_id.to_string(), reason: e.to_string() }
                .emit();
            return Err(e);
        }

        TraceEvent::PlanGenerated {
            session_id: session_id.to_string(),
            todolist_id: list.id.clone(),
            item_count: list.items.len(),
            open_question_count: list.open_questions.len(),
        }
        .emit();

        Ok(list)
    }

    fn compose_prompt(&self, mission: &str, feedback: Option<&str>) -> String {
        let tool_lines: Vec<String> = self
            .tools
            .names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                format!(
                    "- {}: {}\n  parameters: {}",
                    tool.name(),
                    tool.description(),
                    tool.parameters_schema()
                )
            })
            .collect();

        let mut prompt = format!(
            "You are a planning assistant. Decompose the following mission into a \
             dependency-ordered list of tasks.\n\n\
             MISSION:\n{mission}\n\n\
             AVAILABLE TOOLS:\n{}\n\n\
             Return a JSON object with exactly these fields:\n\
             {{\n  \
               \"items\": [{{\"position\": int, \"description\": string, \
             \"acceptance_criteria\": [string], \"dependencies\": [int], \
             \"chosen_tool\": string|null, \"tool_input\": object|null}}],\n  \
               \"open_questions\": [string],\n  \
               \"notes\": string\n\
             }}\n\n\
             Positions may be in any order but must be unique. Dependencies reference \
             other items' positions. Do not include any text outside the JSON object.",
            if tool_lines.is_empty() { "(none)".to_string() } else { tool_lines.join("\n") }
        );

        if let Some(feedback) = feedback {
            prompt.push_str("\n\nFEEDBACK ON YOUR PREVIOUS ATTEMPT:\n");
            prompt.push_str(feedback);
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::capability::{LlmCapabilities, ToolSupport};
    use ag_domain::config::RoleConfig;
    use ag_domain::stream::Usage;
    use ag_providers::registry::ProviderRegistry;
    use ag_providers::traits::{ChatResponse, LlmProvider};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct StubProvider {
        response: String,
        capabilities: LlmCapabilities,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn complete(&self, _req: ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: self.response.clone(),
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

    struct EchoTool;

    #[async_trait]
    impl ag_tools::Tool for EchoTool {
        fn name(&self) -> &str {
            "web_fetch"
        }
        fn description(&self) -> &str {
            "fetches a URL"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "required": ["url"]})
        }
        async fn execute(&self, params: serde_json::Value) -> Result<ag_tools::ToolResult> {
            Ok(ag_tools::ToolResult::ok(params))
        }
    }

    fn router_with(response: &str) -> LlmRouter {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert(
            "stub".to_string(),
            Arc::new(StubProvider {
                response: response.to_string(),
                capabilities: LlmCapabilities {
                    supports_tools: ToolSupport::StrictJson,
                    supports_streaming: false,
                    supports_json_mode: true,
                    supports_vision: false,
                    context_window_tokens: None,
                    max_output_tokens: None,
                },
            }),
        );

        let mut role_configs = HashMap::new();
        role_configs.insert(
            "planner".to_string(),
            RoleConfig {
                model: "stub/stub-model".into(),
                require_tools: false,
                require_json: true,
                fallbacks: vec![],
            },
        );

        let mut role_models = HashMap::new();
        role_models.insert("planner".to_string(), "stub/stub-model".to_string());

        LlmRouter::new(ProviderRegistry::new(providers, role_models), role_configs, 5000)
    }

    fn tool_registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        reg
    }

    #[tokio::test]
    async fn parses_and_validates_a_well_formed_plan() {
        let response = json!({
            "items": [
                {"position": 0, "description": "fetch", "acceptance_criteria": ["200 status"], "dependencies": [], "chosen_tool": "web_fetch", "tool_input": {"url": "https://example.com"}},
                {"position": 1, "description": "summarize", "acceptance_criteria": ["summary produced"], "dependencies": [0]}
            ],
            "open_questions": [],
            "notes": "straightforward"
        })
        .to_string();

        let router = router_with(&response);
        let tools = tool_registry();
        let planner = Planner::new(&router, &tools);

        let list = planner.plan("s1", "fetch and summarize").await.unwrap();
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.items[1].dependencies, vec![0]);
    }

    #[tokio::test]
    async fn records_unknown_tool_without_rejecting_the_plan() {
        let response = json!({
            "items": [
                {"position": 0, "description": "do a thing", "acceptance_criteria": [], "dependencies": [], "chosen_tool": "not_a_real_tool"}
            ],
            "open_questions": [],
            "notes": ""
        })
        .to_string();

        let router = router_with(&response);
        let tools = tool_registry();
        let planner = Planner::new(&router, &tools);

        let list = planner.plan("s1", "do a thing").await.unwrap();
        assert_eq!(list.items[0].chosen_tool.as_deref(), Some("not_a_real_tool"));
    }

    #[tokio::test]
    async fn cyclic_dependencies_fail_validation() {
        let response = json!({
            "items": [
                {"position": 0, "description": "a", "acceptance_criteria": [], "dependencies": [1]},
                {"position": 1, "description": "b", "acceptance_criteria": [], "dependencies": [0]}
            ],
            "open_questions": [],
            "notes": ""
        })
        .to_string();

        let router = router_with(&response);
        let tools = tool_registry();
        let planner = Planner::new(&router, &tools);

        let err = planner.plan("s1", "circular mission").await.unwrap_err();
        assert!(matches!(err, Error::PlanValidation(_)));
    }

    #[tokio::test]
    async fn unparseable_output_fails_after_exhausting_retries() {
        let router = router_with("not json at all");
        let tools = tool_registry();
        let planner = Planner::new(&router, &tools);

        let err = planner.plan("s1", "anything").await.unwrap_err();
        assert!(matches!(err, Error::PlanGeneration(_)));
    }
}
