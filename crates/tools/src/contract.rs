//! The uniform tool invocation envelope: schema validation, timeout,
//! exponential-backoff retry, and result-shape coercion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ag_domain::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool a planner can choose and the executor can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema describing the shape of `params` accepted by `execute`.
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, params: Value) -> Result<ToolResult>;
}

/// The coerced result shape every tool invocation produces, regardless of
/// what the underlying tool returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(payload: Value) -> Self {
        Self { success: true, payload, error: None }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, payload: Value::Null, error: Some(message.into()) }
    }

    /// Coerce an arbitrary tool return value into the `{success, ...}` shape.
    /// A bare JSON object gains `success: true` if it lacks the field; any
    /// other JSON value is wrapped as the payload of a successful result.
    fn coerce(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                let success = map
                    .remove("success")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let error = map.remove("error").and_then(|v| v.as_str().map(String::from));
                Self { success, payload: Value::Object(map), error }
            }
            other => Self { success: true, payload: other, error: None },
        }
    }
}

/// Retry/timeout tunables for [`invoke_safely`], mirroring `ExecutorConfig`'s
/// tool-facing fields.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_factor: u32,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_factor: 2,
        }
    }
}

/// Name → tool lookup. Registration rejects duplicate names so a planner's
/// `chosen_tool` always resolves unambiguously.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(Error::Config(format!("tool '{name}' already registered")));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}

/// Validate `params` against the tool's declared schema. This checks only
/// that declared-required top-level properties are present; full JSON
/// Schema validation is out of scope.
fn validate_params(tool: &dyn Tool, params: &Value) -> Result<()> {
    let schema = tool.parameters_schema();
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    for field in required {
        let Some(field) = field.as_str() else { continue };
        if params.get(field).is_none() {
            return Err(Error::Validation(format!(
                "missing required parameter '{field}' for tool '{}'",
                tool.name()
            )));
        }
    }
    Ok(())
}

/// Run `tool` against `params`, applying schema validation, a timeout, and
/// exponential-backoff retry on retryable failures. The returned
/// [`ToolResult`] is always in the coerced `{success, payload, error}` shape.
pub async fn invoke_safely(
    tool: &dyn Tool,
    params: Value,
    config: EnvelopeConfig,
) -> Result<ToolResult> {
    validate_params(tool, &params)?;

    let mut attempt = 0u32;
    let mut delay = config.backoff_base;

    loop {
        attempt += 1;
        let outcome = tokio::time::timeout(config.timeout, tool.execute(params.clone())).await;

        let err = match outcome {
            Ok(Ok(result)) => return Ok(ToolResult::coerce(serde_json::to_value(result)?)),
            Ok(Err(err)) => err,
            Err(_) => Error::Timeout(config.timeout),
        };

        if !err.is_retryable() || attempt >= config.max_attempts {
            return Ok(ToolResult::failure(format!(
                "tool '{}' failed after {attempt} attempt(s): {err}",
                tool.name()
            )));
        }

        tracing::warn!(
            tool = tool.name(),
            attempt,
            error = %err,
            "retrying tool invocation"
        );
        tokio::time::sleep(delay).await;
        delay *= config.backoff_factor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input back as the payload"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "required": ["text"]})
        }
        async fn execute(&self, params: Value) -> Result<ToolResult> {
            Ok(ToolResult::ok(params))
        }
    }

    struct FlakyTool {
        failures_before_success: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails a fixed number of times before succeeding"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _params: Value) -> Result<ToolResult> {
            use std::sync::atomic::Ordering;
            if self.failures_before_success.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(Error::Provider {
                    provider: "test".into(),
                    message: "transient".into(),
                });
            }
            Ok(ToolResult::ok(json!({"done": true})))
        }
    }

    fn fast_config() -> EnvelopeConfig {
        EnvelopeConfig {
            timeout: Duration::from_millis(50),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_factor: 2,
        }
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        let err = reg.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn missing_required_param_is_rejected_before_execute() {
        let err = invoke_safely(&EchoTool, json!({}), fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn successful_invocation_is_coerced_to_success_true() {
        let result = invoke_safely(&EchoTool, json!({"text": "hi"}), fast_config())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.payload["text"], "hi");
    }

    #[tokio::test]
    async fn retries_until_success_within_max_attempts() {
        let tool = FlakyTool {
            failures_before_success: std::sync::atomic::AtomicU32::new(2),
        };
        let result = invoke_safely(&tool, json!({}), fast_config()).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn exhausting_retries_yields_a_failure_result_not_an_error() {
        let tool = FlakyTool {
            failures_before_success: std::sync::atomic::AtomicU32::new(10),
        };
        let result = invoke_safely(&tool, json!({}), fast_config()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
